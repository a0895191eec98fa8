//! Station lifecycle events
//!
//! Tagged events emitted over a broadcast channel for external observers
//! (dashboards, test harnesses). Emission is fire-and-forget: a station never
//! blocks on a slow observer.

use chrono::{DateTime, Utc};
use ocsim_types::{ConnectorId, ConnectorStatus, RegistrationStatus, TransactionId};
use serde::Serialize;
use tokio::sync::broadcast;

/// Events a station reports to the outside world.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum StationEvent {
    Started {
        station_id: String,
    },
    Stopped {
        station_id: String,
    },
    Connected {
        station_id: String,
    },
    Disconnected {
        station_id: String,
        reason: String,
    },
    /// A BootNotification round-trip completed.
    Registered {
        station_id: String,
        status: RegistrationStatus,
    },
    /// Registration reached Accepted.
    Accepted {
        station_id: String,
    },
    /// Persisted configuration was rewritten.
    Updated {
        station_id: String,
    },
    ConnectorStatusChanged {
        station_id: String,
        connector_id: ConnectorId,
        status: ConnectorStatus,
    },
    TransactionStarted {
        station_id: String,
        connector_id: ConnectorId,
        transaction_id: TransactionId,
        id_tag: String,
    },
    TransactionStopped {
        station_id: String,
        connector_id: ConnectorId,
        transaction_id: TransactionId,
    },
    ReservationExpired {
        station_id: String,
        connector_id: ConnectorId,
        reservation_id: i32,
        expiry_date: DateTime<Utc>,
    },
}

/// Broadcast fan-out for station events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.sender.subscribe()
    }

    /// Emit an event; observers that lag simply miss it.
    pub fn emit(&self, event: StationEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_reach_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(StationEvent::Started {
            station_id: "CS-0001".into(),
        });

        match rx.recv().await.unwrap() {
            StationEvent::Started { station_id } => assert_eq!(station_id, "CS-0001"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(StationEvent::Stopped {
            station_id: "CS-0001".into(),
        });
    }
}
