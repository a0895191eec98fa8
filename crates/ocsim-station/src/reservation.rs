//! Connector reservations
//!
//! Reservation state lives on the connectors; the functions here implement
//! the lifecycle rules and report which connectors need a StatusNotification
//! so the runtime can emit them. Connector 0 reservations hold the station as
//! a whole and are never announced per-connector.

use crate::connectors::ConnectorModel;
use chrono::{DateTime, Utc};
use ocsim_types::{ConnectorId, ConnectorStatus, ReservationId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A reservation created by ReserveNow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub connector_id: ConnectorId,
    pub id_tag: String,
    pub expiry_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

/// Why a reservation is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationTerminationReason {
    Expired,
    ReservationCanceled,
    ReplaceExisting,
    ConnectorStateChanged,
    TransactionStarted,
}

impl ReservationTerminationReason {
    /// State-change reasons clear silently; the rest announce the connector
    /// as Available again.
    fn announces_available(&self) -> bool {
        !matches!(
            self,
            ReservationTerminationReason::ConnectorStateChanged
                | ReservationTerminationReason::TransactionStarted
        )
    }
}

/// A connector status change the runtime must announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub connector_id: ConnectorId,
    pub status: ConnectorStatus,
}

/// Attach a reservation, replacing any existing reservation with the same id.
pub fn add_reservation(model: &mut ConnectorModel, reservation: Reservation) -> Vec<StatusChange> {
    let mut changes = remove_reservation(
        model,
        reservation.reservation_id,
        ReservationTerminationReason::ReplaceExisting,
    );

    let connector_id = reservation.connector_id;
    info!(
        reservation_id = reservation.reservation_id,
        connector_id, "reservation added"
    );
    if let Some(connector) = model.connector_mut(connector_id) {
        connector.reservation = Some(reservation);
    }
    if connector_id > 0 {
        model.set_status(connector_id, ConnectorStatus::Reserved);
        changes.push(StatusChange {
            connector_id,
            status: ConnectorStatus::Reserved,
        });
    }
    changes
}

/// Remove the reservation with the given id, if any.
pub fn remove_reservation(
    model: &mut ConnectorModel,
    reservation_id: ReservationId,
    reason: ReservationTerminationReason,
) -> Vec<StatusChange> {
    let holder = model
        .iter()
        .find(|(_, c)| {
            c.reservation
                .as_ref()
                .is_some_and(|r| r.reservation_id == reservation_id)
        })
        .map(|(id, _)| id);

    let Some(connector_id) = holder else {
        return Vec::new();
    };

    debug!(reservation_id, connector_id, ?reason, "reservation removed");
    if let Some(connector) = model.connector_mut(connector_id) {
        connector.reservation = None;
    }

    if reason.announces_available() && connector_id > 0 {
        model.set_status(connector_id, ConnectorStatus::Available);
        vec![StatusChange {
            connector_id,
            status: ConnectorStatus::Available,
        }]
    } else {
        Vec::new()
    }
}

/// Whether a ReserveNow request can be honored.
pub fn is_connector_reservable(
    model: &ConnectorModel,
    reservation_id: ReservationId,
    id_tag: Option<&str>,
    connector_id: Option<ConnectorId>,
) -> bool {
    let id_exists = model.iter().any(|(_, c)| {
        c.reservation
            .as_ref()
            .is_some_and(|r| r.reservation_id == reservation_id)
    });
    if id_exists {
        return false;
    }

    if let Some(tag) = id_tag {
        let tag_has_reservation = model
            .iter()
            .any(|(_, c)| c.reservation.as_ref().is_some_and(|r| r.id_tag == tag));
        if tag_has_reservation {
            return false;
        }
    }

    if let Some(id) = connector_id {
        if id == 0 {
            return false;
        }
    }

    free_reservable_connectors(model) > 0
}

/// Chargeable connectors currently free to take a reservation.
fn free_reservable_connectors(model: &ConnectorModel) -> usize {
    model
        .iter()
        .filter(|(id, c)| {
            *id > 0
                && c.reservation.is_none()
                && !c.transaction.started
                && matches!(c.status, None | Some(ConnectorStatus::Available))
        })
        .count()
}

/// Reservation ids whose expiry date has passed.
pub fn expired_reservations(model: &ConnectorModel, now: DateTime<Utc>) -> Vec<ReservationId> {
    model
        .iter()
        .filter_map(|(_, c)| c.reservation.as_ref())
        .filter(|r| r.expiry_date < now)
        .map(|r| r.reservation_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::ConnectorState;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn model(count: u32) -> ConnectorModel {
        let mut map = BTreeMap::new();
        map.insert(0, ConnectorState::default());
        for id in 1..=count {
            let mut connector = ConnectorState::default();
            connector.status = Some(ConnectorStatus::Available);
            map.insert(id, connector);
        }
        ConnectorModel::with_connectors(map)
    }

    fn reservation(id: ReservationId, connector_id: ConnectorId, tag: &str) -> Reservation {
        Reservation {
            reservation_id: id,
            connector_id,
            id_tag: tag.into(),
            expiry_date: Utc::now() + Duration::hours(1),
            parent_id_tag: None,
        }
    }

    #[test]
    fn add_sets_reserved_status() {
        let mut m = model(2);
        let changes = add_reservation(&mut m, reservation(1, 1, "TAG-A"));
        assert_eq!(
            changes,
            vec![StatusChange {
                connector_id: 1,
                status: ConnectorStatus::Reserved
            }]
        );
        assert_eq!(
            m.connector(1).unwrap().status,
            Some(ConnectorStatus::Reserved)
        );
    }

    #[test]
    fn station_wide_reservation_is_silent() {
        let mut m = model(2);
        let changes = add_reservation(&mut m, reservation(1, 0, "TAG-A"));
        assert!(changes.is_empty());
        assert!(m.connector(0).unwrap().reservation.is_some());
    }

    #[test]
    fn same_id_replaces_existing() {
        let mut m = model(2);
        add_reservation(&mut m, reservation(1, 1, "TAG-A"));
        let changes = add_reservation(&mut m, reservation(1, 2, "TAG-B"));

        // Old holder announced Available, new holder Reserved.
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].connector_id, 1);
        assert_eq!(changes[0].status, ConnectorStatus::Available);
        assert_eq!(changes[1].connector_id, 2);
        assert_eq!(changes[1].status, ConnectorStatus::Reserved);
        assert!(m.connector(1).unwrap().reservation.is_none());
        assert!(m.connector(2).unwrap().reservation.is_some());
    }

    #[test]
    fn add_then_cancel_restores_status() {
        let mut m = model(1);
        let before = m.connector(1).unwrap().status;
        add_reservation(&mut m, reservation(1, 1, "TAG-A"));
        remove_reservation(&mut m, 1, ReservationTerminationReason::ReservationCanceled);
        assert_eq!(m.connector(1).unwrap().status, before);
    }

    #[test]
    fn state_changed_reasons_are_silent() {
        let mut m = model(1);
        add_reservation(&mut m, reservation(1, 1, "TAG-A"));
        let changes =
            remove_reservation(&mut m, 1, ReservationTerminationReason::TransactionStarted);
        assert!(changes.is_empty());
        assert!(m.connector(1).unwrap().reservation.is_none());
        // Status stays Reserved until the transaction path updates it.
        assert_eq!(
            m.connector(1).unwrap().status,
            Some(ConnectorStatus::Reserved)
        );
    }

    #[test]
    fn reservable_checks() {
        let mut m = model(2);
        assert!(is_connector_reservable(&m, 1, Some("TAG-A"), Some(1)));

        add_reservation(&mut m, reservation(1, 1, "TAG-A"));
        // Same id again: no.
        assert!(!is_connector_reservable(&m, 1, Some("TAG-B"), Some(2)));
        // Same tag on another id: no.
        assert!(!is_connector_reservable(&m, 2, Some("TAG-A"), Some(2)));
        // Connector 0 is never reservable through this check.
        assert!(!is_connector_reservable(&m, 2, Some("TAG-B"), Some(0)));
        // Other tag, free connector remains: yes.
        assert!(is_connector_reservable(&m, 2, Some("TAG-B"), Some(2)));

        add_reservation(&mut m, reservation(2, 2, "TAG-B"));
        // No free connector left.
        assert!(!is_connector_reservable(&m, 3, Some("TAG-C"), Some(2)));
    }

    #[test]
    fn expiry_sweep_finds_due_reservations() {
        let mut m = model(2);
        let mut due = reservation(1, 1, "TAG-A");
        due.expiry_date = Utc::now() - Duration::seconds(1);
        add_reservation(&mut m, due);
        add_reservation(&mut m, reservation(2, 2, "TAG-B"));

        let expired = expired_reservations(&m, Utc::now());
        assert_eq!(expired, vec![1]);

        let changes = remove_reservation(&mut m, 1, ReservationTerminationReason::Expired);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].status, ConnectorStatus::Available);
    }
}
