//! Connector and EVSE state model
//!
//! Plain data guarded by the owning station's lock: every mutation happens in
//! the station's serialized context, so the states themselves carry no
//! synchronization. A station is built with either a flat connector map or an
//! EVSE map, never both.

use crate::reservation::Reservation;
use chrono::{DateTime, Utc};
use ocsim_types::{
    AvailabilityType, ChargingProfile, ConnectorStatus, ConnectorId, TransactionId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Transaction bookkeeping for one connector.
///
/// `id` and `started` move together: both set between StartTransaction and
/// StopTransaction, both clear outside that window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionState {
    pub id: Option<TransactionId>,
    pub started: bool,
    pub id_tag: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    /// Meter register at transaction begin, Wh
    pub meter_start: i64,
    /// Running energy register, Wh
    pub energy_register: i64,
    pub remote_started: bool,
}

impl TransactionState {
    pub fn begin(
        &mut self,
        id: TransactionId,
        id_tag: impl Into<String>,
        start_date: DateTime<Utc>,
        remote_started: bool,
    ) {
        self.id = Some(id);
        self.started = true;
        self.id_tag = Some(id_tag.into());
        self.start_date = Some(start_date);
        self.meter_start = self.energy_register;
        self.remote_started = remote_started;
    }

    pub fn end(&mut self) {
        self.id = None;
        self.started = false;
        self.id_tag = None;
        self.start_date = None;
        self.remote_started = false;
    }

    /// Invariant check: `id` set iff `started`.
    pub fn is_consistent(&self) -> bool {
        self.id.is_some() == self.started
    }
}

/// State of one connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorState {
    pub availability: AvailabilityType,
    pub status: Option<ConnectorStatus>,
    /// Status to report at bring-up, when the template declares one
    pub boot_status: Option<ConnectorStatus>,
    pub transaction: TransactionState,
    pub id_tag_local_authorized: bool,
    pub id_tag_authorized: bool,
    pub charging_profiles: Vec<ChargingProfile>,
    pub reservation: Option<Reservation>,
}

impl ConnectorState {
    /// Install a profile, replacing any profile with the same id or the same
    /// purpose at the same stack level.
    pub fn set_charging_profile(&mut self, profile: ChargingProfile) {
        self.charging_profiles.retain(|p| {
            p.charging_profile_id != profile.charging_profile_id
                && !(p.charging_profile_purpose == profile.charging_profile_purpose
                    && p.stack_level == profile.stack_level)
        });
        self.charging_profiles.push(profile);
    }
}

/// An EVSE: a group of connectors sharing availability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvseState {
    pub availability: AvailabilityType,
    pub connectors: BTreeMap<ConnectorId, ConnectorState>,
}

/// Either a flat connector map or an EVSE map.
#[derive(Debug, Clone)]
pub enum Topology {
    Connectors(BTreeMap<ConnectorId, ConnectorState>),
    Evses(BTreeMap<u32, EvseState>),
}

/// The station's connector model.
#[derive(Debug, Clone)]
pub struct ConnectorModel {
    topology: Topology,
}

impl ConnectorModel {
    pub fn with_connectors(connectors: BTreeMap<ConnectorId, ConnectorState>) -> Self {
        Self {
            topology: Topology::Connectors(connectors),
        }
    }

    pub fn with_evses(evses: BTreeMap<u32, EvseState>) -> Self {
        Self {
            topology: Topology::Evses(evses),
        }
    }

    pub fn uses_evses(&self) -> bool {
        matches!(self.topology, Topology::Evses(_))
    }

    pub fn connector(&self, id: ConnectorId) -> Option<&ConnectorState> {
        match &self.topology {
            Topology::Connectors(map) => map.get(&id),
            Topology::Evses(evses) => evses.values().find_map(|evse| evse.connectors.get(&id)),
        }
    }

    pub fn connector_mut(&mut self, id: ConnectorId) -> Option<&mut ConnectorState> {
        match &mut self.topology {
            Topology::Connectors(map) => map.get_mut(&id),
            Topology::Evses(evses) => evses
                .values_mut()
                .find_map(|evse| evse.connectors.get_mut(&id)),
        }
    }

    /// Iterate all connectors in id order, including connector 0 when present.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (ConnectorId, &ConnectorState)> + '_> {
        match &self.topology {
            Topology::Connectors(map) => Box::new(map.iter().map(|(id, c)| (*id, c))),
            Topology::Evses(evses) => Box::new(
                evses
                    .values()
                    .flat_map(|evse| evse.connectors.iter().map(|(id, c)| (*id, c))),
            ),
        }
    }

    /// Ids of the chargeable connectors (id > 0), in order.
    pub fn chargeable_ids(&self) -> Vec<ConnectorId> {
        self.iter().map(|(id, _)| id).filter(|id| *id > 0).collect()
    }

    /// Number of chargeable connectors (connector 0 excluded).
    pub fn number_of_connectors(&self) -> usize {
        self.chargeable_ids().len()
    }

    /// Number of EVSEs carrying chargeable connectors (EVSE 0 excluded).
    pub fn number_of_evses(&self) -> usize {
        match &self.topology {
            Topology::Connectors(_) => 0,
            Topology::Evses(evses) => evses.keys().filter(|id| **id > 0).count(),
        }
    }

    pub fn number_of_running_transactions(&self) -> usize {
        self.iter()
            .filter(|(id, c)| *id > 0 && c.transaction.started)
            .count()
    }

    /// Divider applied to the station's maximum power to obtain one
    /// connector's share.
    pub fn power_divider(&self, shared_by_connectors: bool) -> usize {
        let divider = if shared_by_connectors {
            self.number_of_running_transactions()
        } else if self.uses_evses() {
            self.number_of_evses()
        } else {
            self.number_of_connectors()
        };
        divider.max(1)
    }

    /// Find the evse id owning a connector (EVSE topology only).
    pub fn evse_of(&self, connector_id: ConnectorId) -> Option<u32> {
        match &self.topology {
            Topology::Connectors(_) => None,
            Topology::Evses(evses) => evses
                .iter()
                .find(|(_, evse)| evse.connectors.contains_key(&connector_id))
                .map(|(id, _)| *id),
        }
    }

    pub fn set_status(&mut self, connector_id: ConnectorId, status: ConnectorStatus) {
        if let Some(connector) = self.connector_mut(connector_id) {
            let previous = connector.status;
            connector.status = Some(status);
            if previous != Some(status) {
                debug!(connector_id, ?previous, ?status, "connector status changed");
            }
        }
    }
}
