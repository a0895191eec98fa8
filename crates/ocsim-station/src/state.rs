//! State shared between the runtime and its collaborators
//!
//! The station behaves as one logical actor: every mutation of the info,
//! connector model, and configuration store goes through these locks, so
//! inbound-frame handlers, timers, and the runtime observe consistent state.

use crate::config_store::ConfigurationStore;
use crate::connectors::ConnectorModel;
use crate::reconcile::StationInfo;
use tokio::sync::RwLock;

/// The station's mutable core, shared by handle.
#[derive(Debug)]
pub struct SharedState {
    pub info: RwLock<StationInfo>,
    pub model: RwLock<ConnectorModel>,
    pub config: RwLock<ConfigurationStore>,
}

impl SharedState {
    pub fn new(info: StationInfo, model: ConnectorModel, config: ConfigurationStore) -> Self {
        Self {
            info: RwLock::new(info),
            model: RwLock::new(model),
            config: RwLock::new(config),
        }
    }
}
