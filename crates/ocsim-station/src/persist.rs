//! Configuration file persistence
//!
//! The station's sidecar configuration file is content addressed: the hash
//! over everything but the hash field itself is recomputed on every save and
//! an identical hash suppresses the write. Writes are serialized through the
//! shared `"configuration"` exclusion key.

use crate::config_store::ConfigurationKey;
use crate::error::{StationError, StationResult};
use crate::lock::KeyedMutex;
use crate::reconcile::{canonical_hash, StationInfo};
use crate::template::AtgConfiguration;
use chrono::{DateTime, Utc};
use ocsim_types::{ConnectorId, ConnectorStatus};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// Exclusion key under which configuration files are written.
pub const CONFIGURATION_LOCK_KEY: &str = "configuration";

/// Run state of the automatic transaction generator, persisted per connector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtgStatus {
    pub started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_date: Option<DateTime<Utc>>,
}

/// The configuration file contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfiguration {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_info: Option<StationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration_key: Option<Vec<ConfigurationKey>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator: Option<AtgConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator_statuses: Option<Vec<AtgStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connectors_status: Option<BTreeMap<ConnectorId, ConnectorStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub evses_status: Option<BTreeMap<u32, BTreeMap<ConnectorId, ConnectorStatus>>>,
}

impl PersistedConfiguration {
    /// Hash over every field except `configuration_hash` itself.
    pub fn content_hash(&self) -> String {
        let mut hashable = self.clone();
        hashable.configuration_hash = None;
        let doc = serde_json::to_value(&hashable).unwrap_or_default();
        canonical_hash(&doc)
    }
}

/// Read the configuration file. A missing file is not an error; a present
/// but unreadable one is (startup read errors are fatal).
pub async fn load(path: &Path) -> StationResult<Option<PersistedConfiguration>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => {
            let configuration: PersistedConfiguration = serde_json::from_str(&content)?;
            debug!(path = %path.display(), "configuration file loaded");
            Ok(Some(configuration))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StationError::ConfigurationFile(e)),
    }
}

/// Write the configuration file unless its content hash is unchanged.
/// Returns whether a write actually happened.
pub async fn save(
    path: &Path,
    configuration: &mut PersistedConfiguration,
    locks: &KeyedMutex,
) -> StationResult<bool> {
    let hash = configuration.content_hash();
    if configuration.configuration_hash.as_deref() == Some(hash.as_str()) {
        debug!(path = %path.display(), "configuration unchanged, skipping write");
        return Ok(false);
    }
    configuration.configuration_hash = Some(hash);

    let _guard = locks.acquire(CONFIGURATION_LOCK_KEY).await;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }
    let content = serde_json::to_string_pretty(&configuration)?;
    match tokio::fs::write(path, content).await {
        Ok(()) => {
            info!(path = %path.display(), "configuration file saved");
            Ok(true)
        }
        Err(e) => {
            // Periodic save errors are reported; the next cycle retries.
            warn!(path = %path.display(), error = %e, "configuration file write failed");
            configuration.configuration_hash = None;
            Err(StationError::ConfigurationFile(e))
        }
    }
}
