//! Keyed station configuration
//!
//! OCPP configuration keys with the three flags the protocol cares about:
//! `readonly` (ChangeConfiguration rejects writes), `visible`
//! (GetConfiguration omits the key), `reboot` (mutation requires a reset to
//! take effect).

use ocsim_messages::v16::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Well-known OCPP 1.6 standard keys the runtime reads back.
pub mod keys {
    pub const HEARTBEAT_INTERVAL: &str = "HeartbeatInterval";
    pub const METER_VALUE_SAMPLE_INTERVAL: &str = "MeterValueSampleInterval";
    pub const METER_VALUES_SAMPLED_DATA: &str = "MeterValuesSampledData";
    pub const NUMBER_OF_CONNECTORS: &str = "NumberOfConnectors";
    pub const SUPPORTED_FEATURE_PROFILES: &str = "SupportedFeatureProfiles";
    pub const AUTHORIZE_REMOTE_TX_REQUESTS: &str = "AuthorizeRemoteTxRequests";
    pub const LOCAL_AUTH_LIST_ENABLED: &str = "LocalAuthListEnabled";
    pub const CONNECTION_TIMEOUT: &str = "ConnectionTimeOut";
    pub const WEB_SOCKET_PING_INTERVAL: &str = "WebSocketPingInterval";
}

/// One configuration entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationKey {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub reboot: bool,
}

fn default_true() -> bool {
    true
}

/// Outcome of a `set_value` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValueOutcome {
    Accepted,
    /// Accepted, and the station must be reset before the change applies.
    RebootRequired,
    /// The key is readonly.
    Rejected,
    /// No such key.
    NotSupported,
}

/// The station's keyed configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigurationStore {
    configuration_key: Vec<ConfigurationKey>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(configuration_key: Vec<ConfigurationKey>) -> Self {
        Self { configuration_key }
    }

    /// Add a key. An existing key is left untouched unless `overwrite`.
    pub fn add(&mut self, entry: ConfigurationKey, overwrite: bool) {
        match self.position(&entry.key) {
            Some(idx) if overwrite => {
                debug!(key = %entry.key, "overwriting configuration key");
                self.configuration_key[idx] = entry;
            }
            Some(_) => {}
            None => self.configuration_key.push(entry),
        }
    }

    pub fn get(&self, key: &str) -> Option<&ConfigurationKey> {
        self.configuration_key.iter().find(|k| k.key == key)
    }

    /// Parse a key's value; `None` when absent or unparsable.
    pub fn get_as<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|k| k.value.parse().ok())
    }

    /// Change a key's value, honoring the readonly flag.
    pub fn set_value(&mut self, key: &str, value: impl Into<String>) -> SetValueOutcome {
        match self.position(key) {
            Some(idx) => {
                let entry = &mut self.configuration_key[idx];
                if entry.readonly {
                    return SetValueOutcome::Rejected;
                }
                entry.value = value.into();
                if entry.reboot {
                    SetValueOutcome::RebootRequired
                } else {
                    SetValueOutcome::Accepted
                }
            }
            None => SetValueOutcome::NotSupported,
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        match self.position(key) {
            Some(idx) => {
                self.configuration_key.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Entries exposed through GetConfiguration, optionally filtered by the
    /// requested key names. Returns `(known, unknown)`.
    pub fn visible_keys(&self, requested: Option<&[String]>) -> (Vec<KeyValue>, Vec<String>) {
        match requested {
            None => {
                let known = self
                    .configuration_key
                    .iter()
                    .filter(|k| k.visible)
                    .map(key_value)
                    .collect();
                (known, Vec::new())
            }
            Some(names) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for name in names {
                    match self.get(name).filter(|k| k.visible) {
                        Some(entry) => known.push(key_value(entry)),
                        None => unknown.push(name.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }

    pub fn keys(&self) -> &[ConfigurationKey] {
        &self.configuration_key
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.configuration_key.iter().position(|k| k.key == key)
    }
}

fn key_value(entry: &ConfigurationKey) -> KeyValue {
    KeyValue {
        key: entry.key.clone(),
        readonly: entry.readonly,
        value: Some(entry.value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &str) -> ConfigurationKey {
        ConfigurationKey {
            key: key.into(),
            value: value.into(),
            readonly: false,
            visible: true,
            reboot: false,
        }
    }

    #[test]
    fn add_respects_overwrite_flag() {
        let mut store = ConfigurationStore::new();
        store.add(entry(keys::HEARTBEAT_INTERVAL, "300"), false);
        store.add(entry(keys::HEARTBEAT_INTERVAL, "600"), false);
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "300");

        store.add(entry(keys::HEARTBEAT_INTERVAL, "600"), true);
        assert_eq!(store.get(keys::HEARTBEAT_INTERVAL).unwrap().value, "600");
    }

    #[test]
    fn set_value_outcomes() {
        let mut store = ConfigurationStore::new();
        store.add(entry(keys::HEARTBEAT_INTERVAL, "300"), false);
        store.add(
            ConfigurationKey {
                readonly: true,
                ..entry(keys::NUMBER_OF_CONNECTORS, "2")
            },
            false,
        );
        store.add(
            ConfigurationKey {
                reboot: true,
                ..entry("AuthorizationCacheEnabled", "true")
            },
            false,
        );

        assert_eq!(
            store.set_value(keys::HEARTBEAT_INTERVAL, "60"),
            SetValueOutcome::Accepted
        );
        assert_eq!(store.get_as::<u64>(keys::HEARTBEAT_INTERVAL), Some(60));
        assert_eq!(
            store.set_value(keys::NUMBER_OF_CONNECTORS, "4"),
            SetValueOutcome::Rejected
        );
        assert_eq!(
            store.set_value("AuthorizationCacheEnabled", "false"),
            SetValueOutcome::RebootRequired
        );
        assert_eq!(
            store.set_value("NoSuchKey", "x"),
            SetValueOutcome::NotSupported
        );
    }

    #[test]
    fn invisible_keys_are_hidden() {
        let mut store = ConfigurationStore::new();
        store.add(entry(keys::HEARTBEAT_INTERVAL, "300"), false);
        store.add(
            ConfigurationKey {
                visible: false,
                ..entry("AuthorizationKey", "secret")
            },
            false,
        );

        let (known, unknown) = store.visible_keys(None);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].key, keys::HEARTBEAT_INTERVAL);
        assert!(unknown.is_empty());

        // An invisible key behaves like an unknown key when asked for by name.
        let names = vec!["AuthorizationKey".to_string()];
        let (known, unknown) = store.visible_keys(Some(&names));
        assert!(known.is_empty());
        assert_eq!(unknown, names);
    }

    #[test]
    fn delete() {
        let mut store = ConfigurationStore::new();
        store.add(entry("A", "1"), false);
        assert!(store.delete("A"));
        assert!(!store.delete("A"));
        assert!(store.get("A").is_none());
    }
}
