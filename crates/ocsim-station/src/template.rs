//! Station template document
//!
//! The JSON document a station is instantiated from. Field names follow the
//! template file convention (camelCase, with `Connectors`/`Evses`/
//! `Configuration`/`AutomaticTransactionGenerator` capitalized). Deprecated
//! keys are still parsed and rewritten by the reconciler.

use crate::config_store::ConfigurationKey;
use ocsim_types::{ConnectorStatus, CurrentType, OcppVersion};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unit of the template `power` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerUnit {
    #[default]
    W,
    #[serde(rename = "kW")]
    KW,
}

/// Firmware auto-upgrade settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpgrade {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_upgrade: Option<VersionUpgrade>,
    #[serde(default)]
    pub reset: bool,
}

/// Which pattern group to bump and by how much on upgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionUpgrade {
    #[serde(default = "default_step")]
    pub step: u32,
    #[serde(default = "default_pattern_group")]
    pub pattern_group: usize,
}

fn default_step() -> u32 {
    1
}

fn default_pattern_group() -> usize {
    3
}

/// Per-connector template block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_status: Option<ConnectorStatus>,
}

/// Per-EVSE template block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvseTemplate {
    #[serde(rename = "Connectors", default)]
    pub connectors: BTreeMap<String, ConnectorTemplate>,
}

/// Template `Configuration` block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfiguration {
    #[serde(default)]
    pub configuration_key: Vec<ConfigurationKey>,
}

/// Automatic transaction generator settings, persisted alongside the station
/// configuration when enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AtgConfiguration {
    #[serde(default)]
    pub enable: bool,
    /// Seconds a synthetic transaction lasts at minimum
    #[serde(default = "default_min_duration")]
    pub min_duration: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,
    /// Seconds between two synthetic transactions
    #[serde(default = "default_min_delay")]
    pub min_delay_between_two_transactions: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_between_two_transactions: u64,
    /// Chance in [0, 100] that a cycle starts a transaction
    #[serde(default = "default_probability")]
    pub probability_of_start: u8,
    #[serde(default)]
    pub stop_after_hours: Option<f64>,
    #[serde(default)]
    pub require_authorize: bool,
}

fn default_min_duration() -> u64 {
    60
}
fn default_max_duration() -> u64 {
    120
}
fn default_min_delay() -> u64 {
    180
}
fn default_max_delay() -> u64 {
    600
}
fn default_probability() -> u8 {
    100
}

impl Default for AtgConfiguration {
    fn default() -> Self {
        Self {
            enable: false,
            min_duration: default_min_duration(),
            max_duration: default_max_duration(),
            min_delay_between_two_transactions: default_min_delay(),
            max_delay_between_two_transactions: default_max_delay(),
            probability_of_start: default_probability(),
            stop_after_hours: None,
            require_authorize: false,
        }
    }
}

/// The station template document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationTemplate {
    pub base_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    #[serde(default)]
    pub fixed_name: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(default = "default_true")]
    pub random_serial_number: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_upgrade: Option<FirmwareUpgrade>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocpp_version: Option<OcppVersion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_out_type: Option<CurrentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_out: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_phases: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(default)]
    pub power_unit: PowerUnit,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_amperage: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_connectors: Option<u32>,
    #[serde(default)]
    pub random_connectors: bool,
    #[serde(default)]
    pub use_connector_id0: bool,
    #[serde(rename = "Connectors", skip_serializing_if = "Option::is_none")]
    pub connectors: Option<BTreeMap<String, ConnectorTemplate>>,
    #[serde(rename = "Evses", skip_serializing_if = "Option::is_none")]
    pub evses: Option<BTreeMap<String, EvseTemplate>>,

    #[serde(rename = "Configuration", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<TemplateConfiguration>,
    #[serde(
        rename = "AutomaticTransactionGenerator",
        skip_serializing_if = "Option::is_none"
    )]
    pub automatic_transaction_generator: Option<AtgConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_urls: Option<Vec<String>>,
    #[serde(default)]
    pub supervision_url_ocpp_configuration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url_ocpp_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amperage_limitation_ocpp_key: Option<String>,

    #[serde(default)]
    pub auto_register: bool,
    #[serde(default = "default_registration_retries")]
    pub registration_max_retries: i32,
    #[serde(default = "default_reconnect_retries")]
    pub auto_reconnect_max_retries: i32,
    #[serde(default)]
    pub reconnect_exponential_delay: bool,
    /// Stop the transaction generator while the connection is down
    #[serde(default = "default_true")]
    pub stop_on_connection_failure: bool,
    /// Seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Seconds
    #[serde(default = "default_reset_time")]
    pub reset_time: u64,

    #[serde(default)]
    pub begin_end_meter_values: bool,
    #[serde(default = "default_true")]
    pub ocpp_strict_compliance: bool,
    #[serde(default)]
    pub out_of_order_end_meter_values: bool,
    #[serde(default = "default_true")]
    pub metering_per_transaction: bool,

    #[serde(default)]
    pub station_info_persistent_configuration: bool,
    #[serde(default = "default_true")]
    pub ocpp_persistent_configuration: bool,
    #[serde(default)]
    pub automatic_transaction_generator_persistent_configuration: bool,
    #[serde(default)]
    pub enable_statistics: bool,
    #[serde(default = "default_true")]
    pub stop_transactions_on_stopped: bool,
    #[serde(default)]
    pub power_shared_by_connectors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tags_file: Option<String>,
    #[serde(default = "default_true")]
    pub remote_authorization: bool,

    // Deprecated keys, rewritten by the reconciler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_schema_validation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_authorize_at_remote_start: Option<bool>,
}

fn default_true() -> bool {
    true
}
fn default_registration_retries() -> i32 {
    -1
}
fn default_reconnect_retries() -> i32 {
    -1
}
fn default_connection_timeout() -> u64 {
    30
}
fn default_reset_time() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_template_parses_with_defaults() {
        let json = r#"{
            "baseName": "CS-TEST",
            "supervisionUrls": ["ws://localhost:8010/ocpp"],
            "numberOfConnectors": 2,
            "Connectors": {"0": {}, "1": {"bootStatus": "Available"}}
        }"#;
        let template: StationTemplate = serde_json::from_str(json).unwrap();
        assert_eq!(template.base_name, "CS-TEST");
        assert_eq!(template.registration_max_retries, -1);
        assert_eq!(template.connection_timeout, 30);
        assert!(template.ocpp_strict_compliance);
        assert!(template.random_serial_number);
        assert!(!template.auto_register);
        assert_eq!(
            template.connectors.as_ref().unwrap()["1"].boot_status,
            Some(ConnectorStatus::Available)
        );
    }

    #[test]
    fn power_unit_kw_spelling() {
        let template: StationTemplate = serde_json::from_str(
            r#"{"baseName": "CS", "power": 22, "powerUnit": "kW"}"#,
        )
        .unwrap();
        assert_eq!(template.power_unit, PowerUnit::KW);
    }

    #[test]
    fn deprecated_keys_are_parsed() {
        let json = r#"{
            "baseName": "CS",
            "supervisionUrl": "ws://old.example.com/ocpp",
            "authorizationFile": "tags.json",
            "mustAuthorizeAtRemoteStart": true
        }"#;
        let template: StationTemplate = serde_json::from_str(json).unwrap();
        assert!(template.supervision_url.is_some());
        assert_eq!(template.authorization_file.as_deref(), Some("tags.json"));
        assert_eq!(template.must_authorize_at_remote_start, Some(true));
    }

    #[test]
    fn atg_defaults() {
        let atg: AtgConfiguration = serde_json::from_str(r#"{"enable": true}"#).unwrap();
        assert!(atg.enable);
        assert_eq!(atg.probability_of_start, 100);
        assert_eq!(atg.min_duration, 60);
    }

    #[test]
    fn evse_template_parses() {
        let json = r#"{
            "baseName": "CS",
            "Evses": {
                "0": {"Connectors": {"0": {}}},
                "1": {"Connectors": {"1": {"bootStatus": "Preparing"}}}
            }
        }"#;
        let template: StationTemplate = serde_json::from_str(json).unwrap();
        let evses = template.evses.unwrap();
        assert_eq!(evses.len(), 2);
        assert_eq!(
            evses["1"].connectors["1"].boot_status,
            Some(ConnectorStatus::Preparing)
        );
    }
}
