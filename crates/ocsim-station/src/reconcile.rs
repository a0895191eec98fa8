//! Template and configuration reconciliation
//!
//! Turns a template document plus an optional persisted configuration into a
//! fully-populated [`StationInfo`], the initial connector model, and the
//! configuration store. Lineage between the two documents is established by
//! the template content hash.

use crate::config_store::{keys, ConfigurationKey, ConfigurationStore};
use crate::connectors::{ConnectorModel, ConnectorState, EvseState};
use crate::error::{StationError, StationResult};
use crate::persist::PersistedConfiguration;
use crate::template::{AtgConfiguration, FirmwareUpgrade, PowerUnit, StationTemplate};
use ocsim_types::{
    units, ConnectorStatus, CurrentType, FirmwareStatus, OcppVersion,
};
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default firmware version pattern: plain semver.
pub const DEFAULT_FIRMWARE_VERSION_PATTERN: &str = r"^(\d+)\.(\d+)\.(\d+)$";

/// Resolved station identity and behavior flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    pub station_id: String,
    pub hash_id: String,
    pub template_hash: String,

    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    pub firmware_version_pattern: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_upgrade: Option<FirmwareUpgrade>,
    pub firmware_status: FirmwareStatus,

    pub ocpp_version: OcppVersion,
    pub current_out_type: CurrentType,
    pub voltage_out: u32,
    pub number_of_phases: u32,
    /// Watts
    pub maximum_power: f64,
    pub maximum_amperage: u32,
    pub use_connector_id0: bool,

    pub supervision_urls: Vec<String>,
    pub supervision_url_ocpp_configuration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url_ocpp_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amperage_limitation_ocpp_key: Option<String>,

    pub auto_register: bool,
    pub registration_max_retries: i32,
    pub auto_reconnect_max_retries: i32,
    pub reconnect_exponential_delay: bool,
    pub stop_on_connection_failure: bool,
    /// Seconds
    pub connection_timeout: u64,
    /// Seconds
    pub reset_time: u64,

    pub begin_end_meter_values: bool,
    pub ocpp_strict_compliance: bool,
    pub out_of_order_end_meter_values: bool,
    pub metering_per_transaction: bool,

    pub station_info_persistent_configuration: bool,
    pub ocpp_persistent_configuration: bool,
    pub automatic_transaction_generator_persistent_configuration: bool,
    pub enable_statistics: bool,
    pub stop_transactions_on_stopped: bool,
    pub power_shared_by_connectors: bool,
    pub remote_authorization: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tags_file: Option<String>,
}

/// Everything the reconciler produces for one station.
#[derive(Debug)]
pub struct Reconciled {
    pub info: StationInfo,
    pub model: ConnectorModel,
    pub config_store: ConfigurationStore,
    pub atg_configuration: Option<AtgConfiguration>,
}

/// Hex SHA-256 over the canonical rendering of a JSON document.
pub fn canonical_hash(doc: &Value) -> String {
    let canonical = serde_json::to_string(doc).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// Stable station identity hash over the template lineage and station id.
/// Also names the station's configuration file.
pub fn hash_id(template_hash: &str, station_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_hash.as_bytes());
    hasher.update(station_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Station id derived from the template naming fields and the instance index.
/// `CF_INSTANCE_INDEX` distinguishes replicas of the same fleet.
pub fn station_id(template: &StationTemplate, index: u32) -> String {
    if template.fixed_name {
        return template.base_name.clone();
    }
    let instance = std::env::var("CF_INSTANCE_INDEX").unwrap_or_default();
    let suffix = template.name_suffix.as_deref().unwrap_or("");
    format!("{}{}-{}{:04}", template.base_name, suffix, instance, index)
}

/// Run the full reconciliation over a parsed template document.
pub fn reconcile(
    template_doc: &Value,
    persisted: Option<&PersistedConfiguration>,
    index: u32,
) -> StationResult<Reconciled> {
    let template: StationTemplate = serde_json::from_value(template_doc.clone()).map_err(|e| {
        StationError::InvalidTemplate {
            path: String::new(),
            reason: e.to_string(),
        }
    })?;

    validate_topology(&template)?;
    let template_hash = canonical_hash(template_doc);

    let persisted_info = persisted.and_then(|p| p.station_info.as_ref());
    let lineage_matches = persisted_info.is_some_and(|info| info.template_hash == template_hash);

    let info = if lineage_matches && template.station_info_persistent_configuration {
        // Same template generation: the persisted info wins wholesale.
        debug!(hash = %template_hash, "persisted station info matches template lineage");
        persisted_info.cloned().ok_or_else(|| StationError::InvalidTemplate {
            path: String::new(),
            reason: "persisted station info vanished mid-reconcile".into(),
        })?
    } else {
        build_station_info(&template, &template_hash, index, persisted_info)?
    };

    let mut model = build_connector_model(&template)?;
    apply_persisted_statuses(&mut model, persisted);

    let config_store = build_configuration_store(&template, &info, &model, persisted);

    let atg_configuration = persisted
        .filter(|_| template.automatic_transaction_generator_persistent_configuration)
        .and_then(|p| p.automatic_transaction_generator.clone())
        .or_else(|| template.automatic_transaction_generator.clone());

    Ok(Reconciled {
        info,
        model,
        config_store,
        atg_configuration,
    })
}

fn validate_topology(template: &StationTemplate) -> StationResult<()> {
    match (&template.connectors, &template.evses) {
        (Some(_), Some(_)) => Err(StationError::ConnectorsAndEvses),
        (None, None) => Err(StationError::NoConnectors),
        _ => Ok(()),
    }
}

/// Build a fresh `StationInfo` from the template, carrying over persisted
/// serial numbers whose prefix still matches.
pub fn build_station_info(
    template: &StationTemplate,
    template_hash: &str,
    index: u32,
    persisted: Option<&StationInfo>,
) -> StationResult<StationInfo> {
    let station_id = station_id(template, index);
    let hash_id = hash_id(template_hash, &station_id);

    let supervision_urls = resolve_supervision_urls(template)?;
    warn_deprecated(template);

    let current_out_type = template.current_out_type.unwrap_or_default();
    let voltage_out = template
        .voltage_out
        .unwrap_or_else(|| current_out_type.default_voltage());
    let number_of_phases = template.number_of_phases.unwrap_or(match current_out_type {
        CurrentType::Ac => 3,
        CurrentType::Dc => 0,
    });

    let maximum_power = match (template.power, template.power_unit) {
        (Some(power), PowerUnit::KW) => power * 1000.0,
        (Some(power), PowerUnit::W) => power,
        (None, _) => match template.maximum_amperage {
            Some(amps) => units::amperage_to_watts(
                amps as f64,
                voltage_out,
                number_of_phases,
                current_out_type,
            ),
            None => {
                warn!(%station_id, "template declares no power rating, assuming 22 kW");
                22_000.0
            }
        },
    };
    let maximum_amperage = template.maximum_amperage.unwrap_or_else(|| {
        units::maximum_amperage(maximum_power, voltage_out, number_of_phases, current_out_type)
    });

    let firmware_version_pattern = template
        .firmware_version_pattern
        .clone()
        .unwrap_or_else(|| DEFAULT_FIRMWARE_VERSION_PATTERN.to_string());
    let mut firmware_version = template.firmware_version.clone();
    let mut firmware_status = FirmwareStatus::Installed;

    match Regex::new(&firmware_version_pattern) {
        Ok(pattern) => {
            if let Some(version) = &firmware_version {
                if !pattern.is_match(version) {
                    warn!(
                        %station_id,
                        %version,
                        pattern = %firmware_version_pattern,
                        "firmware version does not match its pattern"
                    );
                }
            }
            // A persisted Installing state means an upgrade was in flight:
            // apply the configured version bump before reporting Installed.
            if persisted.is_some_and(|p| p.firmware_status == FirmwareStatus::Installing) {
                firmware_status = FirmwareStatus::Installing;
                if let (Some(version), Some(upgrade)) = (
                    firmware_version.clone(),
                    template
                        .firmware_upgrade
                        .as_ref()
                        .and_then(|u| u.version_upgrade.as_ref()),
                ) {
                    if let Some(bumped) = bump_firmware_version(
                        &version,
                        &pattern,
                        upgrade.pattern_group,
                        upgrade.step,
                    ) {
                        debug!(%station_id, from = %version, to = %bumped, "firmware upgraded");
                        firmware_version = Some(bumped);
                    }
                }
            }
        }
        Err(e) => warn!(
            %station_id,
            pattern = %firmware_version_pattern,
            "invalid firmware version pattern: {e}"
        ),
    }

    let serial = |prefix: &Option<String>, persisted_value: Option<&String>| -> Option<String> {
        let prefix = prefix.as_deref()?;
        match persisted_value {
            // Keep the persisted serial while the template still declares the
            // same prefix; a prefix change invalidates it.
            Some(value) if value.starts_with(prefix) => Some(value.clone()),
            _ => Some(generate_serial_number(prefix, template.random_serial_number)),
        }
    };

    Ok(StationInfo {
        station_id,
        hash_id,
        template_hash: template_hash.to_string(),
        charge_point_vendor: template
            .charge_point_vendor
            .clone()
            .unwrap_or_else(|| "OCSIM".to_string()),
        charge_point_model: template
            .charge_point_model
            .clone()
            .unwrap_or_else(|| template.base_name.clone()),
        charge_point_serial_number: serial(
            &template.charge_point_serial_number_prefix,
            persisted.and_then(|p| p.charge_point_serial_number.as_ref()),
        ),
        charge_box_serial_number: serial(
            &template.charge_box_serial_number_prefix,
            persisted.and_then(|p| p.charge_box_serial_number.as_ref()),
        ),
        meter_serial_number: serial(
            &template.meter_serial_number_prefix,
            persisted.and_then(|p| p.meter_serial_number.as_ref()),
        ),
        meter_type: template.meter_type.clone(),
        firmware_version,
        firmware_version_pattern,
        firmware_upgrade: template.firmware_upgrade.clone(),
        firmware_status,
        ocpp_version: template.ocpp_version.unwrap_or(OcppVersion::V16),
        current_out_type,
        voltage_out,
        number_of_phases,
        maximum_power,
        maximum_amperage,
        use_connector_id0: template.use_connector_id0,
        supervision_urls,
        supervision_url_ocpp_configuration: template.supervision_url_ocpp_configuration,
        supervision_url_ocpp_key: template.supervision_url_ocpp_key.clone(),
        amperage_limitation_ocpp_key: template.amperage_limitation_ocpp_key.clone(),
        auto_register: template.auto_register,
        registration_max_retries: template.registration_max_retries,
        auto_reconnect_max_retries: template.auto_reconnect_max_retries,
        reconnect_exponential_delay: template.reconnect_exponential_delay,
        stop_on_connection_failure: template.stop_on_connection_failure,
        connection_timeout: template.connection_timeout,
        reset_time: template.reset_time,
        begin_end_meter_values: template.begin_end_meter_values,
        ocpp_strict_compliance: template.ocpp_strict_compliance,
        out_of_order_end_meter_values: template.out_of_order_end_meter_values,
        metering_per_transaction: template.metering_per_transaction,
        station_info_persistent_configuration: template.station_info_persistent_configuration,
        ocpp_persistent_configuration: template.ocpp_persistent_configuration,
        automatic_transaction_generator_persistent_configuration: template
            .automatic_transaction_generator_persistent_configuration,
        enable_statistics: template.enable_statistics,
        stop_transactions_on_stopped: template.stop_transactions_on_stopped,
        power_shared_by_connectors: template.power_shared_by_connectors,
        remote_authorization: resolve_remote_authorization(template),
        id_tags_file: template
            .id_tags_file
            .clone()
            .or_else(|| template.authorization_file.clone()),
    })
}

fn resolve_supervision_urls(template: &StationTemplate) -> StationResult<Vec<String>> {
    if let Some(urls) = &template.supervision_urls {
        if !urls.is_empty() {
            return Ok(urls.clone());
        }
    }
    // Deprecated singular key, either a string or an array.
    if let Some(value) = &template.supervision_url {
        warn!("template key 'supervisionUrl' is deprecated, use 'supervisionUrls'");
        let urls = match value {
            Value::String(url) => vec![url.clone()],
            Value::Array(items) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_owned)
                .collect(),
            _ => Vec::new(),
        };
        if !urls.is_empty() {
            return Ok(urls);
        }
    }
    Err(StationError::MissingSupervisionUrl)
}

fn resolve_remote_authorization(template: &StationTemplate) -> bool {
    if let Some(value) = template.must_authorize_at_remote_start {
        warn!(
            "template key 'mustAuthorizeAtRemoteStart' is deprecated, use 'remoteAuthorization'"
        );
        return value;
    }
    template.remote_authorization
}

fn warn_deprecated(template: &StationTemplate) {
    if template.authorization_file.is_some() {
        warn!("template key 'authorizationFile' is deprecated, use 'idTagsFile'");
    }
    if template.payload_schema_validation.is_some() {
        warn!("template key 'payloadSchemaValidation' is deprecated and ignored");
    }
}

/// Random-hex serial number for a template prefix.
fn generate_serial_number(prefix: &str, random: bool) -> String {
    if !random {
        return prefix.to_string();
    }
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| format!("{:X}", rng.gen_range(0..16)))
        .collect();
    format!("{prefix}{suffix}")
}

/// Bump the numbered capture group of `version` by `step`.
fn bump_firmware_version(
    version: &str,
    pattern: &Regex,
    group: usize,
    step: u32,
) -> Option<String> {
    let captures = pattern.captures(version)?;
    let matched = captures.get(group)?;
    let current: u64 = matched.as_str().parse().ok()?;
    let mut bumped = version.to_string();
    bumped.replace_range(matched.range(), &(current + step as u64).to_string());
    Some(bumped)
}

/// Build the initial connector or EVSE map from the template.
pub fn build_connector_model(template: &StationTemplate) -> StationResult<ConnectorModel> {
    validate_topology(template)?;

    if let Some(evse_templates) = &template.evses {
        let mut evses = BTreeMap::new();
        for (evse_key, evse_template) in evse_templates {
            let evse_id: u32 = evse_key.parse().map_err(|_| StationError::InvalidTemplate {
                path: String::new(),
                reason: format!("non-numeric EVSE id: {evse_key}"),
            })?;
            let mut connectors = BTreeMap::new();
            for (connector_key, connector_template) in &evse_template.connectors {
                let connector_id: u32 =
                    connector_key
                        .parse()
                        .map_err(|_| StationError::InvalidTemplate {
                            path: String::new(),
                            reason: format!("non-numeric connector id: {connector_key}"),
                        })?;
                connectors.insert(
                    connector_id,
                    ConnectorState {
                        boot_status: connector_template.boot_status,
                        ..Default::default()
                    },
                );
            }
            evses.insert(evse_id, EvseState {
                availability: Default::default(),
                connectors,
            });
        }
        return Ok(ConnectorModel::with_evses(evses));
    }

    let connector_templates = template.connectors.as_ref().unwrap_or(&EMPTY_CONNECTORS);
    let mut defined: Vec<(u32, &crate::template::ConnectorTemplate)> = Vec::new();
    for (key, connector_template) in connector_templates {
        let id: u32 = key.parse().map_err(|_| StationError::InvalidTemplate {
            path: String::new(),
            reason: format!("non-numeric connector id: {key}"),
        })?;
        defined.push((id, connector_template));
    }

    let chargeable: Vec<_> = defined.iter().filter(|(id, _)| *id > 0).collect();
    if chargeable.is_empty() {
        return Err(StationError::NoConnectors);
    }
    let count = template
        .number_of_connectors
        .unwrap_or(chargeable.len() as u32);

    let mut map = BTreeMap::new();
    if template.use_connector_id0 {
        let zero = defined
            .iter()
            .find(|(id, _)| *id == 0)
            .map(|(_, t)| *t)
            .cloned()
            .unwrap_or_default();
        map.insert(
            0,
            ConnectorState {
                boot_status: zero.boot_status,
                ..Default::default()
            },
        );
    }
    let mut rng = rand::thread_rng();
    for id in 1..=count {
        let source = if template.random_connectors {
            chargeable[rng.gen_range(0..chargeable.len())]
        } else {
            chargeable[((id - 1) as usize) % chargeable.len()]
        };
        map.insert(
            id,
            ConnectorState {
                boot_status: source.1.boot_status,
                ..Default::default()
            },
        );
    }
    Ok(ConnectorModel::with_connectors(map))
}

static EMPTY_CONNECTORS: BTreeMap<String, crate::template::ConnectorTemplate> = BTreeMap::new();

/// Restore persisted connector statuses into the freshly-built model.
fn apply_persisted_statuses(model: &mut ConnectorModel, persisted: Option<&PersistedConfiguration>) {
    let Some(persisted) = persisted else { return };
    if let Some(statuses) = &persisted.connectors_status {
        for (id, status) in statuses {
            if let Some(connector) = model.connector_mut(*id) {
                connector.status = Some(*status);
            }
        }
    }
    if let Some(evse_statuses) = &persisted.evses_status {
        for statuses in evse_statuses.values() {
            for (id, status) in statuses {
                if let Some(connector) = model.connector_mut(*id) {
                    connector.status = Some(*status);
                }
            }
        }
    }
}

/// Assemble the configuration store: template keys first, then the standard
/// keys every station needs, then persisted values when OCPP persistence is
/// on.
pub fn build_configuration_store(
    template: &StationTemplate,
    info: &StationInfo,
    model: &ConnectorModel,
    persisted: Option<&PersistedConfiguration>,
) -> ConfigurationStore {
    let mut store = ConfigurationStore::new();

    if let Some(configuration) = &template.configuration {
        for key in &configuration.configuration_key {
            store.add(key.clone(), false);
        }
    }

    if template.ocpp_persistent_configuration {
        if let Some(persisted_keys) = persisted.and_then(|p| p.configuration_key.as_ref()) {
            for key in persisted_keys {
                store.add(key.clone(), true);
            }
        }
    }

    let defaults = [
        (keys::HEARTBEAT_INTERVAL, "300".to_string(), false),
        (keys::METER_VALUE_SAMPLE_INTERVAL, "60".to_string(), false),
        (
            keys::METER_VALUES_SAMPLED_DATA,
            "Energy.Active.Import.Register".to_string(),
            false,
        ),
        (
            keys::NUMBER_OF_CONNECTORS,
            model.number_of_connectors().to_string(),
            true,
        ),
        (
            keys::SUPPORTED_FEATURE_PROFILES,
            "Core,FirmwareManagement,Reservation,SmartCharging,RemoteTrigger".to_string(),
            true,
        ),
        (keys::AUTHORIZE_REMOTE_TX_REQUESTS, "false".to_string(), false),
        (keys::LOCAL_AUTH_LIST_ENABLED, "false".to_string(), false),
        (
            keys::CONNECTION_TIMEOUT,
            info.connection_timeout.to_string(),
            false,
        ),
        (keys::WEB_SOCKET_PING_INTERVAL, "0".to_string(), false),
    ];
    for (key, value, readonly) in defaults {
        store.add(
            ConfigurationKey {
                key: key.to_string(),
                value,
                readonly,
                visible: true,
                reboot: false,
            },
            false,
        );
    }

    if info.supervision_url_ocpp_configuration {
        let key = info
            .supervision_url_ocpp_key
            .as_deref()
            .unwrap_or("ConnectionUrl");
        store.add(
            ConfigurationKey {
                key: key.to_string(),
                value: info.supervision_urls.first().cloned().unwrap_or_default(),
                readonly: false,
                visible: true,
                reboot: true,
            },
            false,
        );
    }

    if let Some(key) = &info.amperage_limitation_ocpp_key {
        store.add(
            ConfigurationKey {
                key: key.clone(),
                value: info.maximum_amperage.to_string(),
                readonly: false,
                visible: true,
                reboot: false,
            },
            false,
        );
    }

    store
}

/// Boot-time status for a connector: persisted status first, then the
/// template's boot status, then availability.
pub fn boot_connector_status(
    station_unavailable: bool,
    connector: &ConnectorState,
) -> ConnectorStatus {
    if let Some(status) = connector.status {
        return status;
    }
    if let Some(status) = connector.boot_status {
        return status;
    }
    if station_unavailable
        || connector.availability == ocsim_types::AvailabilityType::Inoperative
    {
        return ConnectorStatus::Unavailable;
    }
    ConnectorStatus::Available
}
