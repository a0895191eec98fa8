//! Status and registration enums shared across OCPP versions

use serde::{Deserialize, Serialize};

/// Connector status as reported through StatusNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ConnectorStatus {
    /// Free for a new transaction
    Available,
    /// Cable plugged or remote start pending, waiting for authorization
    Preparing,
    /// Energy is being delivered
    Charging,
    /// Charging suspended by the vehicle
    SuspendedEV,
    /// Charging suspended by the station
    SuspendedEVSE,
    /// Transaction ended, cable still attached
    Finishing,
    /// Held for a specific idTag
    Reserved,
    /// Taken out of service
    Unavailable,
    /// Out of order
    Faulted,
}

impl std::fmt::Display for ConnectorStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorStatus::Available => "Available",
            ConnectorStatus::Preparing => "Preparing",
            ConnectorStatus::Charging => "Charging",
            ConnectorStatus::SuspendedEV => "SuspendedEV",
            ConnectorStatus::SuspendedEVSE => "SuspendedEVSE",
            ConnectorStatus::Finishing => "Finishing",
            ConnectorStatus::Reserved => "Reserved",
            ConnectorStatus::Unavailable => "Unavailable",
            ConnectorStatus::Faulted => "Faulted",
        };
        write!(f, "{s}")
    }
}

/// Availability of a connector or EVSE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum AvailabilityType {
    #[default]
    Operative,
    Inoperative,
}

/// Registration status returned in a BootNotification response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum RegistrationStatus {
    /// Station accepted; it may send any message
    Accepted,
    /// Central System not ready; retry after the returned interval
    Pending,
    /// Registration refused; retry after the returned interval
    Rejected,
}

/// Firmware installation status reported through FirmwareStatusNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum FirmwareStatus {
    Downloaded,
    DownloadFailed,
    Downloading,
    Idle,
    InstallationFailed,
    Installing,
    Installed,
}

/// Connector error code carried in StatusNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "PascalCase")]
pub enum ChargePointErrorCode {
    ConnectorLockFailure,
    EVCommunicationError,
    GroundFailure,
    HighTemperature,
    InternalError,
    LocalListConflict,
    #[default]
    NoError,
    OtherError,
    OverCurrentFailure,
    OverVoltage,
    PowerMeterFailure,
    PowerSwitchFailure,
    ReaderFailure,
    ResetFailure,
    UnderVoltage,
    WeakSignal,
}

/// Supported OCPP versions and their WebSocket subprotocol names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcppVersion {
    #[serde(rename = "1.6")]
    V16,
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket subprotocol negotiated during the handshake.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            OcppVersion::V16 => "ocpp1.6",
            OcppVersion::V201 => "ocpp2.0.1",
        }
    }
}

impl std::fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OcppVersion::V16 => write!(f, "1.6"),
            OcppVersion::V201 => write!(f, "2.0.1"),
        }
    }
}
