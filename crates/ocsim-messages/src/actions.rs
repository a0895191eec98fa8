//! Action names and per-version support tables

use ocsim_types::OcppVersion;

/// Actions the station sends or understands, across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Authorize,
    BootNotification,
    CancelReservation,
    ChangeAvailability,
    ChangeConfiguration,
    ClearChargingProfile,
    FirmwareStatusNotification,
    GetConfiguration,
    Heartbeat,
    MeterValues,
    RemoteStartTransaction,
    RemoteStopTransaction,
    ReserveNow,
    Reset,
    SetChargingProfile,
    StartTransaction,
    StatusNotification,
    StopTransaction,
    TransactionEvent,
    TriggerMessage,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Authorize => "Authorize",
            Action::BootNotification => "BootNotification",
            Action::CancelReservation => "CancelReservation",
            Action::ChangeAvailability => "ChangeAvailability",
            Action::ChangeConfiguration => "ChangeConfiguration",
            Action::ClearChargingProfile => "ClearChargingProfile",
            Action::FirmwareStatusNotification => "FirmwareStatusNotification",
            Action::GetConfiguration => "GetConfiguration",
            Action::Heartbeat => "Heartbeat",
            Action::MeterValues => "MeterValues",
            Action::RemoteStartTransaction => "RemoteStartTransaction",
            Action::RemoteStopTransaction => "RemoteStopTransaction",
            Action::ReserveNow => "ReserveNow",
            Action::Reset => "Reset",
            Action::SetChargingProfile => "SetChargingProfile",
            Action::StartTransaction => "StartTransaction",
            Action::StatusNotification => "StatusNotification",
            Action::StopTransaction => "StopTransaction",
            Action::TransactionEvent => "TransactionEvent",
            Action::TriggerMessage => "TriggerMessage",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "Authorize" => Action::Authorize,
            "BootNotification" => Action::BootNotification,
            "CancelReservation" => Action::CancelReservation,
            "ChangeAvailability" => Action::ChangeAvailability,
            "ChangeConfiguration" => Action::ChangeConfiguration,
            "ClearChargingProfile" => Action::ClearChargingProfile,
            "FirmwareStatusNotification" => Action::FirmwareStatusNotification,
            "GetConfiguration" => Action::GetConfiguration,
            "Heartbeat" => Action::Heartbeat,
            "MeterValues" => Action::MeterValues,
            "RemoteStartTransaction" => Action::RemoteStartTransaction,
            "RemoteStopTransaction" => Action::RemoteStopTransaction,
            "ReserveNow" => Action::ReserveNow,
            "Reset" => Action::Reset,
            "SetChargingProfile" => Action::SetChargingProfile,
            "StartTransaction" => Action::StartTransaction,
            "StatusNotification" => Action::StatusNotification,
            "StopTransaction" => Action::StopTransaction,
            "TransactionEvent" => Action::TransactionEvent,
            "TriggerMessage" => Action::TriggerMessage,
            _ => return None,
        })
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Incoming (CS -> station) actions the station handles per version.
pub fn is_supported_incoming(action: &str, version: OcppVersion) -> bool {
    let Some(action) = Action::parse(action) else {
        return false;
    };
    match version {
        OcppVersion::V16 => matches!(
            action,
            Action::CancelReservation
                | Action::ChangeAvailability
                | Action::ChangeConfiguration
                | Action::ClearChargingProfile
                | Action::GetConfiguration
                | Action::RemoteStartTransaction
                | Action::RemoteStopTransaction
                | Action::ReserveNow
                | Action::Reset
                | Action::SetChargingProfile
                | Action::TriggerMessage
        ),
        OcppVersion::V201 => matches!(
            action,
            Action::CancelReservation | Action::ReserveNow | Action::Reset
        ),
    }
}
