//! Version-specific request and response services
//!
//! The engine and runtime depend on these traits only; the per-version
//! implementations translate between the shared domain model and the wire
//! payload shapes of their OCPP version.

pub mod v16;
pub mod v201;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocsim_messages::v16::MessageTrigger;
use ocsim_messages::Action;
use ocsim_types::{
    ConnectorId, ConnectorStatus, FirmwareStatus, OcppResult, RegistrationStatus, TransactionId,
};
use serde_json::Value;
use tokio::sync::mpsc;

/// Parsed BootNotification response, version independent.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootResponse {
    pub status: RegistrationStatus,
    /// Heartbeat interval (Accepted) or retry backoff (Pending/Rejected)
    pub interval_secs: i64,
    pub current_time: DateTime<Utc>,
}

/// Parsed StartTransaction (or TransactionEvent Started) response.
#[derive(Debug, Clone, PartialEq)]
pub struct StartOutcome {
    pub transaction_id: TransactionId,
    pub accepted: bool,
}

/// When a meter sample was taken, version independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleContext {
    #[default]
    Periodic,
    TransactionBegin,
    TransactionEnd,
}

/// One meter sample, version independent.
#[derive(Debug, Clone, Copy)]
pub struct MeterSample {
    pub energy_register_wh: i64,
    pub power_w: f64,
    pub context: SampleContext,
    /// Whether the configured measurands include active power
    pub include_power: bool,
}

/// Builds outbound payloads and interprets their responses.
pub trait RequestService: Send + Sync {
    fn boot_notification(&self, info: &crate::reconcile::StationInfo) -> (Action, Value);
    fn heartbeat(&self) -> (Action, Value);
    fn status_notification(
        &self,
        connector_id: ConnectorId,
        evse_id: Option<u32>,
        status: ConnectorStatus,
    ) -> (Action, Value);
    fn meter_values(
        &self,
        connector_id: ConnectorId,
        transaction_id: Option<TransactionId>,
        sample: MeterSample,
    ) -> (Action, Value);
    fn start_transaction(
        &self,
        connector_id: ConnectorId,
        id_tag: &str,
        meter_start_wh: i64,
        timestamp: DateTime<Utc>,
        reservation_id: Option<i32>,
    ) -> (Action, Value);
    fn stop_transaction(
        &self,
        transaction_id: TransactionId,
        id_tag: Option<&str>,
        meter_stop_wh: i64,
        timestamp: DateTime<Utc>,
        reason: Option<&str>,
    ) -> (Action, Value);
    fn firmware_status_notification(&self, status: FirmwareStatus) -> (Action, Value);

    fn parse_boot_response(&self, payload: &Value) -> OcppResult<BootResponse>;
    fn parse_start_response(&self, payload: &Value) -> OcppResult<StartOutcome>;
}

/// Handles inbound CALLs, producing the CALLRESULT payload or an error to be
/// wrapped in a CALLERROR.
#[async_trait]
pub trait IncomingRequestService: Send + Sync {
    async fn handle(&self, action: &str, payload: Value) -> OcppResult<Value>;
}

/// Side effects an inbound handler asks the runtime to perform after the
/// response goes out.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeCommand {
    Reset {
        hard: bool,
    },
    NotifyStatus {
        connector_id: ConnectorId,
        status: ConnectorStatus,
    },
    RemoteStartTransaction {
        connector_id: ConnectorId,
        id_tag: String,
    },
    RemoteStopTransaction {
        transaction_id: TransactionId,
    },
    /// A configuration key changed; timers reading it must be restarted.
    ApplyConfiguration {
        key: String,
    },
    Trigger {
        message: MessageTrigger,
        connector_id: Option<ConnectorId>,
    },
}

pub type RuntimeCommands = mpsc::UnboundedSender<RuntimeCommand>;
