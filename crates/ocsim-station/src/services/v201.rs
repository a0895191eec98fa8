//! OCPP 2.0.1 request/response services
//!
//! Transactions travel as TransactionEvent with a per-station sequence
//! number; status notifications address the EVSE + connector pair.

use crate::reservation::{
    add_reservation, is_connector_reservable, remove_reservation, ReservationTerminationReason,
};
use crate::services::{
    BootResponse, IncomingRequestService, MeterSample, RequestService, RuntimeCommand,
    RuntimeCommands, StartOutcome,
};
use crate::state::SharedState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ocsim_messages::v201::{
    BootNotificationRequest, BootNotificationResponse, BootReason, CancelReservationRequest,
    CancelReservationResponse, CancelReservationStatusType, ChargingStateType,
    ChargingStationType, ConnectorStatusType, EvseType, FirmwareStatusNotificationRequest,
    HeartbeatRequest, IdTokenType, ReserveNowRequest, ReserveNowResponse, ReserveNowStatusType,
    ResetEnumType, ResetRequest, ResetResponse, ResetStatusType, StatusNotificationRequest,
    TransactionEventRequest, TransactionEventType, TransactionType, TriggerReason,
};
use ocsim_messages::Action;
use ocsim_types::{
    ConnectorId, ConnectorStatus, FirmwareStatus, OcppError, OcppResult, TransactionId,
};
use serde_json::Value;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::warn;

fn to_value<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Builds 2.0.1 outbound payloads.
#[derive(Debug, Default)]
pub struct V201RequestService {
    seq_no: AtomicU32,
}

impl V201RequestService {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u32 {
        self.seq_no.fetch_add(1, Ordering::SeqCst)
    }
}

impl RequestService for V201RequestService {
    fn boot_notification(&self, info: &crate::reconcile::StationInfo) -> (Action, Value) {
        let request = BootNotificationRequest {
            charging_station: ChargingStationType {
                serial_number: info.charge_point_serial_number.clone(),
                model: info.charge_point_model.clone(),
                vendor_name: info.charge_point_vendor.clone(),
                firmware_version: info.firmware_version.clone(),
                modem: None,
            },
            reason: BootReason::PowerUp,
        };
        (Action::BootNotification, to_value(&request))
    }

    fn heartbeat(&self) -> (Action, Value) {
        (Action::Heartbeat, to_value(&HeartbeatRequest {}))
    }

    fn status_notification(
        &self,
        connector_id: ConnectorId,
        evse_id: Option<u32>,
        status: ConnectorStatus,
    ) -> (Action, Value) {
        let request = StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: ConnectorStatusType::from(status),
            evse_id: evse_id.unwrap_or(connector_id),
            connector_id,
        };
        (Action::StatusNotification, to_value(&request))
    }

    fn meter_values(
        &self,
        connector_id: ConnectorId,
        transaction_id: Option<TransactionId>,
        sample: MeterSample,
    ) -> (Action, Value) {
        let request = TransactionEventRequest {
            event_type: TransactionEventType::Updated,
            timestamp: Utc::now(),
            trigger_reason: TriggerReason::MeterValuePeriodic,
            seq_no: self.next_seq(),
            transaction_info: TransactionType {
                transaction_id: transaction_id.unwrap_or_default().to_string(),
                charging_state: Some(ChargingStateType::Charging),
                remote_start_id: None,
            },
            evse: Some(EvseType {
                id: connector_id,
                connector_id: Some(connector_id),
            }),
            id_token: None,
            meter_value: Some(vec![serde_json::json!({
                "timestamp": Utc::now(),
                "sampledValue": [{
                    "value": sample.energy_register_wh,
                    "measurand": "Energy.Active.Import.Register",
                    "unitOfMeasure": {"unit": "Wh"}
                }, {
                    "value": sample.power_w,
                    "measurand": "Power.Active.Import",
                    "unitOfMeasure": {"unit": "W"}
                }]
            })]),
        };
        (Action::TransactionEvent, to_value(&request))
    }

    fn start_transaction(
        &self,
        connector_id: ConnectorId,
        id_tag: &str,
        _meter_start_wh: i64,
        timestamp: DateTime<Utc>,
        _reservation_id: Option<i32>,
    ) -> (Action, Value) {
        let request = TransactionEventRequest {
            event_type: TransactionEventType::Started,
            timestamp,
            trigger_reason: TriggerReason::Authorized,
            seq_no: self.next_seq(),
            transaction_info: TransactionType {
                transaction_id: uuid::Uuid::new_v4().to_string(),
                charging_state: Some(ChargingStateType::EVConnected),
                remote_start_id: None,
            },
            evse: Some(EvseType {
                id: connector_id,
                connector_id: Some(connector_id),
            }),
            id_token: Some(IdTokenType {
                id_token: id_tag.to_string(),
                token_type: "ISO14443".to_string(),
            }),
            meter_value: None,
        };
        (Action::TransactionEvent, to_value(&request))
    }

    fn stop_transaction(
        &self,
        transaction_id: TransactionId,
        id_tag: Option<&str>,
        _meter_stop_wh: i64,
        timestamp: DateTime<Utc>,
        _reason: Option<&str>,
    ) -> (Action, Value) {
        let request = TransactionEventRequest {
            event_type: TransactionEventType::Ended,
            timestamp,
            trigger_reason: TriggerReason::StopAuthorized,
            seq_no: self.next_seq(),
            transaction_info: TransactionType {
                transaction_id: transaction_id.to_string(),
                charging_state: Some(ChargingStateType::Idle),
                remote_start_id: None,
            },
            evse: None,
            id_token: id_tag.map(|tag| IdTokenType {
                id_token: tag.to_string(),
                token_type: "ISO14443".to_string(),
            }),
            meter_value: None,
        };
        (Action::TransactionEvent, to_value(&request))
    }

    fn firmware_status_notification(&self, status: FirmwareStatus) -> (Action, Value) {
        (
            Action::FirmwareStatusNotification,
            to_value(&FirmwareStatusNotificationRequest { status }),
        )
    }

    fn parse_boot_response(&self, payload: &Value) -> OcppResult<BootResponse> {
        let response: BootNotificationResponse = serde_json::from_value(payload.clone())?;
        Ok(BootResponse {
            status: response.status,
            interval_secs: response.interval,
            current_time: response.current_time,
        })
    }

    fn parse_start_response(&self, payload: &Value) -> OcppResult<StartOutcome> {
        // TransactionEvent responses carry no transaction id; the station
        // already chose one. Authorization problems surface via idTokenInfo.
        let accepted = payload
            .get("idTokenInfo")
            .and_then(|info| info.get("status"))
            .and_then(Value::as_str)
            .map(|status| status == "Accepted")
            .unwrap_or(true);
        Ok(StartOutcome {
            transaction_id: 0,
            accepted,
        })
    }
}

/// Handles 2.0.1 inbound commands.
pub struct V201IncomingService {
    state: Arc<SharedState>,
    commands: RuntimeCommands,
}

impl V201IncomingService {
    pub fn new(state: Arc<SharedState>, commands: RuntimeCommands) -> Self {
        Self { state, commands }
    }

    fn command(&self, command: RuntimeCommand) {
        if self.commands.send(command).is_err() {
            warn!("runtime command channel closed");
        }
    }

    async fn reset(&self, payload: Value) -> OcppResult<Value> {
        let request: ResetRequest = serde_json::from_value(payload)?;
        let busy = {
            let model = self.state.model.read().await;
            model.number_of_running_transactions() > 0
        };
        let status = match (request.reset_type, busy) {
            (ResetEnumType::OnIdle, true) => ResetStatusType::Scheduled,
            _ => {
                self.command(RuntimeCommand::Reset { hard: false });
                ResetStatusType::Accepted
            }
        };
        Ok(to_value(&ResetResponse { status }))
    }

    async fn reserve_now(&self, payload: Value) -> OcppResult<Value> {
        let request: ReserveNowRequest = serde_json::from_value(payload)?;
        let mut model = self.state.model.write().await;

        // Without an EVSE id the reservation holds the station as a whole.
        let connector_id = match request.evse_id {
            Some(evse_id) => match model
                .iter()
                .find(|(id, _)| model.evse_of(*id) == Some(evse_id) || *id == evse_id)
                .map(|(id, _)| id)
            {
                Some(id) => id,
                None => {
                    return Ok(to_value(&ReserveNowResponse {
                        status: ReserveNowStatusType::Rejected,
                    }))
                }
            },
            None => 0,
        };

        let status = {
            let connector = model.connector(connector_id);
            match connector.and_then(|c| c.status) {
                Some(ConnectorStatus::Faulted) => ReserveNowStatusType::Faulted,
                Some(ConnectorStatus::Unavailable) => ReserveNowStatusType::Unavailable,
                _ if connector.is_some_and(|c| c.transaction.started) => {
                    ReserveNowStatusType::Occupied
                }
                _ => {
                    if connector_id == 0
                        || is_connector_reservable(
                            &model,
                            request.id,
                            Some(&request.id_token.id_token),
                            Some(connector_id),
                        )
                    {
                        let changes = add_reservation(
                            &mut model,
                            crate::reservation::Reservation {
                                reservation_id: request.id,
                                connector_id,
                                id_tag: request.id_token.id_token,
                                expiry_date: request.expiry_date_time,
                                parent_id_tag: None,
                            },
                        );
                        for change in changes {
                            self.command(RuntimeCommand::NotifyStatus {
                                connector_id: change.connector_id,
                                status: change.status,
                            });
                        }
                        ReserveNowStatusType::Accepted
                    } else {
                        ReserveNowStatusType::Occupied
                    }
                }
            }
        };
        Ok(to_value(&ReserveNowResponse { status }))
    }

    async fn cancel_reservation(&self, payload: Value) -> OcppResult<Value> {
        let request: CancelReservationRequest = serde_json::from_value(payload)?;
        let mut model = self.state.model.write().await;

        let exists = model.iter().any(|(_, c)| {
            c.reservation
                .as_ref()
                .is_some_and(|r| r.reservation_id == request.reservation_id)
        });
        if !exists {
            return Ok(to_value(&CancelReservationResponse {
                status: CancelReservationStatusType::Rejected,
            }));
        }

        let changes = remove_reservation(
            &mut model,
            request.reservation_id,
            ReservationTerminationReason::ReservationCanceled,
        );
        for change in changes {
            self.command(RuntimeCommand::NotifyStatus {
                connector_id: change.connector_id,
                status: change.status,
            });
        }
        Ok(to_value(&CancelReservationResponse {
            status: CancelReservationStatusType::Accepted,
        }))
    }
}

#[async_trait]
impl IncomingRequestService for V201IncomingService {
    async fn handle(&self, action: &str, payload: Value) -> OcppResult<Value> {
        match Action::parse(action) {
            Some(Action::Reset) => self.reset(payload).await,
            Some(Action::ReserveNow) => self.reserve_now(payload).await,
            Some(Action::CancelReservation) => self.cancel_reservation(payload).await,
            _ => Err(OcppError::not_implemented(format!(
                "no 2.0.1 handler for {action}"
            ))),
        }
    }
}
