//! OCPP 1.6 request/response services

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
use ocsim_messages::v16::{
    AvailabilityStatus, BootNotificationRequest, BootNotificationResponse,
    CancelReservationRequest, CancelReservationResponse, CancelReservationStatus,
    ChangeAvailabilityRequest, ChangeAvailabilityResponse, ChangeConfigurationRequest,
    ChangeConfigurationResponse, ChargingProfileStatus, ClearChargingProfileRequest,
    ClearChargingProfileResponse, ClearChargingProfileStatus, ConfigurationStatus,
    FirmwareStatusNotificationRequest, GetConfigurationRequest, GetConfigurationResponse,
    HeartbeatRequest, Location, Measurand, MessageTrigger, MeterValue, MeterValuesRequest,
    ReadingContext, RemoteStartStopStatus, RemoteStartTransactionRequest,
    RemoteStartTransactionResponse, RemoteStopTransactionRequest, RemoteStopTransactionResponse,
    ReservationStatus, ReserveNowRequest, ReserveNowResponse, ResetRequest, ResetResponse,
    ResetStatus, ResetType, SampledValue, SetChargingProfileRequest, SetChargingProfileResponse,
    StartTransactionRequest, StartTransactionResponse, StatusNotificationRequest, StopReason,
    StopTransactionRequest, TriggerMessageRequest, TriggerMessageResponse, TriggerMessageStatus,
    UnitOfMeasure, ValueFormat,
};
use ocsim_messages::Action;
use ocsim_types::{
    AvailabilityType, ChargingProfilePurpose, ConnectorId, ConnectorStatus, FirmwareStatus,
    OcppError, OcppResult, TransactionId,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

fn to_value<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

/// Builds 1.6 outbound payloads.
#[derive(Debug, Default)]
pub struct V16RequestService;

impl RequestService for V16RequestService {
    fn boot_notification(&self, info: &crate::reconcile::StationInfo) -> (Action, Value) {
        let request = BootNotificationRequest {
            charge_point_vendor: info.charge_point_vendor.clone(),
            charge_point_model: info.charge_point_model.clone(),
            charge_point_serial_number: info.charge_point_serial_number.clone(),
            charge_box_serial_number: info.charge_box_serial_number.clone(),
            firmware_version: info.firmware_version.clone(),
            iccid: None,
            imsi: None,
            meter_type: info.meter_type.clone(),
            meter_serial_number: info.meter_serial_number.clone(),
        };
        (Action::BootNotification, to_value(&request))
    }

    fn heartbeat(&self) -> (Action, Value) {
        (Action::Heartbeat, to_value(&HeartbeatRequest {}))
    }

    fn status_notification(
        &self,
        connector_id: ConnectorId,
        _evse_id: Option<u32>,
        status: ConnectorStatus,
    ) -> (Action, Value) {
        let request = StatusNotificationRequest {
            connector_id,
            error_code: Default::default(),
            info: None,
            status,
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        (Action::StatusNotification, to_value(&request))
    }

    fn meter_values(
        &self,
        connector_id: ConnectorId,
        transaction_id: Option<TransactionId>,
        sample: MeterSample,
    ) -> (Action, Value) {
        let context = match sample.context {
            crate::services::SampleContext::Periodic => ReadingContext::SamplePeriodic,
            crate::services::SampleContext::TransactionBegin => ReadingContext::TransactionBegin,
            crate::services::SampleContext::TransactionEnd => ReadingContext::TransactionEnd,
        };
        let mut sampled_value = vec![SampledValue {
            value: sample.energy_register_wh.to_string(),
            context: Some(context),
            format: Some(ValueFormat::Raw),
            measurand: Some(Measurand::EnergyActiveImportRegister),
            phase: None,
            location: Some(Location::Outlet),
            unit: Some(UnitOfMeasure::Wh),
        }];
        // Power only accompanies periodic samples with the measurand
        // configured; begin/end entries carry the register alone.
        if sample.context == crate::services::SampleContext::Periodic && sample.include_power {
            sampled_value.push(SampledValue {
                value: format!("{:.1}", sample.power_w),
                context: Some(context),
                format: Some(ValueFormat::Raw),
                measurand: Some(Measurand::PowerActiveImport),
                phase: None,
                location: Some(Location::Outlet),
                unit: Some(UnitOfMeasure::W),
            });
        }
        let request = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value,
            }],
        };
        (Action::MeterValues, to_value(&request))
    }

    fn start_transaction(
        &self,
        connector_id: ConnectorId,
        id_tag: &str,
        meter_start_wh: i64,
        timestamp: DateTime<Utc>,
        reservation_id: Option<i32>,
    ) -> (Action, Value) {
        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: meter_start_wh as i32,
            reservation_id,
            timestamp,
        };
        (Action::StartTransaction, to_value(&request))
    }

    fn stop_transaction(
        &self,
        transaction_id: TransactionId,
        id_tag: Option<&str>,
        meter_stop_wh: i64,
        timestamp: DateTime<Utc>,
        reason: Option<&str>,
    ) -> (Action, Value) {
        let reason = reason.and_then(|r| {
            serde_json::from_value::<StopReason>(Value::String(r.to_string())).ok()
        });
        let request = StopTransactionRequest {
            id_tag: id_tag.map(str::to_owned),
            meter_stop: meter_stop_wh as i32,
            timestamp,
            transaction_id,
            reason,
            transaction_data: None,
        };
        (Action::StopTransaction, to_value(&request))
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
        let response: StartTransactionResponse = serde_json::from_value(payload.clone())?;
        Ok(StartOutcome {
            transaction_id: response.transaction_id,
            accepted: matches!(
                response.id_tag_info.status,
                ocsim_messages::v16::AuthorizationStatus::Accepted
            ),
        })
    }
}

/// Handles 1.6 inbound commands against the shared station state.
pub struct V16IncomingService {
    state: Arc<SharedState>,
    commands: RuntimeCommands,
}

impl V16IncomingService {
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
        self.command(RuntimeCommand::Reset {
            hard: request.reset_type == ResetType::Hard,
        });
        Ok(to_value(&ResetResponse {
            status: ResetStatus::Accepted,
        }))
    }

    async fn get_configuration(&self, payload: Value) -> OcppResult<Value> {
        let request: GetConfigurationRequest = serde_json::from_value(payload)?;
        let config = self.state.config.read().await;
        let (known, unknown) = config.visible_keys(request.key.as_deref());
        Ok(to_value(&GetConfigurationResponse {
            configuration_key: Some(known),
            unknown_key: if unknown.is_empty() {
                None
            } else {
                Some(unknown)
            },
        }))
    }

    async fn change_configuration(&self, payload: Value) -> OcppResult<Value> {
        let request: ChangeConfigurationRequest = serde_json::from_value(payload)?;
        let outcome = {
            let mut config = self.state.config.write().await;
            config.set_value(&request.key, request.value.clone())
        };
        use crate::config_store::SetValueOutcome;
        let status = match outcome {
            SetValueOutcome::Accepted => {
                self.command(RuntimeCommand::ApplyConfiguration {
                    key: request.key.clone(),
                });
                ConfigurationStatus::Accepted
            }
            SetValueOutcome::RebootRequired => {
                self.command(RuntimeCommand::ApplyConfiguration {
                    key: request.key.clone(),
                });
                ConfigurationStatus::RebootRequired
            }
            SetValueOutcome::Rejected => ConfigurationStatus::Rejected,
            SetValueOutcome::NotSupported => ConfigurationStatus::NotSupported,
        };
        Ok(to_value(&ChangeConfigurationResponse { status }))
    }

    async fn change_availability(&self, payload: Value) -> OcppResult<Value> {
        let request: ChangeAvailabilityRequest = serde_json::from_value(payload)?;
        let mut model = self.state.model.write().await;

        let targets: Vec<ConnectorId> = if request.connector_id == 0 {
            model.iter().map(|(id, _)| id).collect()
        } else if model.connector(request.connector_id).is_some() {
            vec![request.connector_id]
        } else {
            return Ok(to_value(&ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            }));
        };

        let busy = targets.iter().any(|id| {
            model
                .connector(*id)
                .is_some_and(|c| c.transaction.started)
        });

        for id in &targets {
            if let Some(connector) = model.connector_mut(*id) {
                connector.availability = request.availability_type;
            }
        }

        if busy {
            // Applied once the running transactions end.
            return Ok(to_value(&ChangeAvailabilityResponse {
                status: AvailabilityStatus::Scheduled,
            }));
        }

        let status = match request.availability_type {
            AvailabilityType::Operative => ConnectorStatus::Available,
            AvailabilityType::Inoperative => ConnectorStatus::Unavailable,
        };
        for id in targets {
            if id > 0 {
                model.set_status(id, status);
                self.command(RuntimeCommand::NotifyStatus {
                    connector_id: id,
                    status,
                });
            }
        }
        Ok(to_value(&ChangeAvailabilityResponse {
            status: AvailabilityStatus::Accepted,
        }))
    }

    async fn remote_start_transaction(&self, payload: Value) -> OcppResult<Value> {
        let request: RemoteStartTransactionRequest = serde_json::from_value(payload)?;
        let model = self.state.model.read().await;

        let connector_id = match request.connector_id {
            Some(id) if id > 0 => model.connector(id).map(|_| id),
            Some(_) | None => model
                .iter()
                .filter(|(id, _)| *id > 0)
                .find(|(_, c)| {
                    !c.transaction.started
                        && c.availability == AvailabilityType::Operative
                        && matches!(
                            c.status,
                            None | Some(ConnectorStatus::Available)
                                | Some(ConnectorStatus::Preparing)
                        )
                })
                .map(|(id, _)| id),
        };

        let accepted = connector_id.is_some_and(|id| {
            model.connector(id).is_some_and(|c| {
                !c.transaction.started && c.availability == AvailabilityType::Operative
            })
        });

        if accepted {
            let connector_id = connector_id.unwrap_or_default();
            debug!(connector_id, id_tag = %request.id_tag, "remote start accepted");
            if let Some(profile) = request.charging_profile {
                drop(model);
                let mut model = self.state.model.write().await;
                if let Some(connector) = model.connector_mut(connector_id) {
                    connector.set_charging_profile(profile);
                }
            }
            self.command(RuntimeCommand::RemoteStartTransaction {
                connector_id,
                id_tag: request.id_tag,
            });
            Ok(to_value(&RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            }))
        } else {
            Ok(to_value(&RemoteStartTransactionResponse {
                status: RemoteStartStopStatus::Rejected,
            }))
        }
    }

    async fn remote_stop_transaction(&self, payload: Value) -> OcppResult<Value> {
        let request: RemoteStopTransactionRequest = serde_json::from_value(payload)?;
        let model = self.state.model.read().await;
        let found = model
            .iter()
            .any(|(_, c)| c.transaction.id == Some(request.transaction_id));
        let status = if found {
            self.command(RuntimeCommand::RemoteStopTransaction {
                transaction_id: request.transaction_id,
            });
            RemoteStartStopStatus::Accepted
        } else {
            RemoteStartStopStatus::Rejected
        };
        Ok(to_value(&RemoteStopTransactionResponse { status }))
    }

    async fn reserve_now(&self, payload: Value) -> OcppResult<Value> {
        let request: ReserveNowRequest = serde_json::from_value(payload)?;
        let mut model = self.state.model.write().await;

        let Some(connector) = model.connector(request.connector_id) else {
            return Ok(to_value(&ReserveNowResponse {
                status: ReservationStatus::Rejected,
            }));
        };

        let status = match connector.status {
            Some(ConnectorStatus::Faulted) => ReservationStatus::Faulted,
            Some(ConnectorStatus::Unavailable) => ReservationStatus::Unavailable,
            _ if connector.transaction.started => ReservationStatus::Occupied,
            _ => {
                let replacing = model.iter().any(|(_, c)| {
                    c.reservation
                        .as_ref()
                        .is_some_and(|r| r.reservation_id == request.reservation_id)
                });
                let target_taken = connector.reservation.is_some();

                if request.connector_id == 0
                    || replacing
                    || (!target_taken
                        && is_connector_reservable(
                            &model,
                            request.reservation_id,
                            Some(&request.id_tag),
                            Some(request.connector_id),
                        ))
                {
                    let changes = add_reservation(
                        &mut model,
                        crate::reservation::Reservation {
                            reservation_id: request.reservation_id,
                            connector_id: request.connector_id,
                            id_tag: request.id_tag,
                            expiry_date: request.expiry_date,
                            parent_id_tag: request.parent_id_tag,
                        },
                    );
                    for change in changes {
                        self.command(RuntimeCommand::NotifyStatus {
                            connector_id: change.connector_id,
                            status: change.status,
                        });
                    }
                    ReservationStatus::Accepted
                } else {
                    ReservationStatus::Occupied
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
                status: CancelReservationStatus::Rejected,
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
            status: CancelReservationStatus::Accepted,
        }))
    }

    async fn set_charging_profile(&self, payload: Value) -> OcppResult<Value> {
        let request: SetChargingProfileRequest = serde_json::from_value(payload)?;
        let mut profile = request.cs_charging_profiles;
        let mut model = self.state.model.write().await;

        let rejected = to_value(&SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        });

        let Some(connector) = model.connector(request.connector_id) else {
            return Ok(rejected);
        };
        if profile.charging_profile_purpose == ChargingProfilePurpose::ChargePointMaxProfile
            && request.connector_id != 0
        {
            return Ok(rejected);
        }
        if profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile
            && !connector.transaction.started
        {
            return Ok(rejected);
        }

        profile.charging_schedule.normalize();
        if !profile.charging_schedule.is_well_formed() {
            warn!(
                profile_id = profile.charging_profile_id,
                "rejecting malformed charging schedule"
            );
            return Ok(rejected);
        }

        if let Some(connector) = model.connector_mut(request.connector_id) {
            connector.set_charging_profile(profile);
        }
        Ok(to_value(&SetChargingProfileResponse {
            status: ChargingProfileStatus::Accepted,
        }))
    }

    async fn clear_charging_profile(&self, payload: Value) -> OcppResult<Value> {
        let request: ClearChargingProfileRequest = serde_json::from_value(payload)?;
        let mut model = self.state.model.write().await;

        let mut cleared = false;
        let target_ids: Vec<ConnectorId> = match request.connector_id {
            Some(id) => vec![id],
            None => model.iter().map(|(id, _)| id).collect(),
        };
        for id in target_ids {
            if let Some(connector) = model.connector_mut(id) {
                let before = connector.charging_profiles.len();
                connector.charging_profiles.retain(|p| {
                    if let Some(profile_id) = request.id {
                        return p.charging_profile_id != profile_id;
                    }
                    let purpose_matches = request
                        .charging_profile_purpose
                        .map(|purpose| p.charging_profile_purpose == purpose)
                        .unwrap_or(true);
                    let stack_matches = request
                        .stack_level
                        .map(|level| p.stack_level == level)
                        .unwrap_or(true);
                    !(purpose_matches && stack_matches)
                });
                cleared |= connector.charging_profiles.len() != before;
            }
        }

        Ok(to_value(&ClearChargingProfileResponse {
            status: if cleared {
                ClearChargingProfileStatus::Accepted
            } else {
                ClearChargingProfileStatus::Unknown
            },
        }))
    }

    async fn trigger_message(&self, payload: Value) -> OcppResult<Value> {
        let request: TriggerMessageRequest = serde_json::from_value(payload)?;
        let status = match request.requested_message {
            MessageTrigger::DiagnosticsStatusNotification => TriggerMessageStatus::NotImplemented,
            message => {
                self.command(RuntimeCommand::Trigger {
                    message,
                    connector_id: request.connector_id,
                });
                TriggerMessageStatus::Accepted
            }
        };
        Ok(to_value(&TriggerMessageResponse { status }))
    }
}

#[async_trait]
impl IncomingRequestService for V16IncomingService {
    async fn handle(&self, action: &str, payload: Value) -> OcppResult<Value> {
        match Action::parse(action) {
            Some(Action::Reset) => self.reset(payload).await,
            Some(Action::GetConfiguration) => self.get_configuration(payload).await,
            Some(Action::ChangeConfiguration) => self.change_configuration(payload).await,
            Some(Action::ChangeAvailability) => self.change_availability(payload).await,
            Some(Action::RemoteStartTransaction) => self.remote_start_transaction(payload).await,
            Some(Action::RemoteStopTransaction) => self.remote_stop_transaction(payload).await,
            Some(Action::ReserveNow) => self.reserve_now(payload).await,
            Some(Action::CancelReservation) => self.cancel_reservation(payload).await,
            Some(Action::SetChargingProfile) => self.set_charging_profile(payload).await,
            Some(Action::ClearChargingProfile) => self.clear_charging_profile(payload).await,
            Some(Action::TriggerMessage) => self.trigger_message(payload).await,
            _ => Err(OcppError::not_implemented(format!(
                "no 1.6 handler for {action}"
            ))),
        }
    }
}
