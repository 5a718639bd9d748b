//! Mapping between OCPP 1.6 payloads and the session contract
//!
//! | Contract | OCPP 1.6 |
//! |----------|----------|
//! | `Boot` | BootNotification |
//! | `StatusReport` | StatusNotification |
//! | `MeterValues` | MeterValues (`Current.Import`) |
//! | `Heartbeat` | Heartbeat |
//! | `TransactionStarted` / `TransactionStopped` | StartTransaction / StopTransaction |
//! | `RemoteStart` | RemoteStartTransaction with a TxProfile |
//! | `RemoteStop` | RemoteStopTransaction |
//! | `SetCurrent` | SetChargingProfile (TxDefaultProfile, A) |
//! | `ClearFault` | Reset (Soft) |

use csms_core::contract::{
    Inbound, InboundReply, OutboundReply, OutboundRequest, RegistrationStatus as CoreRegistration,
    ReportedStatus,
};
use csms_core::CoreError;

use super::messages::*;
use super::types::*;

/// Connector addressed by outbound commands
pub const CONNECTOR_ID: i32 = 1;

/// idTag used for remote starts issued by the central system
pub const REMOTE_ID_TAG: &str = "CSMS";

/// Charging profile id used for operator current limits
pub const OPERATOR_PROFILE_ID: i32 = 1;

/// Decode an inbound CALL into the contract
pub fn decode_inbound(call: &Call) -> Result<Inbound, OcppError> {
    match call.action {
        Action::BootNotification => {
            let req: BootNotificationRequest = call.parse_payload()?;
            Ok(Inbound::Boot {
                vendor: req.charge_point_vendor,
                model: req.charge_point_model,
            })
        }
        Action::StatusNotification => {
            let req: StatusNotificationRequest = call.parse_payload()?;
            Ok(Inbound::StatusReport {
                error_code: req.error_code.to_string(),
                status: reported_status(req.status),
            })
        }
        Action::MeterValues => {
            let req: MeterValuesRequest = call.parse_payload()?;
            Ok(Inbound::MeterValues {
                current_amps: current_import(&req.meter_value)?,
            })
        }
        Action::Heartbeat => Ok(Inbound::Heartbeat),
        Action::StartTransaction => {
            let req: StartTransactionRequest = call.parse_payload()?;
            Ok(Inbound::TransactionStarted {
                id_tag: req.id_tag,
                meter_start_wh: req.meter_start,
            })
        }
        Action::StopTransaction => {
            let req: StopTransactionRequest = call.parse_payload()?;
            Ok(Inbound::TransactionStopped {
                transaction_id: req.transaction_id,
                meter_stop_wh: req.meter_stop,
            })
        }
        other => Err(OcppError::UnsupportedAction(other)),
    }
}

fn reported_status(status: ChargePointStatus) -> ReportedStatus {
    match status {
        ChargePointStatus::Available => ReportedStatus::Available,
        ChargePointStatus::Preparing => ReportedStatus::Preparing,
        ChargePointStatus::Charging => ReportedStatus::Charging,
        ChargePointStatus::SuspendedEV => ReportedStatus::SuspendedEV,
        ChargePointStatus::SuspendedEVSE => ReportedStatus::SuspendedEVSE,
        ChargePointStatus::Finishing => ReportedStatus::Finishing,
        ChargePointStatus::Reserved => ReportedStatus::Reserved,
        ChargePointStatus::Unavailable => ReportedStatus::Unavailable,
        ChargePointStatus::Faulted => ReportedStatus::Faulted,
    }
}

/// Extract the delivered current from meter values.
///
/// Uses the latest meter value carrying `Current.Import`. A phase-less sample
/// wins; otherwise the highest phase reading is taken.
pub fn current_import(meter_values: &[MeterValue]) -> Result<Option<f64>, OcppError> {
    for meter_value in meter_values.iter().rev() {
        let mut total = None;
        let mut max_phase: Option<f64> = None;

        for sample in &meter_value.sampled_value {
            if sample.measurand != Some(Measurand::CurrentImport) {
                continue;
            }
            let amps: f64 = sample.value.trim().parse().map_err(|_| {
                OcppError::Constraint(format!("Current.Import value {:?} is not a number", sample.value))
            })?;
            match sample.phase {
                None => total = Some(amps),
                Some(_) => max_phase = Some(max_phase.map_or(amps, |m| m.max(amps))),
            }
        }

        if let Some(amps) = total.or(max_phase) {
            return Ok(Some(amps));
        }
    }
    Ok(None)
}

/// Encode the reply to an inbound CALL
pub fn encode_reply(message_id: &str, reply: &InboundReply) -> Result<CallResult, OcppError> {
    match *reply {
        InboundReply::Boot {
            status,
            interval_secs,
            server_time,
        } => CallResult::new(
            message_id,
            BootNotificationResponse {
                current_time: server_time,
                interval: interval_secs as i32,
                status: match status {
                    CoreRegistration::Accepted => RegistrationStatus::Accepted,
                    CoreRegistration::Rejected => RegistrationStatus::Rejected,
                },
            },
        ),
        InboundReply::Heartbeat { server_time } => CallResult::new(
            message_id,
            HeartbeatResponse {
                current_time: server_time,
            },
        ),
        InboundReply::TransactionStarted { transaction_id } => CallResult::new(
            message_id,
            StartTransactionResponse {
                id_tag_info: IdTagInfo::accepted(),
                transaction_id,
            },
        ),
        InboundReply::Ack => CallResult::new(message_id, EmptyResponse {}),
    }
}

/// Encode an operator command as an OCPP action and payload
pub fn encode_request(message_id: &str, request: &OutboundRequest) -> Result<Call, OcppError> {
    match *request {
        OutboundRequest::RemoteStart { setpoint_amps } => Call::with_id(
            message_id,
            Action::RemoteStartTransaction,
            RemoteStartTransactionRequest {
                connector_id: Some(CONNECTOR_ID),
                id_tag: REMOTE_ID_TAG.to_string(),
                charging_profile: Some(ChargingProfile::current_limit(
                    OPERATOR_PROFILE_ID,
                    ChargingProfilePurpose::TxProfile,
                    setpoint_amps,
                )),
            },
        ),
        OutboundRequest::RemoteStop { transaction_id } => Call::with_id(
            message_id,
            Action::RemoteStopTransaction,
            RemoteStopTransactionRequest { transaction_id },
        ),
        OutboundRequest::SetCurrent { amps } => Call::with_id(
            message_id,
            Action::SetChargingProfile,
            SetChargingProfileRequest {
                connector_id: CONNECTOR_ID,
                cs_charging_profiles: ChargingProfile::current_limit(
                    OPERATOR_PROFILE_ID,
                    ChargingProfilePurpose::TxDefaultProfile,
                    amps,
                ),
            },
        ),
        OutboundRequest::ClearFault => Call::with_id(
            message_id,
            Action::Reset,
            ResetRequest {
                reset_type: ResetType::Soft,
            },
        ),
    }
}

/// Decode the charge point's CALLRESULT to an operator command
pub fn decode_reply(request: &OutboundRequest, result: &CallResult) -> Result<OutboundReply, OcppError> {
    let accepted = match request {
        OutboundRequest::RemoteStart { .. } | OutboundRequest::RemoteStop { .. } => {
            result.parse_payload::<RemoteStartStopResponse>()?.status == RemoteStartStopStatus::Accepted
        }
        OutboundRequest::SetCurrent { .. } => {
            result.parse_payload::<SetChargingProfileResponse>()?.status
                == ChargingProfileStatus::Accepted
        }
        OutboundRequest::ClearFault => {
            result.parse_payload::<ResetResponse>()?.status == ResetStatus::Accepted
        }
    };
    Ok(if accepted {
        OutboundReply::Accepted
    } else {
        OutboundReply::Rejected
    })
}

/// CALLERROR code for a message the session core refused
pub fn error_code_for(err: &CoreError) -> ErrorCode {
    match err {
        CoreError::ProtocolViolation(_) => ErrorCode::ProtocolError,
        CoreError::InvariantBreach(_) => ErrorCode::PropertyConstraintViolation,
        CoreError::NotFound(_) | CoreError::InvalidIdentity(_) | CoreError::SessionActive(_) => {
            ErrorCode::GenericError
        }
    }
}
