//! OCPP-J message framing
//!
//! OCPP-J carries RPC frames as JSON arrays over WebSocket text messages:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;

/// Message id used in CALLERROR replies to frames whose id cannot be read
pub const UNKNOWN_MESSAGE_ID: &str = "-1";

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP 1.6 error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Spelled this way in OCPP 1.6
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// OCPP 1.6 action names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // CP -> CS
    Authorize,
    BootNotification,
    Heartbeat,
    StatusNotification,
    MeterValues,
    StartTransaction,
    StopTransaction,

    // CS -> CP
    RemoteStartTransaction,
    RemoteStopTransaction,
    SetChargingProfile,
    Reset,

    // Bidirectional
    DataTransfer,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = OcppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Authorize" => Ok(Action::Authorize),
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "MeterValues" => Ok(Action::MeterValues),
            "StartTransaction" => Ok(Action::StartTransaction),
            "StopTransaction" => Ok(Action::StopTransaction),
            "RemoteStartTransaction" => Ok(Action::RemoteStartTransaction),
            "RemoteStopTransaction" => Ok(Action::RemoteStopTransaction),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            "Reset" => Ok(Action::Reset),
            "DataTransfer" => Ok(Action::DataTransfer),
            _ => Err(OcppError::UnknownAction(s.to_string())),
        }
    }
}

/// Errors in OCPP message handling
#[derive(Debug, Error)]
pub enum OcppError {
    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Unsupported action: {0}")]
    UnsupportedAction(Action),

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid {action} payload: {reason}")]
    InvalidPayload { action: Action, reason: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),
}

impl OcppError {
    /// CALLERROR code answering a frame that failed with this error
    pub fn error_code(&self) -> ErrorCode {
        match self {
            OcppError::JsonError(_)
            | OcppError::InvalidFormat
            | OcppError::InvalidPayload { .. } => ErrorCode::FormationViolation,
            OcppError::UnknownAction(_) => ErrorCode::NotImplemented,
            OcppError::UnsupportedAction(_) => ErrorCode::NotSupported,
            OcppError::UnknownMessageType(_) => ErrorCode::ProtocolError,
            OcppError::Constraint(_) => ErrorCode::PropertyConstraintViolation,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, OcppError> {
        Self::with_id(Uuid::new_v4().to_string(), action, payload)
    }

    /// Create a CALL message with a caller-chosen ID
    pub fn with_id(
        message_id: impl Into<String>,
        action: Action,
        payload: impl Serialize,
    ) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Create BootNotification call
    pub fn boot_notification(vendor: &str, model: &str) -> Result<Self, OcppError> {
        Self::new(
            Action::BootNotification,
            BootNotificationRequest {
                charge_point_vendor: vendor.to_string(),
                charge_point_model: model.to_string(),
                charge_point_serial_number: None,
                firmware_version: None,
            },
        )
    }

    /// Create Heartbeat call
    pub fn heartbeat() -> Result<Self, OcppError> {
        Self::new(Action::Heartbeat, HeartbeatRequest {})
    }

    /// Create StatusNotification call
    pub fn status_notification(
        connector_id: i32,
        error_code: ChargePointErrorCode,
        status: ChargePointStatus,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::StatusNotification,
            StatusNotificationRequest {
                connector_id,
                error_code,
                status,
                timestamp: Some(chrono::Utc::now()),
                info: None,
                vendor_error_code: None,
            },
        )
    }

    /// Create MeterValues call
    pub fn meter_values(
        connector_id: i32,
        transaction_id: Option<i32>,
        meter_value: Vec<MeterValue>,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::MeterValues,
            MeterValuesRequest {
                connector_id,
                transaction_id,
                meter_value,
            },
        )
    }

    /// Create StartTransaction call
    pub fn start_transaction(connector_id: i32, id_tag: &str, meter_start: i32) -> Result<Self, OcppError> {
        Self::new(
            Action::StartTransaction,
            StartTransactionRequest {
                connector_id,
                id_tag: id_tag.to_string(),
                meter_start,
                reservation_id: None,
                timestamp: chrono::Utc::now(),
            },
        )
    }

    /// Create StopTransaction call
    pub fn stop_transaction(
        transaction_id: i32,
        meter_stop: i32,
        reason: Option<&str>,
    ) -> Result<Self, OcppError> {
        Self::new(
            Action::StopTransaction,
            StopTransactionRequest {
                id_tag: None,
                meter_stop,
                timestamp: chrono::Utc::now(),
                transaction_id,
                reason: reason.map(str::to_string),
            },
        )
    }

    /// Parse the payload as a specific request type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| OcppError::InvalidPayload {
            action: self.action,
            reason: e.to_string(),
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    /// Create a new CALLRESULT message
    pub fn new(message_id: impl Into<String>, payload: impl Serialize) -> Result<Self, OcppError> {
        Ok(Self {
            message_id: message_id.into(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_string(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, OcppError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a new CALLERROR message
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_text(&self) -> Result<String, OcppError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            self.error_code.to_string(),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_string(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl OcppMessage {
    /// Parse an OCPP message from a text frame
    pub fn parse(text: &str) -> Result<Self, OcppError> {
        let array: Vec<Value> = serde_json::from_str(text)?;

        if array.is_empty() {
            return Err(OcppError::InvalidFormat);
        }

        let msg_type = array[0].as_i64().ok_or(OcppError::InvalidFormat)?;

        match msg_type {
            2 => {
                // CALL: [2, messageId, action, payload]
                if array.len() != 4 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_of(&array)?;
                let action_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let action: Action = action_str.parse()?;
                let payload = array[3].clone();
                if !payload.is_object() {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload,
                }))
            }
            3 => {
                // CALLRESULT: [3, messageId, payload]
                if array.len() != 3 {
                    return Err(OcppError::InvalidFormat);
                }

                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id_of(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                // CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
                if array.len() != 5 {
                    return Err(OcppError::InvalidFormat);
                }

                let message_id = message_id_of(&array)?;
                let error_code_str = array[2].as_str().ok_or(OcppError::InvalidFormat)?;
                let error_code: ErrorCode =
                    serde_json::from_value(Value::String(error_code_str.to_string()))
                        .unwrap_or(ErrorCode::GenericError);

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description: array[3].as_str().unwrap_or("").to_string(),
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(OcppError::UnknownMessageType(msg_type)),
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    /// Serialize to a text frame
    pub fn to_text(&self) -> Result<String, OcppError> {
        match self {
            OcppMessage::Call(c) => c.to_text(),
            OcppMessage::CallResult(r) => r.to_text(),
            OcppMessage::CallError(e) => e.to_text(),
        }
    }
}

fn message_id_of(array: &[Value]) -> Result<String, OcppError> {
    array
        .get(1)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(OcppError::InvalidFormat)
}

/// Best-effort look at a frame that failed to parse: message type and id
pub fn peek_frame(text: &str) -> (Option<i64>, Option<String>) {
    match serde_json::from_str::<Vec<Value>>(text) {
        Ok(array) => (
            array.first().and_then(Value::as_i64),
            array.get(1).and_then(Value::as_str).map(str::to_string),
        ),
        Err(_) => (None, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_serialization() {
        let call = Call::heartbeat().unwrap();
        let text = call.to_text().unwrap();

        assert!(text.starts_with("[2,"));
        assert!(text.contains("\"Heartbeat\""));
    }

    #[test]
    fn test_call_with_id() {
        let call = Call::with_id("csms-7", Action::Reset, ResetRequest { reset_type: ResetType::Soft }).unwrap();
        assert_eq!(
            call.to_text().unwrap(),
            r#"[2,"csms-7","Reset",{"type":"Soft"}]"#
        );
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, Action::Heartbeat);
            }
            _ => panic!("Expected Call"),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2026-01-20T12:00:00Z"}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                let hb: HeartbeatResponse = result.parse_payload().unwrap();
                assert_eq!(hb.current_time.to_rfc3339(), "2026-01-20T12:00:00+00:00");
            }
            _ => panic!("Expected CallResult"),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        let msg = OcppMessage::parse(json).unwrap();

        match msg {
            OcppMessage::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
            }
            _ => panic!("Expected CallError"),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert_eq!(
            OcppMessage::parse("not json").unwrap_err().error_code(),
            ErrorCode::FormationViolation
        );
        assert_eq!(
            OcppMessage::parse(r#"[2, "a", "Heartbeat"]"#).unwrap_err().error_code(),
            ErrorCode::FormationViolation
        );
        assert_eq!(
            OcppMessage::parse(r#"[2, "a", "FlyToTheMoon", {}]"#).unwrap_err().error_code(),
            ErrorCode::NotImplemented
        );
        assert_eq!(
            OcppMessage::parse(r#"[9, "a", {}]"#).unwrap_err().error_code(),
            ErrorCode::ProtocolError
        );
    }

    #[test]
    fn test_local_error_codes() {
        assert_eq!(
            OcppError::UnsupportedAction(Action::DataTransfer).error_code(),
            ErrorCode::NotSupported
        );
        assert_eq!(
            OcppError::Constraint("negative current".into()).error_code(),
            ErrorCode::PropertyConstraintViolation
        );
        let invalid = OcppError::InvalidPayload {
            action: Action::MeterValues,
            reason: "missing connectorId".into(),
        };
        assert_eq!(invalid.error_code(), ErrorCode::FormationViolation);
        assert_eq!(invalid.to_string(), "Invalid MeterValues payload: missing connectorId");
    }

    #[test]
    fn test_peek_frame() {
        assert_eq!(
            peek_frame(r#"[2, "abc", "Nope", {}]"#),
            (Some(2), Some("abc".to_string()))
        );
        assert_eq!(peek_frame("{"), (None, None));
    }

    #[test]
    fn test_call_error_serialization() {
        let err = CallError::new("x1", ErrorCode::OccurenceConstraintViolation, "missing field");
        let text = err.to_text().unwrap();
        assert_eq!(
            text,
            r#"[4,"x1","OccurenceConstraintViolation","missing field",{}]"#
        );
    }
}
