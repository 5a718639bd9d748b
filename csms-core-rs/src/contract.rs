//! Abstract message contract between charge points and the central system
//!
//! Independent of any wire encoding. A protocol adapter decodes its frames
//! into [`Inbound`] and encodes [`InboundReply`]; operator commands travel the
//! other way as [`OutboundRequest`] / [`OutboundReply`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error code reported by a healthy charge point
pub const NO_ERROR: &str = "NoError";

/// Role of a message in an exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Answered with a payload
    Request,
    /// Answer to an earlier request, correlated by message id
    Response,
    /// Answered with an empty acknowledgement at most
    Notification,
}

/// All message kinds of the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Boot,
    StatusReport,
    MeterValues,
    Heartbeat,
    TransactionStarted,
    TransactionStopped,
    RemoteStart,
    RemoteStop,
    SetCurrent,
    ClearFault,
}

impl MessageKind {
    /// Kinds themselves are requests or notifications; responses are their answers
    pub fn direction(self) -> Direction {
        match self {
            MessageKind::StatusReport | MessageKind::MeterValues | MessageKind::TransactionStopped => {
                Direction::Notification
            }
            _ => Direction::Request,
        }
    }
}

/// Connector status as reported by the charge point itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportedStatus {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

/// Messages sent by a charge point
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Boot {
        vendor: String,
        model: String,
    },
    StatusReport {
        error_code: String,
        status: ReportedStatus,
    },
    /// `current_amps` is `None` when the report carries no current sample
    MeterValues {
        current_amps: Option<f64>,
    },
    Heartbeat,
    TransactionStarted {
        id_tag: String,
        meter_start_wh: i32,
    },
    TransactionStopped {
        transaction_id: i32,
        meter_stop_wh: i32,
    },
}

impl Inbound {
    pub fn kind(&self) -> MessageKind {
        match self {
            Inbound::Boot { .. } => MessageKind::Boot,
            Inbound::StatusReport { .. } => MessageKind::StatusReport,
            Inbound::MeterValues { .. } => MessageKind::MeterValues,
            Inbound::Heartbeat => MessageKind::Heartbeat,
            Inbound::TransactionStarted { .. } => MessageKind::TransactionStarted,
            Inbound::TransactionStopped { .. } => MessageKind::TransactionStopped,
        }
    }
}

/// Registration decision for a boot message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationStatus {
    Accepted,
    Rejected,
}

/// Replies to [`Inbound`] messages
#[derive(Debug, Clone, PartialEq)]
pub enum InboundReply {
    Boot {
        status: RegistrationStatus,
        interval_secs: u32,
        server_time: DateTime<Utc>,
    },
    Heartbeat {
        server_time: DateTime<Utc>,
    },
    TransactionStarted {
        transaction_id: i32,
    },
    /// Empty confirmation
    Ack,
}

/// Commands pushed to a charge point
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    RemoteStart { setpoint_amps: f64 },
    RemoteStop { transaction_id: i32 },
    SetCurrent { amps: f64 },
    ClearFault,
}

impl OutboundRequest {
    pub fn kind(&self) -> MessageKind {
        match self {
            OutboundRequest::RemoteStart { .. } => MessageKind::RemoteStart,
            OutboundRequest::RemoteStop { .. } => MessageKind::RemoteStop,
            OutboundRequest::SetCurrent { .. } => MessageKind::SetCurrent,
            OutboundRequest::ClearFault => MessageKind::ClearFault,
        }
    }
}

/// Charge point answer to an [`OutboundRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundReply {
    Accepted,
    Rejected,
}
