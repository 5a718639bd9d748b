//! Error taxonomy for the session core

use thiserror::Error;

use crate::types::{ChargePointId, LifecycleState};

/// Errors raised while applying inbound traffic to a charge point
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    /// Malformed or out-of-sequence message; the model is unchanged
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Value that would corrupt the model (negative current, zero setpoint)
    #[error("invariant breach: {0}")]
    InvariantBreach(String),

    #[error("charge point not found: {0}")]
    NotFound(ChargePointId),

    #[error("invalid charge point identity: {0}")]
    InvalidIdentity(String),

    /// Explicit removal refused while a connection is bound
    #[error("charge point {0} still has an active connection")]
    SessionActive(ChargePointId),
}

/// Outcomes surfaced to operators submitting commands
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("no active session for charge point {0}")]
    NoActiveSession(ChargePointId),

    #[error("command not allowed in state {state}: {reason}")]
    PreconditionFailed {
        state: LifecycleState,
        reason: String,
    },

    #[error("invariant breach: {0}")]
    InvariantBreach(String),

    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("timeout waiting for command reply")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,
}
