//! Core types for the charge-point session core

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CoreError;

/// Stable identity of a physical (or simulated) charge point
pub type ChargePointId = String;

/// Identifier of one transport connection, unique for the process lifetime
pub type ConnectionId = u64;

/// Maximum identity length accepted at the transport boundary
pub const MAX_IDENTITY_LEN: usize = 48;

/// Validate an identity extracted from the transport (URL path segment).
///
/// Accepts 1..=48 characters from `[A-Za-z0-9._:-]`.
pub fn validate_identity(raw: &str) -> Result<ChargePointId, CoreError> {
    if raw.is_empty() {
        return Err(CoreError::InvalidIdentity("empty identity".to_string()));
    }
    if raw.len() > MAX_IDENTITY_LEN {
        return Err(CoreError::InvalidIdentity(format!(
            "identity longer than {} characters",
            MAX_IDENTITY_LEN
        )));
    }
    if let Some(c) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-')))
    {
        return Err(CoreError::InvalidIdentity(format!(
            "unsupported character {:?} in {:?}",
            c, raw
        )));
    }
    Ok(raw.to_string())
}

/// Lifecycle state of a charge point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Never booted (or unknown identity)
    Unregistered,
    Available,
    /// Charging requested, waiting for current to flow
    Preparing,
    Charging,
    /// Fault latched until an acknowledged reset
    Faulted,
    /// Disconnected or timed out
    Unavailable,
}

impl LifecycleState {
    /// Small fixed status code for status-code based consumers.
    ///
    /// | State | Code |
    /// |-------|------|
    /// | Unregistered | 0 |
    /// | Unavailable | 1 |
    /// | Preparing | 2 |
    /// | Charging | 3 |
    /// | Available | 4 |
    /// | Faulted | 5 |
    pub fn status_code(self) -> u8 {
        match self {
            LifecycleState::Unregistered => 0,
            LifecycleState::Unavailable => 1,
            LifecycleState::Preparing => 2,
            LifecycleState::Charging => 3,
            LifecycleState::Available => 4,
            LifecycleState::Faulted => 5,
        }
    }

    /// States in which the charge point can accept a charging request
    pub fn can_charge(self) -> bool {
        matches!(
            self,
            LifecycleState::Available | LifecycleState::Preparing | LifecycleState::Charging
        )
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Why a connection is being closed from the central side
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer connection for the same identity took over
    Superseded,
    /// No inbound traffic within the idle timeout
    Timeout,
    /// Process shutdown
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Superseded => write!(f, "superseded by a newer connection"),
            CloseReason::Timeout => write!(f, "idle timeout"),
            CloseReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Configuration shared by the registry, protocol handler and dispatcher
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Nominal line voltage used to derive active power
    pub nominal_voltage: f64,

    /// Setpoint assigned to a newly registered charge point
    pub default_setpoint_amps: f64,

    /// Heartbeat interval announced in boot replies
    pub heartbeat_interval: Duration,

    /// Concurrent command deliveries allowed across all charge points
    pub command_workers: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            nominal_voltage: 230.0,
            default_setpoint_amps: 8.0,
            heartbeat_interval: Duration::from_secs(10),
            command_workers: 16,
        }
    }
}

impl CoreConfig {
    /// Set nominal voltage
    pub fn with_nominal_voltage(mut self, volts: f64) -> Self {
        self.nominal_voltage = volts;
        self
    }

    /// Set the setpoint for newly registered charge points
    pub fn with_default_setpoint(mut self, amps: f64) -> Self {
        self.default_setpoint_amps = amps;
        self
    }

    /// Set heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the command delivery pool size
    pub fn with_command_workers(mut self, workers: usize) -> Self {
        self.command_workers = workers;
        self
    }
}
