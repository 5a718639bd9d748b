//! Charge point lifecycle state machine
//!
//! Pure data, no I/O. Every mutation goes through [`ChargePointModel::apply`],
//! which either performs a complete transition or leaves the model untouched.
//!
//! ```text
//! Unregistered ──Boot──► Available ──Start──► Preparing ──I>0──► Charging
//!                            ▲                                      │
//!                            └──────────────── I=0 / Stop ──────────┘
//!   any ──Fault──► Faulted ──Reset(ack)──► Available
//!   any ──Disconnect/Timeout──► Unavailable ──Boot──► Available
//! ```
//!
//! `current_amps <= setpoint_amps` holds after every transition. A setpoint
//! below the flowing current is held as pending and committed by the first
//! transition that leaves the current at or under it (a ramp-down report, a
//! stop, a fault or a link loss). Until then reports are checked against the
//! committed setpoint.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::CoreError;
use crate::types::{ChargePointId, LifecycleState};

/// Inputs that drive the lifecycle state machine
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Registration accepted for a fresh boot
    BootAccepted { vendor: String, model: String },
    /// Charging requested with a maximum current
    StartCharging { setpoint_amps: f64 },
    /// Measured delivered current
    MeterReport { current_amps: f64 },
    /// Error signalled by the charge point
    FaultSignal { code: String },
    /// Fault reset, effective only when acknowledged by the charge point
    ResetFault { acknowledged: bool },
    /// Transport closed
    Disconnect,
    /// No inbound traffic within the idle timeout
    Timeout,
    /// New setpoint without a state change
    SetpointChanged { setpoint_amps: f64 },
    /// Charging ended by a confirmed stop
    StopCharging,
    /// Charge point opened a transaction
    TransactionStarted { transaction_id: i32 },
}

impl Transition {
    /// Transitions caused by inbound traffic refresh `last_seen`
    fn is_inbound(&self) -> bool {
        !matches!(self, Transition::Disconnect | Transition::Timeout)
    }
}

/// Result of a successful transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

impl StateChange {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// One charge point's lifecycle and measured quantities
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChargePointModel {
    identity: ChargePointId,
    state: LifecycleState,
    current_amps: f64,
    setpoint_amps: f64,
    pending_setpoint_amps: Option<f64>,
    fault_code: Option<String>,
    vendor: Option<String>,
    model: Option<String>,
    transaction_id: Option<i32>,
    last_seen: DateTime<Utc>,
}

impl ChargePointModel {
    /// Create an unregistered model
    pub fn new(identity: impl Into<ChargePointId>, setpoint_amps: f64, now: DateTime<Utc>) -> Self {
        Self {
            identity: identity.into(),
            state: LifecycleState::Unregistered,
            current_amps: 0.0,
            setpoint_amps: setpoint_amps.max(0.0),
            pending_setpoint_amps: None,
            fault_code: None,
            vendor: None,
            model: None,
            transaction_id: None,
            last_seen: now,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn current_amps(&self) -> f64 {
        self.current_amps
    }

    pub fn setpoint_amps(&self) -> f64 {
        self.setpoint_amps
    }

    /// Lower setpoint waiting for the current to ramp down
    pub fn pending_setpoint_amps(&self) -> Option<f64> {
        self.pending_setpoint_amps
    }

    pub fn fault_code(&self) -> Option<&str> {
        self.fault_code.as_deref()
    }

    pub fn vendor(&self) -> Option<&str> {
        self.vendor.as_deref()
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn transaction_id(&self) -> Option<i32> {
        self.transaction_id
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    /// Derived active power in watts
    pub fn active_power(&self, nominal_voltage: f64) -> f64 {
        self.current_amps * nominal_voltage
    }

    /// Record inbound traffic that carries no state change
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Apply a transition. On error the model is unchanged.
    pub fn apply(&mut self, transition: Transition, now: DateTime<Utc>) -> Result<StateChange, CoreError> {
        let from = self.state;
        let inbound = transition.is_inbound();

        match transition {
            Transition::BootAccepted { vendor, model } => {
                self.vendor = Some(vendor);
                self.model = Some(model);
                self.current_amps = 0.0;
                self.transaction_id = None;
                // A latched fault survives a reboot
                if from != LifecycleState::Faulted {
                    self.state = LifecycleState::Available;
                }
            }

            Transition::StartCharging { setpoint_amps } => {
                check_setpoint(setpoint_amps)?;
                match from {
                    LifecycleState::Available => {
                        self.request_setpoint(setpoint_amps);
                        self.state = LifecycleState::Preparing;
                    }
                    LifecycleState::Preparing | LifecycleState::Charging => {
                        self.request_setpoint(setpoint_amps);
                    }
                    other => {
                        return Err(CoreError::ProtocolViolation(format!(
                            "cannot start charging while {}",
                            other
                        )));
                    }
                }
            }

            Transition::MeterReport { current_amps } => {
                check_current(current_amps)?;
                match from {
                    LifecycleState::Unregistered | LifecycleState::Unavailable => {
                        return Err(CoreError::ProtocolViolation(format!(
                            "meter report while {}",
                            from
                        )));
                    }
                    LifecycleState::Available | LifecycleState::Faulted => {
                        if current_amps > 0.0 {
                            return Err(CoreError::ProtocolViolation(format!(
                                "{} A reported while {}",
                                current_amps, from
                            )));
                        }
                        self.current_amps = 0.0;
                    }
                    LifecycleState::Preparing | LifecycleState::Charging => {
                        if current_amps > self.setpoint_amps {
                            return Err(CoreError::InvariantBreach(format!(
                                "{} A exceeds setpoint {} A",
                                current_amps, self.setpoint_amps
                            )));
                        }
                        self.current_amps = current_amps;
                        self.state = if current_amps > 0.0 {
                            LifecycleState::Charging
                        } else if from == LifecycleState::Charging {
                            LifecycleState::Available
                        } else {
                            LifecycleState::Preparing
                        };
                    }
                }
            }

            Transition::FaultSignal { code } => {
                self.fault_code = Some(code);
                self.current_amps = 0.0;
                self.state = LifecycleState::Faulted;
            }

            Transition::ResetFault { acknowledged } => {
                if from != LifecycleState::Faulted {
                    return Err(CoreError::ProtocolViolation(format!(
                        "no fault to reset while {}",
                        from
                    )));
                }
                if !acknowledged {
                    return Err(CoreError::ProtocolViolation(
                        "fault reset was not acknowledged".to_string(),
                    ));
                }
                self.fault_code = None;
                self.transaction_id = None;
                self.state = LifecycleState::Available;
            }

            Transition::Disconnect | Transition::Timeout => {
                self.current_amps = 0.0;
                self.state = LifecycleState::Unavailable;
            }

            Transition::SetpointChanged { setpoint_amps } => {
                check_setpoint(setpoint_amps)?;
                if !from.can_charge() {
                    return Err(CoreError::ProtocolViolation(format!(
                        "cannot change setpoint while {}",
                        from
                    )));
                }
                self.request_setpoint(setpoint_amps);
            }

            Transition::StopCharging => match from {
                LifecycleState::Unregistered => {
                    return Err(CoreError::ProtocolViolation(
                        "stop before registration".to_string(),
                    ));
                }
                LifecycleState::Preparing | LifecycleState::Charging => {
                    self.current_amps = 0.0;
                    self.transaction_id = None;
                    self.state = LifecycleState::Available;
                }
                _ => {
                    self.transaction_id = None;
                }
            },

            Transition::TransactionStarted { transaction_id } => match from {
                LifecycleState::Available => {
                    check_setpoint(self.setpoint_amps)?;
                    self.transaction_id = Some(transaction_id);
                    self.state = LifecycleState::Preparing;
                }
                LifecycleState::Preparing | LifecycleState::Charging => {
                    self.transaction_id = Some(transaction_id);
                }
                other => {
                    return Err(CoreError::ProtocolViolation(format!(
                        "transaction started while {}",
                        other
                    )));
                }
            },
        }

        self.settle_setpoint();
        if inbound {
            self.touch(now);
        }

        let change = StateChange { from, to: self.state };
        if change.changed() {
            debug!("{}: {} -> {}", self.identity, change.from, change.to);
        }
        Ok(change)
    }

    fn request_setpoint(&mut self, setpoint_amps: f64) {
        if setpoint_amps >= self.current_amps {
            self.setpoint_amps = setpoint_amps;
            self.pending_setpoint_amps = None;
        } else {
            self.pending_setpoint_amps = Some(setpoint_amps);
        }
    }

    fn settle_setpoint(&mut self) {
        if let Some(pending) = self.pending_setpoint_amps {
            if self.current_amps <= pending {
                self.setpoint_amps = pending;
                self.pending_setpoint_amps = None;
            }
        }
    }
}

/// Reject currents that cannot be physical
pub fn check_current(current_amps: f64) -> Result<(), CoreError> {
    if !current_amps.is_finite() || current_amps < 0.0 {
        return Err(CoreError::InvariantBreach(format!(
            "current must be a non-negative number, got {}",
            current_amps
        )));
    }
    Ok(())
}

/// Setpoints must be strictly positive
pub fn check_setpoint(setpoint_amps: f64) -> Result<(), CoreError> {
    if !setpoint_amps.is_finite() || setpoint_amps <= 0.0 {
        return Err(CoreError::InvariantBreach(format!(
            "setpoint must be greater than zero, got {}",
            setpoint_amps
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booted() -> ChargePointModel {
        let mut cp = ChargePointModel::new("CP001", 8.0, Utc::now());
        cp.apply(
            Transition::BootAccepted {
                vendor: "Acme".into(),
                model: "Wallbox".into(),
            },
            Utc::now(),
        )
        .unwrap();
        cp
    }

    #[test]
    fn test_boot_from_unregistered() {
        let cp = booted();
        assert_eq!(cp.state(), LifecycleState::Available);
        assert_eq!(cp.current_amps(), 0.0);
        assert_eq!(cp.vendor(), Some("Acme"));
    }

    #[test]
    fn test_charging_cycle() {
        let mut cp = booted();
        let now = Utc::now();

        let change = cp
            .apply(Transition::StartCharging { setpoint_amps: 8.0 }, now)
            .unwrap();
        assert_eq!(change.to, LifecycleState::Preparing);

        let change = cp
            .apply(Transition::MeterReport { current_amps: 8.0 }, now)
            .unwrap();
        assert_eq!(change.from, LifecycleState::Preparing);
        assert_eq!(change.to, LifecycleState::Charging);
        assert_eq!(cp.active_power(230.0), 8.0 * 230.0);

        cp.apply(Transition::MeterReport { current_amps: 0.0 }, now)
            .unwrap();
        assert_eq!(cp.state(), LifecycleState::Available);
    }

    #[test]
    fn test_zero_report_keeps_preparing() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 16.0 }, Utc::now())
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 0.0 }, Utc::now())
            .unwrap();
        assert_eq!(cp.state(), LifecycleState::Preparing);
    }

    #[test]
    fn test_start_while_charging_is_idempotent() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 16.0 }, Utc::now())
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 10.0 }, Utc::now())
            .unwrap();

        let change = cp
            .apply(Transition::StartCharging { setpoint_amps: 12.0 }, Utc::now())
            .unwrap();
        assert!(!change.changed());
        assert_eq!(cp.state(), LifecycleState::Charging);
        assert_eq!(cp.setpoint_amps(), 12.0);
        assert_eq!(cp.current_amps(), 10.0);
    }

    #[test]
    fn test_lower_setpoint_waits_for_ramp_down() {
        let mut cp = booted();
        let now = Utc::now();
        cp.apply(Transition::StartCharging { setpoint_amps: 16.0 }, now)
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 10.0 }, now)
            .unwrap();

        cp.apply(Transition::SetpointChanged { setpoint_amps: 6.0 }, now)
            .unwrap();
        assert_eq!(cp.setpoint_amps(), 16.0);
        assert_eq!(cp.pending_setpoint_amps(), Some(6.0));

        // A newer, even lower request replaces the pending one
        cp.apply(Transition::StartCharging { setpoint_amps: 4.0 }, now)
            .unwrap();
        assert_eq!(cp.pending_setpoint_amps(), Some(4.0));
        assert!(cp.current_amps() <= cp.setpoint_amps());

        // Ramp-down reports above the new limit are still accepted
        cp.apply(Transition::MeterReport { current_amps: 7.0 }, now)
            .unwrap();
        assert_eq!(cp.current_amps(), 7.0);
        assert_eq!(cp.setpoint_amps(), 16.0);

        cp.apply(Transition::MeterReport { current_amps: 4.0 }, now)
            .unwrap();
        assert_eq!(cp.setpoint_amps(), 4.0);
        assert_eq!(cp.pending_setpoint_amps(), None);

        let err = cp
            .apply(Transition::MeterReport { current_amps: 5.0 }, now)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantBreach(_)));
        assert_eq!(cp.current_amps(), 4.0);
    }

    #[test]
    fn test_pending_setpoint_commits_when_current_stops() {
        let mut cp = booted();
        let now = Utc::now();
        cp.apply(Transition::StartCharging { setpoint_amps: 16.0 }, now)
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 12.0 }, now)
            .unwrap();
        cp.apply(Transition::SetpointChanged { setpoint_amps: 6.0 }, now)
            .unwrap();

        cp.apply(Transition::Disconnect, now).unwrap();
        assert_eq!(cp.setpoint_amps(), 6.0);
        assert_eq!(cp.pending_setpoint_amps(), None);
    }

    #[test]
    fn test_raised_setpoint_applies_at_once() {
        let mut cp = booted();
        let now = Utc::now();
        cp.apply(Transition::StartCharging { setpoint_amps: 8.0 }, now)
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 8.0 }, now)
            .unwrap();
        cp.apply(Transition::SetpointChanged { setpoint_amps: 8.0 }, now)
            .unwrap();
        assert_eq!(cp.pending_setpoint_amps(), None);
        cp.apply(Transition::SetpointChanged { setpoint_amps: 12.0 }, now)
            .unwrap();
        assert_eq!(cp.setpoint_amps(), 12.0);
    }

    #[test]
    fn test_start_rejects_zero_setpoint() {
        let mut cp = booted();
        let before = cp.clone();
        let err = cp
            .apply(Transition::StartCharging { setpoint_amps: 0.0 }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantBreach(_)));
        assert_eq!(cp, before);
    }

    #[test]
    fn test_meter_before_boot_is_violation() {
        let mut cp = ChargePointModel::new("CP001", 8.0, Utc::now());
        let err = cp
            .apply(Transition::MeterReport { current_amps: 5.0 }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CoreError::ProtocolViolation(_)));
        assert_eq!(cp.state(), LifecycleState::Unregistered);
    }

    #[test]
    fn test_negative_current_is_breach() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 8.0 }, Utc::now())
            .unwrap();
        let before = cp.clone();
        let err = cp
            .apply(Transition::MeterReport { current_amps: -1.0 }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantBreach(_)));
        assert_eq!(cp, before);
    }

    #[test]
    fn test_current_above_setpoint_is_breach() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 8.0 }, Utc::now())
            .unwrap();
        let err = cp
            .apply(Transition::MeterReport { current_amps: 9.5 }, Utc::now())
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantBreach(_)));
        assert_eq!(cp.state(), LifecycleState::Preparing);
    }

    #[test]
    fn test_fault_latches_until_acknowledged_reset() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 8.0 }, Utc::now())
            .unwrap();
        cp.apply(Transition::MeterReport { current_amps: 8.0 }, Utc::now())
            .unwrap();

        cp.apply(
            Transition::FaultSignal {
                code: "GroundFailure".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cp.state(), LifecycleState::Faulted);
        assert_eq!(cp.current_amps(), 0.0);
        assert_eq!(cp.fault_code(), Some("GroundFailure"));

        // Reboot does not clear the fault
        cp.apply(
            Transition::BootAccepted {
                vendor: "Acme".into(),
                model: "Wallbox".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cp.state(), LifecycleState::Faulted);

        assert!(cp
            .apply(Transition::ResetFault { acknowledged: false }, Utc::now())
            .is_err());
        assert_eq!(cp.state(), LifecycleState::Faulted);

        cp.apply(Transition::ResetFault { acknowledged: true }, Utc::now())
            .unwrap();
        assert_eq!(cp.state(), LifecycleState::Available);
        assert_eq!(cp.fault_code(), None);
    }

    #[test]
    fn test_disconnect_keeps_setpoint_and_fault() {
        let mut cp = booted();
        cp.apply(Transition::StartCharging { setpoint_amps: 12.0 }, Utc::now())
            .unwrap();
        cp.apply(
            Transition::FaultSignal {
                code: "OverCurrentFailure".into(),
            },
            Utc::now(),
        )
        .unwrap();
        let seen = cp.last_seen();

        cp.apply(Transition::Disconnect, Utc::now()).unwrap();
        assert_eq!(cp.state(), LifecycleState::Unavailable);
        assert_eq!(cp.setpoint_amps(), 12.0);
        assert_eq!(cp.fault_code(), Some("OverCurrentFailure"));
        assert_eq!(cp.last_seen(), seen);
    }

    #[test]
    fn test_reconnect_boot_returns_to_available() {
        let mut cp = booted();
        cp.apply(Transition::Timeout, Utc::now()).unwrap();
        assert_eq!(cp.state(), LifecycleState::Unavailable);
        assert!(cp
            .apply(Transition::MeterReport { current_amps: 0.0 }, Utc::now())
            .is_err());

        cp.apply(
            Transition::BootAccepted {
                vendor: "Acme".into(),
                model: "Wallbox".into(),
            },
            Utc::now(),
        )
        .unwrap();
        assert_eq!(cp.state(), LifecycleState::Available);
    }

    #[test]
    fn test_transaction_start_and_stop() {
        let mut cp = booted();
        cp.apply(Transition::TransactionStarted { transaction_id: 7 }, Utc::now())
            .unwrap();
        assert_eq!(cp.state(), LifecycleState::Preparing);
        assert_eq!(cp.transaction_id(), Some(7));

        cp.apply(Transition::MeterReport { current_amps: 6.0 }, Utc::now())
            .unwrap();
        cp.apply(Transition::StopCharging, Utc::now()).unwrap();
        assert_eq!(cp.state(), LifecycleState::Available);
        assert_eq!(cp.current_amps(), 0.0);
        assert_eq!(cp.transaction_id(), None);
    }
}
