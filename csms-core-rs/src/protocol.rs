//! Transport-independent session protocol handling
//!
//! Applies one decoded [`Inbound`] message to the registry and builds the
//! [`InboundReply`]. The wire adapter owns framing and correlation; everything
//! that touches the model lives here so every adapter enforces the same
//! contract.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::contract::{
    Inbound, InboundReply, OutboundReply, OutboundRequest, RegistrationStatus, ReportedStatus,
    NO_ERROR,
};
use crate::error::{CommandError, CoreError};
use crate::model::{check_current, StateChange, Transition};
use crate::registry::SessionRegistry;
use crate::types::LifecycleState;

/// Longest vendor or model string accepted in a boot message
pub const MAX_BOOT_FIELD_LEN: usize = 20;

/// Fault code latched when a charge point reports `Faulted` without a code
pub const UNSPECIFIED_FAULT: &str = "OtherError";

fn valid_boot_field(value: &str) -> bool {
    !value.trim().is_empty() && value.chars().count() <= MAX_BOOT_FIELD_LEN
}

/// Unknown identities have not booted yet
fn require_registered(err: CoreError, what: &str) -> CoreError {
    match err {
        CoreError::NotFound(identity) => {
            CoreError::ProtocolViolation(format!("{} from {} before boot", what, identity))
        }
        other => other,
    }
}

/// Apply one inbound message for `identity` and build the reply.
///
/// On error no model was changed; the adapter answers with an error frame and
/// keeps the connection open.
pub fn handle_inbound<C: ConnectionHandle>(
    registry: &SessionRegistry<C>,
    identity: &str,
    message: Inbound,
    now: DateTime<Utc>,
) -> Result<InboundReply, CoreError> {
    match message {
        Inbound::Boot { vendor, model } => {
            // Whole seconds on the wire, never zero
            let interval_secs =
                u32::try_from(registry.config().heartbeat_interval.as_secs().max(1)).unwrap_or(u32::MAX);
            if !valid_boot_field(&vendor) || !valid_boot_field(&model) {
                warn!(
                    "Rejecting boot from {}: vendor {:?} model {:?}",
                    identity, vendor, model
                );
                return Ok(InboundReply::Boot {
                    status: RegistrationStatus::Rejected,
                    interval_secs,
                    server_time: now,
                });
            }

            registry.register_or_get(identity, now);
            let change = registry.apply(identity, Transition::BootAccepted { vendor, model }, now)?;
            info!("Boot accepted from {} ({} -> {})", identity, change.from, change.to);
            Ok(InboundReply::Boot {
                status: RegistrationStatus::Accepted,
                interval_secs,
                server_time: now,
            })
        }

        Inbound::StatusReport { error_code, status } => {
            let state = match registry.get(identity) {
                Ok(model) => model.state(),
                Err(_) => {
                    debug!("Ignoring status {:?} from unregistered {}", status, identity);
                    return Ok(InboundReply::Ack);
                }
            };

            let result = if error_code != NO_ERROR || status == ReportedStatus::Faulted {
                let code = if error_code == NO_ERROR {
                    UNSPECIFIED_FAULT.to_string()
                } else {
                    error_code
                };
                registry.apply(identity, Transition::FaultSignal { code }, now)
            } else if status == ReportedStatus::Preparing && state == LifecycleState::Available {
                let setpoint_amps = registry.get(identity)?.setpoint_amps();
                registry.apply(identity, Transition::StartCharging { setpoint_amps }, now)
            } else {
                registry.touch(identity, now).map(|_| StateChange {
                    from: state,
                    to: state,
                })
            };

            // Status reports are informational; never reject them
            if let Err(e) = result {
                warn!("Status {:?} from {} not applied: {}", status, identity, e);
            }
            Ok(InboundReply::Ack)
        }

        Inbound::MeterValues { current_amps } => {
            match current_amps {
                Some(current_amps) => {
                    check_current(current_amps)?;
                    registry
                        .apply(identity, Transition::MeterReport { current_amps }, now)
                        .map_err(|e| require_registered(e, "meter values"))?;
                }
                None => {
                    registry
                        .touch(identity, now)
                        .map_err(|e| require_registered(e, "meter values"))?;
                }
            }
            Ok(InboundReply::Ack)
        }

        Inbound::Heartbeat => {
            registry
                .touch(identity, now)
                .map_err(|e| require_registered(e, "heartbeat"))?;
            Ok(InboundReply::Heartbeat { server_time: now })
        }

        Inbound::TransactionStarted { id_tag, meter_start_wh } => {
            // Fail before burning a transaction id
            registry
                .get(identity)
                .map_err(|e| require_registered(e, "start transaction"))?;
            let transaction_id = registry.allocate_transaction_id();
            registry.apply(identity, Transition::TransactionStarted { transaction_id }, now)?;
            info!(
                "Transaction {} started on {} (idTag {}, meter {} Wh)",
                transaction_id, identity, id_tag, meter_start_wh
            );
            Ok(InboundReply::TransactionStarted { transaction_id })
        }

        Inbound::TransactionStopped {
            transaction_id,
            meter_stop_wh,
        } => {
            registry
                .apply(identity, Transition::StopCharging, now)
                .map_err(|e| require_registered(e, "stop transaction"))?;
            info!(
                "Transaction {} stopped on {} (meter {} Wh)",
                transaction_id, identity, meter_stop_wh
            );
            Ok(InboundReply::Ack)
        }
    }
}

/// Apply the model effect of a command the charge point accepted
pub fn apply_command_effect<C: ConnectionHandle>(
    registry: &SessionRegistry<C>,
    identity: &str,
    request: &OutboundRequest,
    now: DateTime<Utc>,
) -> Result<StateChange, CoreError> {
    let transition = match *request {
        OutboundRequest::RemoteStart { setpoint_amps } => Transition::StartCharging { setpoint_amps },
        OutboundRequest::SetCurrent { amps } => Transition::SetpointChanged {
            setpoint_amps: amps,
        },
        OutboundRequest::RemoteStop { .. } => Transition::StopCharging,
        OutboundRequest::ClearFault => Transition::ResetFault { acknowledged: true },
    };
    registry.apply(identity, transition, now)
}

/// Turn the charge point's answer to a command into the caller's outcome.
///
/// Called by the engine when the reply arrives, so the effect lands before
/// any later inbound frame of the same connection is applied.
pub fn resolve_command<C: ConnectionHandle>(
    registry: &SessionRegistry<C>,
    identity: &str,
    request: &OutboundRequest,
    reply: OutboundReply,
    now: DateTime<Utc>,
) -> Result<LifecycleState, CommandError> {
    match reply {
        OutboundReply::Accepted => apply_command_effect(registry, identity, request, now)
            .map(|change| change.to)
            .map_err(|e| match e {
                CoreError::InvariantBreach(msg) => CommandError::InvariantBreach(msg),
                // The model moved on while the command was in flight
                other => CommandError::PreconditionFailed {
                    state: registry.lifecycle_state(identity),
                    reason: other.to_string(),
                },
            }),
        OutboundReply::Rejected => Err(CommandError::Rejected(format!(
            "{:?} rejected by charge point {}",
            request.kind(),
            identity
        ))),
    }
}
