//! Operator command dispatch
//!
//! Validates a command against the target's current state and delivers it over
//! the bound connection, whose engine applies the accepted effect.
//! Deliveries are bounded by a shared pool of permits; there is no queueing
//! beyond waiting for a permit and no retry.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::connection::ConnectionHandle;
use crate::contract::OutboundRequest;
use crate::error::{CommandError, CoreError};
use crate::model::check_setpoint;
use crate::registry::SessionRegistry;
use crate::types::{ChargePointId, LifecycleState};

/// Operator-issued command
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum Command {
    /// Change the maximum charging current
    SetCurrent { amps: f64 },
    /// Ask the charge point to start charging with a setpoint
    RemoteStart { setpoint_amps: f64 },
    /// Stop the running transaction
    RemoteStop,
    /// Reset a latched fault
    ClearFault,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetCurrent { amps } => write!(f, "SetCurrent({} A)", amps),
            Command::RemoteStart { setpoint_amps } => write!(f, "RemoteStart({} A)", setpoint_amps),
            Command::RemoteStop => write!(f, "RemoteStop"),
            Command::ClearFault => write!(f, "ClearFault"),
        }
    }
}

/// Successful command outcome
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Confirmation {
    pub identity: ChargePointId,
    pub command: Command,
    /// Lifecycle state after the effect was applied
    pub state: LifecycleState,
}

/// Routes operator commands to live connections
pub struct CommandDispatcher<C> {
    registry: Arc<SessionRegistry<C>>,
    permits: Arc<Semaphore>,
}

impl<C> Clone for CommandDispatcher<C> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<C: ConnectionHandle> CommandDispatcher<C> {
    pub fn new(registry: Arc<SessionRegistry<C>>) -> Self {
        let workers = registry.config().command_workers.max(1);
        Self {
            registry,
            permits: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<C>> {
        &self.registry
    }

    /// Deliver `command` to `identity` and wait for the outcome
    pub async fn submit(&self, identity: &str, command: Command) -> Result<Confirmation, CommandError> {
        let handle = self
            .registry
            .connection(identity)
            .ok_or_else(|| CommandError::NoActiveSession(identity.to_string()))?;

        let request = self.prepare(identity, command)?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CommandError::ConnectionClosed)?;

        info!("Delivering {} to {}", command, identity);
        match handle.deliver(request).await {
            Ok(state) => {
                info!("{} accepted by {} (now {})", command, identity, state);
                Ok(Confirmation {
                    identity: identity.to_string(),
                    command,
                    state,
                })
            }
            Err(e) => {
                warn!("{} to {} failed: {}", command, identity, e);
                Err(e)
            }
        }
    }

    /// Check preconditions and build the wire-independent request
    fn prepare(&self, identity: &str, command: Command) -> Result<OutboundRequest, CommandError> {
        let model = self.registry.get(identity).ok();
        let state = model
            .as_ref()
            .map(|m| m.state())
            .unwrap_or(LifecycleState::Unregistered);

        let precondition = |reason: &str| CommandError::PreconditionFailed {
            state,
            reason: reason.to_string(),
        };

        match command {
            Command::SetCurrent { amps } => {
                check_setpoint(amps).map_err(invariant)?;
                if !state.can_charge() {
                    return Err(precondition("current can only be set on a registered, healthy charge point"));
                }
                Ok(OutboundRequest::SetCurrent { amps })
            }
            Command::RemoteStart { setpoint_amps } => {
                check_setpoint(setpoint_amps).map_err(invariant)?;
                if !state.can_charge() {
                    return Err(precondition("charge point cannot start charging"));
                }
                Ok(OutboundRequest::RemoteStart { setpoint_amps })
            }
            Command::RemoteStop => {
                if !matches!(state, LifecycleState::Preparing | LifecycleState::Charging) {
                    return Err(precondition("nothing to stop"));
                }
                let transaction_id = model
                    .and_then(|m| m.transaction_id())
                    .ok_or_else(|| precondition("no known transaction"))?;
                Ok(OutboundRequest::RemoteStop { transaction_id })
            }
            Command::ClearFault => {
                if state != LifecycleState::Faulted {
                    return Err(precondition("no fault to clear"));
                }
                Ok(OutboundRequest::ClearFault)
            }
        }
    }
}

fn invariant(err: CoreError) -> CommandError {
    CommandError::InvariantBreach(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::OutboundReply;
    use crate::model::Transition;
    use crate::registry::tests::FakeConnection;
    use crate::types::CoreConfig;
    use chrono::Utc;

    fn setup(handle: FakeConnection) -> CommandDispatcher<FakeConnection> {
        let registry = Arc::new(SessionRegistry::new(CoreConfig::default()));
        registry.register_or_get("CP001", Utc::now());
        registry
            .apply(
                "CP001",
                Transition::BootAccepted {
                    vendor: "Acme".into(),
                    model: "Wallbox".into(),
                },
                Utc::now(),
            )
            .unwrap();
        handle.attach("CP001", &registry);
        registry.bind_connection("CP001", handle);
        CommandDispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_no_active_session() {
        let dispatcher = setup(FakeConnection::new(1));
        let err = dispatcher.submit("CP404", Command::RemoteStop).await.unwrap_err();
        assert_eq!(err, CommandError::NoActiveSession("CP404".into()));
    }

    #[tokio::test]
    async fn test_no_session_after_disconnect() {
        let dispatcher = setup(FakeConnection::new(1));
        dispatcher
            .registry()
            .unbind_connection("CP001", 1, Transition::Disconnect);
        let err = dispatcher
            .submit("CP001", Command::SetCurrent { amps: 10.0 })
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::NoActiveSession("CP001".into()));
    }

    #[tokio::test]
    async fn test_remote_start_accepted_applies_effect() {
        let handle = FakeConnection::new(1);
        let dispatcher = setup(handle.clone());

        let confirmation = dispatcher
            .submit("CP001", Command::RemoteStart { setpoint_amps: 16.0 })
            .await
            .unwrap();
        assert_eq!(confirmation.state, LifecycleState::Preparing);
        assert_eq!(
            handle.delivered.lock().as_slice(),
            &[OutboundRequest::RemoteStart { setpoint_amps: 16.0 }]
        );
        assert_eq!(dispatcher.registry().get("CP001").unwrap().setpoint_amps(), 16.0);
    }

    #[tokio::test]
    async fn test_rejected_leaves_model_unchanged() {
        let dispatcher = setup(FakeConnection::replying(1, Ok(OutboundReply::Rejected)));
        let err = dispatcher
            .submit("CP001", Command::RemoteStart { setpoint_amps: 16.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected(_)));
        assert_eq!(
            dispatcher.registry().lifecycle_state("CP001"),
            LifecycleState::Available
        );
    }

    #[tokio::test]
    async fn test_transport_errors_pass_through() {
        let dispatcher = setup(FakeConnection::replying(1, Err(CommandError::Timeout)));
        let err = dispatcher
            .submit("CP001", Command::SetCurrent { amps: 6.0 })
            .await
            .unwrap_err();
        assert_eq!(err, CommandError::Timeout);
        assert_eq!(dispatcher.registry().get("CP001").unwrap().setpoint_amps(), 8.0);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let handle = FakeConnection::new(1);
        let dispatcher = setup(handle.clone());

        let err = dispatcher
            .submit("CP001", Command::SetCurrent { amps: 0.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvariantBreach(_)));

        let err = dispatcher.submit("CP001", Command::RemoteStop).await.unwrap_err();
        assert!(matches!(err, CommandError::PreconditionFailed { .. }));

        let err = dispatcher.submit("CP001", Command::ClearFault).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::PreconditionFailed {
                state: LifecycleState::Available,
                ..
            }
        ));

        dispatcher
            .registry()
            .apply(
                "CP001",
                Transition::FaultSignal {
                    code: "GroundFailure".into(),
                },
                Utc::now(),
            )
            .unwrap();
        let err = dispatcher
            .submit("CP001", Command::SetCurrent { amps: 10.0 })
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::PreconditionFailed { .. }));

        // Nothing was delivered for the refused commands
        assert!(handle.delivered.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clear_fault_and_remote_stop() {
        let handle = FakeConnection::new(1);
        let dispatcher = setup(handle.clone());
        let registry = dispatcher.registry().clone();

        registry
            .apply(
                "CP001",
                Transition::FaultSignal {
                    code: "GroundFailure".into(),
                },
                Utc::now(),
            )
            .unwrap();
        let confirmation = dispatcher.submit("CP001", Command::ClearFault).await.unwrap();
        assert_eq!(confirmation.state, LifecycleState::Available);

        registry
            .apply("CP001", Transition::TransactionStarted { transaction_id: 42 }, Utc::now())
            .unwrap();
        registry
            .apply("CP001", Transition::MeterReport { current_amps: 8.0 }, Utc::now())
            .unwrap();
        let confirmation = dispatcher.submit("CP001", Command::RemoteStop).await.unwrap();
        assert_eq!(confirmation.state, LifecycleState::Available);
        assert_eq!(
            handle.delivered.lock().last(),
            Some(&OutboundRequest::RemoteStop { transaction_id: 42 })
        );
    }
}
