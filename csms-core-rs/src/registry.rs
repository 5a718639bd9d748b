//! Concurrent session registry
//!
//! Maps identity to a per-identity slot holding the charge point model and
//! the bound connection. Lock discipline:
//! - the map lock (`RwLock`) is only held to find or insert a slot;
//! - each slot has its own `Mutex`, held for one transition at a time;
//! - when both are needed the map lock is taken first;
//! - no lock is held across an `.await`.
//!
//! Duplicate connections follow a newest-wins policy: binding a second
//! connection for an identity evicts the first, which is told to close with
//! [`CloseReason::Superseded`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info};

use crate::connection::ConnectionHandle;
use crate::error::CoreError;
use crate::model::{ChargePointModel, StateChange, Transition};
use crate::types::{ChargePointId, CloseReason, ConnectionId, CoreConfig, LifecycleState};

struct Slot<C> {
    model: Option<ChargePointModel>,
    connection: Option<C>,
}

impl<C> Slot<C> {
    fn is_empty(&self) -> bool {
        self.model.is_none() && self.connection.is_none()
    }
}

type SharedSlot<C> = Arc<Mutex<Slot<C>>>;

/// Outcome of [`SessionRegistry::register_or_get`]
#[derive(Debug, Clone)]
pub struct Registration {
    pub model: ChargePointModel,
    /// True only for the call that created the model
    pub created: bool,
}

/// Read-only view of one charge point for dashboards and operators
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEntry {
    pub identity: ChargePointId,
    pub state: LifecycleState,
    pub current_amps: f64,
    pub setpoint_amps: f64,
    pub active_power_w: f64,
    pub status_code: u8,
    pub fault_code: Option<String>,
    pub connected: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Concurrent store of charge point sessions
pub struct SessionRegistry<C> {
    config: CoreConfig,
    slots: RwLock<BTreeMap<ChargePointId, SharedSlot<C>>>,
    next_transaction_id: AtomicI32,
}

impl<C: ConnectionHandle> SessionRegistry<C> {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            slots: RwLock::new(BTreeMap::new()),
            next_transaction_id: AtomicI32::new(1),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn slot(&self, identity: &str) -> Option<SharedSlot<C>> {
        self.slots.read().get(identity).cloned()
    }

    fn slot_or_insert(&self, identity: &str) -> SharedSlot<C> {
        if let Some(slot) = self.slot(identity) {
            return slot;
        }
        self.slots
            .write()
            .entry(identity.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(Slot {
                    model: None,
                    connection: None,
                }))
            })
            .clone()
    }

    /// Drop a slot that holds nothing and that no other thread is using
    fn prune(&self, identity: &str) {
        let mut slots = self.slots.write();
        let removable = match slots.get(identity) {
            // Only the map holds a reference, so no one can be about to fill it
            Some(slot) => Arc::strong_count(slot) == 1 && slot.lock().is_empty(),
            None => false,
        };
        if removable {
            slots.remove(identity);
        }
    }

    /// Return the model for `identity`, creating it on first sight.
    ///
    /// Concurrent calls for the same identity create exactly one model.
    pub fn register_or_get(&self, identity: &str, now: DateTime<Utc>) -> Registration {
        let slot = self.slot_or_insert(identity);
        let mut slot = slot.lock();
        match slot.model {
            Some(ref model) => Registration {
                model: model.clone(),
                created: false,
            },
            None => {
                let model = ChargePointModel::new(identity, self.config.default_setpoint_amps, now);
                slot.model = Some(model.clone());
                info!("Registered charge point {}", identity);
                Registration {
                    model,
                    created: true,
                }
            }
        }
    }

    /// Bind a live connection, evicting any previous one (newest wins).
    ///
    /// Returns the evicted handle, which has already been asked to close.
    pub fn bind_connection(&self, identity: &str, handle: C) -> Option<C> {
        let slot = self.slot_or_insert(identity);
        let new_id = handle.connection_id();
        let evicted = slot.lock().connection.replace(handle);

        if let Some(ref old) = evicted {
            info!(
                "Charge point {}: connection {} supersedes {}",
                identity,
                new_id,
                old.connection_id()
            );
            old.close(CloseReason::Superseded);
        } else {
            debug!("Charge point {}: bound connection {}", identity, new_id);
        }
        evicted
    }

    /// Unbind `connection_id` if it is still the bound connection.
    ///
    /// Drives `cause` (`Disconnect` or `Timeout`) on the model under the slot
    /// lock, so a newer connection's boot can never be overtaken by a stale
    /// link loss. Returns false when the connection had already been
    /// superseded.
    pub fn unbind_connection(
        &self,
        identity: &str,
        connection_id: ConnectionId,
        cause: Transition,
    ) -> bool {
        debug_assert!(matches!(cause, Transition::Disconnect | Transition::Timeout));
        let Some(slot) = self.slot(identity) else {
            return false;
        };

        let unbound = {
            let mut slot = slot.lock();
            let is_current = slot
                .connection
                .as_ref()
                .is_some_and(|c| c.connection_id() == connection_id);
            if is_current {
                slot.connection = None;
                if let Some(model) = slot.model.as_mut() {
                    // Link loss is accepted from every state
                    let _ = model.apply(cause, Utc::now());
                }
            }
            is_current
        };
        drop(slot);

        if unbound {
            info!("Charge point {}: connection {} unbound", identity, connection_id);
            self.prune(identity);
        } else {
            debug!(
                "Charge point {}: connection {} already superseded",
                identity, connection_id
            );
        }
        unbound
    }

    /// The live connection for `identity`, if any
    pub fn connection(&self, identity: &str) -> Option<C> {
        self.slot(identity)?.lock().connection.clone()
    }

    /// Copy of the model for `identity`
    pub fn get(&self, identity: &str) -> Result<ChargePointModel, CoreError> {
        self.slot(identity)
            .and_then(|slot| slot.lock().model.clone())
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))
    }

    /// Lifecycle state, `Unregistered` for identities without a model
    pub fn lifecycle_state(&self, identity: &str) -> LifecycleState {
        self.get(identity)
            .map(|model| model.state())
            .unwrap_or(LifecycleState::Unregistered)
    }

    /// Apply a transition to an existing model
    pub fn apply(
        &self,
        identity: &str,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<StateChange, CoreError> {
        let slot = self
            .slot(identity)
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))?;
        let mut slot = slot.lock();
        let model = slot
            .model
            .as_mut()
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))?;
        model.apply(transition, now)
    }

    /// Refresh `last_seen` without a transition
    pub fn touch(&self, identity: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        let slot = self
            .slot(identity)
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))?;
        let mut slot = slot.lock();
        let model = slot
            .model
            .as_mut()
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))?;
        model.touch(now);
        Ok(())
    }

    /// Read-only summary of every known identity, ordered by identity.
    ///
    /// Identities connected but not yet booted appear as `Unregistered`.
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        let slots: Vec<(ChargePointId, SharedSlot<C>)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let voltage = self.config.nominal_voltage;
        slots
            .into_iter()
            .filter_map(|(identity, slot)| {
                let slot = slot.lock();
                let connected = slot.connection.is_some();
                match slot.model {
                    Some(ref model) => Some(SnapshotEntry {
                        identity,
                        state: model.state(),
                        current_amps: model.current_amps(),
                        setpoint_amps: model.setpoint_amps(),
                        active_power_w: model.active_power(voltage),
                        status_code: model.state().status_code(),
                        fault_code: model.fault_code().map(str::to_string),
                        connected,
                        last_seen: Some(model.last_seen()),
                    }),
                    None if connected => Some(SnapshotEntry {
                        identity,
                        state: LifecycleState::Unregistered,
                        current_amps: 0.0,
                        setpoint_amps: 0.0,
                        active_power_w: 0.0,
                        status_code: LifecycleState::Unregistered.status_code(),
                        fault_code: None,
                        connected,
                        last_seen: None,
                    }),
                    None => None,
                }
            })
            .collect()
    }

    /// Explicitly forget a charge point. Refused while it is connected.
    pub fn remove(&self, identity: &str) -> Result<ChargePointModel, CoreError> {
        let slot = self
            .slot(identity)
            .ok_or_else(|| CoreError::NotFound(identity.to_string()))?;
        let model = {
            let mut slot = slot.lock();
            if slot.connection.is_some() {
                return Err(CoreError::SessionActive(identity.to_string()));
            }
            slot.model
                .take()
                .ok_or_else(|| CoreError::NotFound(identity.to_string()))?
        };
        drop(slot);
        self.prune(identity);
        info!("Removed charge point {}", identity);
        Ok(model)
    }

    /// Ask every bound connection to close. Returns how many were asked.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let handles: Vec<C> = self
            .slots
            .read()
            .values()
            .filter_map(|slot| slot.lock().connection.clone())
            .collect();
        for handle in &handles {
            handle.close(reason);
        }
        handles.len()
    }

    /// Number of identities with a bound connection
    pub fn connected_count(&self) -> usize {
        self.slots
            .read()
            .values()
            .filter(|slot| slot.lock().connection.is_some())
            .count()
    }

    /// Next transaction id for StartTransaction replies
    pub fn allocate_transaction_id(&self) -> i32 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }
}
