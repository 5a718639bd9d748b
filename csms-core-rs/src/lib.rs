//! CSMS Core Library
//!
//! Charge-point session protocol core for EV charging networks.
//! Implements the lifecycle state machine, a concurrent session registry
//! and operator command dispatch, independent of any wire protocol.

pub mod types;
pub mod error;
pub mod model;
pub mod contract;
pub mod connection;
pub mod registry;
pub mod protocol;
pub mod dispatcher;

pub use types::*;
pub use error::{CommandError, CoreError};
pub use model::{ChargePointModel, StateChange, Transition};
pub use connection::ConnectionHandle;
pub use registry::{Registration, SessionRegistry, SnapshotEntry};
pub use protocol::{apply_command_effect, handle_inbound, resolve_command};
pub use dispatcher::{Command, CommandDispatcher, Confirmation};
