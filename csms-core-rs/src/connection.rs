//! Seam between the registry and a live transport connection

use std::future::Future;

use crate::contract::OutboundRequest;
use crate::error::CommandError;
use crate::types::{CloseReason, ConnectionId, LifecycleState};

/// Handle to the protocol engine serving one connection.
///
/// The registry stores at most one handle per identity; the dispatcher uses
/// it to push commands. Implementations must not block in `close`.
pub trait ConnectionHandle: Clone + Send + Sync + 'static {
    fn connection_id(&self) -> ConnectionId;

    /// Ask the engine to close the connection
    fn close(&self, reason: CloseReason);

    /// Deliver a command and wait for the charge point's answer.
    ///
    /// The engine applies an accepted command's effect in order with the
    /// inbound traffic of the same connection and resolves with the state
    /// that followed. Resolves with `Timeout` when the engine gives up on the
    /// reply and with `ConnectionClosed` when the connection goes away first.
    fn deliver(
        &self,
        request: OutboundRequest,
    ) -> impl Future<Output = Result<LifecycleState, CommandError>> + Send;
}
