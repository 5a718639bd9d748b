//! Per-connection protocol engine
//!
//! One engine task serves one charge point connection:
//! - inbound CALLs are decoded, applied through the session core and answered
//!   strictly in receipt order;
//! - operator commands arrive through an [`EngineHandle`], go out as CALLs with
//!   ids from the engine's own `csms-<n>` namespace and are matched to the
//!   CALLRESULT / CALLERROR that answers them;
//! - after an accepted boot the model's setpoint goes out as a default
//!   charging profile, so a locally started transaction stays within it;
//! - pending commands time out after `command_timeout`;
//! - an idle connection is closed after `idle_timeout`.
//!
//! When the loop ends, the connection is unbound from the registry and every
//! pending command resolves with `ConnectionClosed`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use csms_core::contract::{Direction, InboundReply, OutboundRequest, RegistrationStatus};
use csms_core::{
    handle_inbound, resolve_command, ChargePointId, CloseReason, CommandError, ConnectionHandle,
    ConnectionId, LifecycleState, SessionRegistry, Transition,
};

use crate::config::EngineConfig;
use crate::ocpp::codec::{decode_inbound, decode_reply, encode_reply, encode_request, error_code_for};
use crate::ocpp::messages::*;

/// Time allowed for the closing handshake
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Command travelling from a handle to its engine
struct EngineCommand {
    request: OutboundRequest,
    reply: oneshot::Sender<Result<LifecycleState, CommandError>>,
}

/// Command sent to the charge point, awaiting its answer
struct PendingCommand {
    request: OutboundRequest,
    /// None for requests the engine issues on its own
    reply: Option<oneshot::Sender<Result<LifecycleState, CommandError>>>,
    deadline: Instant,
}

impl PendingCommand {
    fn resolve(self, identity: &str, outcome: Result<LifecycleState, CommandError>) {
        match self.reply {
            Some(reply) => {
                let _ = reply.send(outcome);
            }
            None => match outcome {
                Ok(_) => debug!("{}: {:?} accepted", identity, self.request.kind()),
                Err(e) => warn!("{}: {:?} failed: {}", identity, self.request.kind(), e),
            },
        }
    }
}

/// Handle to a running engine, stored in the session registry
#[derive(Clone)]
pub struct EngineHandle {
    connection_id: ConnectionId,
    commands: mpsc::Sender<EngineCommand>,
    close: Arc<watch::Sender<Option<CloseReason>>>,
}

impl fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHandle")
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

impl ConnectionHandle for EngineHandle {
    fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    fn close(&self, reason: CloseReason) {
        // First reason wins
        self.close.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        });
    }

    fn deliver(
        &self,
        request: OutboundRequest,
    ) -> impl std::future::Future<Output = Result<LifecycleState, CommandError>> + Send {
        let commands = self.commands.clone();
        async move {
            let (reply, reply_rx) = oneshot::channel();
            commands
                .send(EngineCommand { request, reply })
                .await
                .map_err(|_| CommandError::ConnectionClosed)?;
            reply_rx.await.map_err(|_| CommandError::ConnectionClosed)?
        }
    }
}

/// Why an engine stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    /// The charge point closed the connection
    PeerClosed,
    /// Closed from the central side
    Closed(CloseReason),
    /// Nothing received within the idle timeout
    IdleTimeout,
    /// Transport failure
    Transport(String),
}

impl fmt::Display for EngineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineExit::PeerClosed => write!(f, "closed by charge point"),
            EngineExit::Closed(reason) => write!(f, "closed: {}", reason),
            EngineExit::IdleTimeout => write!(f, "idle timeout"),
            EngineExit::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;

/// Message loop for one charge point connection
pub struct ProtocolEngine {
    identity: ChargePointId,
    handle: EngineHandle,
    registry: Arc<SessionRegistry<EngineHandle>>,
    config: EngineConfig,
    commands: mpsc::Receiver<EngineCommand>,
    close_rx: watch::Receiver<Option<CloseReason>>,
    shutdown_rx: Option<watch::Receiver<bool>>,
    pending: HashMap<String, PendingCommand>,
    next_message_id: u64,
}

impl ProtocolEngine {
    pub fn new(
        identity: ChargePointId,
        connection_id: ConnectionId,
        registry: Arc<SessionRegistry<EngineHandle>>,
        config: EngineConfig,
    ) -> Self {
        let (commands_tx, commands) = mpsc::channel(config.command_queue.max(1));
        let (close_tx, close_rx) = watch::channel(None);

        Self {
            identity,
            handle: EngineHandle {
                connection_id,
                commands: commands_tx,
                close: Arc::new(close_tx),
            },
            registry,
            config,
            commands,
            close_rx,
            shutdown_rx: None,
            pending: HashMap::new(),
            next_message_id: 1,
        }
    }

    /// Close with `Shutdown` once `shutdown` turns true, including when it
    /// already is by the time the engine binds
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown);
        self
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Bind to the registry and serve `ws` until the connection ends
    pub async fn run<S>(mut self, ws: WebSocketStream<S>) -> EngineExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let connection_id = self.handle.connection_id;
        self.registry
            .bind_connection(&self.identity, self.handle.clone());
        info!("Charge point {} connected (connection {})", self.identity, connection_id);

        let (mut sink, mut stream) = ws.split();
        let mut idle_deadline = Instant::now() + self.config.idle_timeout;

        let exit = loop {
            if let Some(reason) = *self.close_rx.borrow_and_update() {
                break EngineExit::Closed(reason);
            }
            let next_expiry = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                _ = self.close_rx.changed() => continue,

                _ = shutdown_requested(&mut self.shutdown_rx) => {
                    break EngineExit::Closed(CloseReason::Shutdown);
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        idle_deadline = Instant::now() + self.config.idle_timeout;
                        if let Err(e) = self.on_text(&text, &mut sink).await {
                            break EngineExit::Transport(e.to_string());
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        idle_deadline = Instant::now() + self.config.idle_timeout;
                        warn!("{}: binary frame ignored", self.identity);
                        let reply = CallError::new(
                            UNKNOWN_MESSAGE_ID,
                            ErrorCode::FormationViolation,
                            "binary frames are not supported",
                        );
                        if let Err(e) = send(&mut sink, &OcppMessage::CallError(reply)).await {
                            break EngineExit::Transport(e.to_string());
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        idle_deadline = Instant::now() + self.config.idle_timeout;
                    }
                    Some(Ok(Message::Close(_))) | None => break EngineExit::PeerClosed,
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break EngineExit::Transport(e.to_string()),
                },

                Some(command) = self.commands.recv() => {
                    if let Err(e) = self.send_command(command, &mut sink).await {
                        break EngineExit::Transport(e.to_string());
                    }
                }

                _ = sleep_until(next_expiry.unwrap_or(idle_deadline)), if next_expiry.is_some() => {
                    self.expire_pending();
                }

                _ = sleep_until(idle_deadline) => break EngineExit::IdleTimeout,
            }
        };

        let close_reason = match exit {
            EngineExit::Closed(reason) => Some(reason),
            EngineExit::IdleTimeout => Some(CloseReason::Timeout),
            _ => None,
        };
        if let Some(reason) = close_reason {
            let frame = CloseFrame {
                code: match reason {
                    CloseReason::Superseded => CloseCode::Policy,
                    CloseReason::Shutdown => CloseCode::Away,
                    CloseReason::Timeout => CloseCode::Normal,
                },
                reason: reason.to_string().into(),
            };
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.send(Message::Close(Some(frame)))).await;
        }
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await;

        let cause = if exit == EngineExit::IdleTimeout {
            Transition::Timeout
        } else {
            Transition::Disconnect
        };
        self.registry
            .unbind_connection(&self.identity, connection_id, cause);
        self.fail_pending();

        info!("Charge point {} disconnected: {}", self.identity, exit);
        exit
    }

    async fn on_text<S>(&mut self, text: &str, sink: &mut WsSink<S>) -> Result<(), WsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("{} <- {}", self.identity, text);

        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => {
                let (reply, follow_up) = self.handle_call(call);
                send(sink, &reply).await?;
                match follow_up {
                    Some(request) => self.send_request(request, None, sink).await,
                    None => Ok(()),
                }
            }
            Ok(OcppMessage::CallResult(result)) => {
                self.on_result(result);
                Ok(())
            }
            Ok(OcppMessage::CallError(error)) => {
                self.on_call_error(error);
                Ok(())
            }
            Err(e) => match peek_frame(text) {
                (Some(3), _) | (Some(4), _) => {
                    warn!("{}: dropping malformed reply: {}", self.identity, e);
                    Ok(())
                }
                (_, message_id) => {
                    warn!("{}: malformed frame: {}", self.identity, e);
                    let reply = CallError::new(
                        message_id.unwrap_or_else(|| UNKNOWN_MESSAGE_ID.to_string()),
                        e.error_code(),
                        e.to_string(),
                    );
                    send(sink, &OcppMessage::CallError(reply)).await
                }
            },
        }
    }

    /// Answer one CALL; the second value is a request to send after the answer
    fn handle_call(&self, call: Call) -> (OcppMessage, Option<OutboundRequest>) {
        let inbound = match decode_inbound(&call) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("{}: cannot decode {}: {}", self.identity, call.action, e);
                let error = CallError::new(call.message_id, e.error_code(), e.to_string());
                return (OcppMessage::CallError(error), None);
            }
        };
        log_inbound(&self.identity, inbound.kind().direction(), &call.action, &call.message_id);

        match handle_inbound(&self.registry, &self.identity, inbound, Utc::now()) {
            Ok(reply) => {
                let follow_up = match &reply {
                    InboundReply::Boot {
                        status: RegistrationStatus::Accepted,
                        ..
                    } => self.default_profile(),
                    _ => None,
                };
                match encode_reply(&call.message_id, &reply) {
                    Ok(result) => (OcppMessage::CallResult(result), follow_up),
                    Err(e) => {
                        let error = CallError::new(call.message_id, ErrorCode::InternalError, e.to_string());
                        (OcppMessage::CallError(error), None)
                    }
                }
            }
            Err(e) => {
                warn!("{}: {} refused: {}", self.identity, call.action, e);
                let error = CallError::new(call.message_id, error_code_for(&e), e.to_string());
                (OcppMessage::CallError(error), None)
            }
        }
    }

    /// Current limit matching the model's setpoint
    fn default_profile(&self) -> Option<OutboundRequest> {
        if !self.config.push_default_profile {
            return None;
        }
        let model = self.registry.get(&self.identity).ok()?;
        if model.state() == LifecycleState::Faulted {
            return None;
        }
        Some(OutboundRequest::SetCurrent {
            amps: model.setpoint_amps(),
        })
    }

    fn on_result(&mut self, result: CallResult) {
        log_inbound(&self.identity, Direction::Response, &"CALLRESULT", &result.message_id);
        let Some(pending) = self.pending.remove(&result.message_id) else {
            warn!(
                "{}: reply for unknown message id {}",
                self.identity, result.message_id
            );
            return;
        };

        let outcome = match decode_reply(&pending.request, &result) {
            Ok(reply) => resolve_command(&self.registry, &self.identity, &pending.request, reply, Utc::now()),
            Err(e) => {
                warn!("{}: malformed reply to {}: {}", self.identity, result.message_id, e);
                Err(CommandError::Rejected(format!("malformed reply: {}", e)))
            }
        };
        pending.resolve(&self.identity, outcome);
    }

    fn on_call_error(&mut self, error: CallError) {
        log_inbound(&self.identity, Direction::Response, &error.error_code, &error.message_id);
        let Some(pending) = self.pending.remove(&error.message_id) else {
            warn!(
                "{}: error for unknown message id {}: {}",
                self.identity, error.message_id, error.error_code
            );
            return;
        };
        let outcome = Err(CommandError::Rejected(format!(
            "{}: {}",
            error.error_code, error.error_description
        )));
        pending.resolve(&self.identity, outcome);
    }

    async fn send_command<S>(&mut self, command: EngineCommand, sink: &mut WsSink<S>) -> Result<(), WsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if command.reply.is_closed() {
            return Ok(());
        }
        self.send_request(command.request, Some(command.reply), sink).await
    }

    async fn send_request<S>(
        &mut self,
        request: OutboundRequest,
        reply: Option<oneshot::Sender<Result<LifecycleState, CommandError>>>,
        sink: &mut WsSink<S>,
    ) -> Result<(), WsError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let message_id = format!("csms-{}", self.next_message_id);
        self.next_message_id += 1;

        let pending = PendingCommand {
            request,
            reply,
            deadline: Instant::now() + self.config.command_timeout,
        };
        let call = match encode_request(&message_id, &pending.request) {
            Ok(call) => call,
            Err(e) => {
                pending.resolve(&self.identity, Err(CommandError::Rejected(e.to_string())));
                return Ok(());
            }
        };
        send(sink, &OcppMessage::Call(call)).await?;

        self.pending.insert(message_id, pending);
        Ok(())
    }

    fn expire_pending(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for message_id in expired {
            if let Some(pending) = self.pending.remove(&message_id) {
                warn!("{}: command {} timed out", self.identity, message_id);
                pending.resolve(&self.identity, Err(CommandError::Timeout));
            }
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.resolve(&self.identity, Err(CommandError::ConnectionClosed));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            let _ = command.reply.send(Err(CommandError::ConnectionClosed));
        }
    }
}

/// Frame log; notifications arrive every meter interval and go to trace
fn log_inbound(identity: &str, direction: Direction, what: &dyn fmt::Display, message_id: &str) {
    match direction {
        Direction::Notification => trace!("{} <- {} [{}]", identity, what, message_id),
        Direction::Request | Direction::Response => {
            debug!("{} <- {:?} {} [{}]", identity, direction, what, message_id)
        }
    }
}

/// Resolves once shutdown is flagged; never without a shutdown channel
async fn shutdown_requested(shutdown: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = shutdown {
        if rx.wait_for(|stop| *stop).await.is_ok() {
            return;
        }
    }
    std::future::pending::<()>().await
}

async fn send<S>(sink: &mut WsSink<S>, message: &OcppMessage) -> Result<(), WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let text = match message.to_text() {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize message {}: {}", message.message_id(), e);
            return Ok(());
        }
    };
    debug!("-> {}", text);
    sink.send(Message::Text(text.into())).await
}
