//! OCPP 1.6-J central system
//!
//! Accepts charge point WebSocket connections on `ws://<bind>/<prefix>/<identity>`.
//! The identity is validated during the handshake; a bad identity fails the
//! upgrade with HTTP 400 before any model is touched. Each accepted connection
//! gets its own [`ProtocolEngine`] task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, error, info, warn};

use csms_core::{
    validate_identity, ChargePointId, CloseReason, Command, CommandDispatcher, CommandError,
    Confirmation, ConnectionId, CoreError, SessionRegistry, SnapshotEntry,
};

use crate::config::{CentralSystemConfig, OCPP_SUBPROTOCOL};
use crate::engine::{EngineExit, EngineHandle, ProtocolEngine};

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Errors starting the central system
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Running central system
pub struct CentralSystem {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry<EngineHandle>>,
    dispatcher: CommandDispatcher<EngineHandle>,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

impl CentralSystem {
    /// Bind the listener and start accepting connections
    pub async fn start(config: CentralSystemConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let registry = Arc::new(SessionRegistry::new(config.core.clone()));
        let dispatcher = CommandDispatcher::new(registry.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let accept_task = tokio::spawn(accept_loop(
            listener,
            registry.clone(),
            Arc::new(config),
            shutdown_rx,
        ));

        info!("Central system listening on ws://{}", local_addr);

        Ok(Self {
            local_addr,
            registry,
            dispatcher,
            shutdown_tx,
            accept_task,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<EngineHandle>> {
        &self.registry
    }

    pub fn dispatcher(&self) -> CommandDispatcher<EngineHandle> {
        self.dispatcher.clone()
    }

    /// Current view of every known charge point, ordered by identity
    pub fn snapshot(&self) -> Vec<SnapshotEntry> {
        self.registry.snapshot()
    }

    /// Deliver an operator command and wait for its outcome
    pub async fn submit(&self, identity: &str, command: Command) -> Result<Confirmation, CommandError> {
        self.dispatcher.submit(identity, command).await
    }

    /// Stop accepting, close every connection and wait for the engines.
    ///
    /// Engines still running after the grace period are aborted.
    pub async fn shutdown(self) {
        info!("Central system shutting down");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.accept_task.await {
            error!("Accept loop failed: {}", e);
        }
        info!("Central system stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    registry: Arc<SessionRegistry<EngineHandle>>,
    config: Arc<CentralSystemConfig>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections: JoinSet<Option<EngineExit>> = JoinSet::new();
    let mut next_connection_id: ConnectionId = 1;

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let connection_id = next_connection_id;
                    next_connection_id += 1;
                    debug!("Accepted TCP connection {} from {}", connection_id, peer);
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        connection_id,
                        registry.clone(),
                        config.clone(),
                        shutdown_rx.clone(),
                    ));
                }
                Err(e) => {
                    error!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = connections.join_next() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Connection task panicked: {}", e);
                    }
                }
            }
        }
    }

    drop(listener);
    let closing = registry.close_all(CloseReason::Shutdown);
    info!("Closing {} connection(s)", closing);

    let drained = tokio::time::timeout(config.shutdown_grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "{} connection(s) still open after {:?}; aborting",
            connections.len(),
            config.shutdown_grace
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    connection_id: ConnectionId,
    registry: Arc<SessionRegistry<EngineHandle>>,
    config: Arc<CentralSystemConfig>,
    shutdown_rx: watch::Receiver<bool>,
) -> Option<EngineExit> {
    let _ = stream.set_nodelay(true);

    let ws_config = WebSocketConfig {
        max_message_size: Some(config.engine.max_message_size),
        max_frame_size: Some(config.engine.max_message_size),
        ..Default::default()
    };

    let mut identity: Option<ChargePointId> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let (id, response) = negotiate(request, response)?;
        identity = Some(id);
        Ok(response)
    };

    let handshake = tokio::time::timeout(
        config.handshake_timeout,
        accept_hdr_async_with_config(stream, callback, Some(ws_config)),
    )
    .await;

    let ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("Handshake with {} failed: {}", peer, e);
            return None;
        }
        Err(_) => {
            warn!("Handshake with {} timed out", peer);
            return None;
        }
    };

    let identity = identity?;
    if *shutdown_rx.borrow() {
        debug!("Dropping {} accepted during shutdown", identity);
        return None;
    }

    // Still watches the flag: shutdown may start between this check and the bind
    let engine = ProtocolEngine::new(identity, connection_id, registry, config.engine.clone())
        .with_shutdown(shutdown_rx);
    Some(engine.run(ws).await)
}

/// Validate the upgrade request and build the handshake response
pub(crate) fn negotiate(request: &Request, mut response: Response) -> Result<(ChargePointId, Response), ErrorResponse> {
    let identity = identity_from_path(request.uri().path()).map_err(|e| {
        warn!("Refusing upgrade for {}: {}", request.uri().path(), e);
        bad_request(e.to_string())
    })?;

    if offers_subprotocol(request) {
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
    } else {
        debug!("{} did not offer {}", identity, OCPP_SUBPROTOCOL);
    }

    Ok((identity, response))
}

/// Identity carried by the last segment of the request path
pub fn identity_from_path(path: &str) -> Result<ChargePointId, CoreError> {
    let segment = path.rsplit('/').next().unwrap_or_default();
    validate_identity(segment)
}

fn offers_subprotocol(request: &Request) -> bool {
    request
        .headers()
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == OCPP_SUBPROTOCOL)
}

fn bad_request(message: String) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response
}
