//! Configuration for the central system and the simulated charge points
//!
//! Plain structs with defaults; the node binary fills them from CLI flags.

use std::net::SocketAddr;
use std::time::Duration;

use csms_core::CoreConfig;

/// OCPP 1.6-J WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp1.6";

/// Per-connection engine settings
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Close a connection that sends nothing for this long
    pub idle_timeout: Duration,

    /// Fail a pending command whose reply does not arrive in time
    pub command_timeout: Duration,

    /// Bound of the per-connection command channel
    pub command_queue: usize,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,

    /// Send the setpoint as a default charging profile after each accepted boot
    pub push_default_profile: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            command_queue: 16,
            max_message_size: 64 * 1024,
            push_default_profile: true,
        }
    }
}

/// Central system (listener) configuration
#[derive(Debug, Clone)]
pub struct CentralSystemConfig {
    /// Listen address; port 0 picks a free port
    pub bind_addr: SocketAddr,

    /// Session core settings
    pub core: CoreConfig,

    /// Per-connection engine settings
    pub engine: EngineConfig,

    /// WebSocket handshake must finish within this time
    pub handshake_timeout: Duration,

    /// Time given to open connections to close on shutdown
    pub shutdown_grace: Duration,
}

impl Default for CentralSystemConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            core: CoreConfig::default(),
            engine: EngineConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl CentralSystemConfig {
    /// Create config listening on `bind_addr`
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set session core settings
    pub fn with_core(mut self, core: CoreConfig) -> Self {
        self.core = core;
        self
    }

    /// Set idle timeout
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.engine.idle_timeout = timeout;
        self
    }

    /// Set command reply timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.engine.command_timeout = timeout;
        self
    }

    /// Enable or disable the default charging profile sent after boot
    pub fn with_default_profile(mut self, enabled: bool) -> Self {
        self.engine.push_default_profile = enabled;
        self
    }

    /// Set shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Simulated charge point configuration
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Central system URL without the identity, e.g. `ws://127.0.0.1:9000/ocpp`
    pub csms_url: String,

    /// Identity appended to the URL path
    pub identity: String,

    /// Vendor for BootNotification
    pub vendor: String,

    /// Model for BootNotification
    pub model: String,

    /// Start charging on its own after this delay; `None` waits for a remote start
    pub auto_start_after: Option<Duration>,

    /// Current drawn once charging, capped by the active limit
    pub max_current_amps: f64,

    /// Interval between meter value reports while a transaction runs
    pub meter_interval: Duration,

    /// Heartbeat interval until the boot reply announces one
    pub heartbeat_interval: Duration,

    /// idTag used for locally started transactions
    pub id_tag: String,

    /// Initial reconnect delay; `None` gives up after the first failure
    pub reconnect_delay: Option<Duration>,

    /// Upper bound of the exponential reconnect backoff
    pub max_reconnect_delay: Duration,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            csms_url: "ws://127.0.0.1:9000/ocpp".to_string(),
            identity: "CP001".to_string(),
            vendor: "Elektrokombinacija".to_string(),
            model: "SIM-1".to_string(),
            auto_start_after: Some(Duration::from_secs(5)),
            max_current_amps: 8.0,
            meter_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
            id_tag: "LOCAL".to_string(),
            reconnect_delay: Some(Duration::from_secs(5)),
            max_reconnect_delay: Duration::from_secs(60),
        }
    }
}

impl SimulatorConfig {
    /// Create config for `identity` connecting to `csms_url`
    pub fn new(csms_url: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            csms_url: csms_url.into(),
            identity: identity.into(),
            ..Default::default()
        }
    }

    /// Set auto-start delay
    pub fn with_auto_start(mut self, after: Option<Duration>) -> Self {
        self.auto_start_after = after;
        self
    }

    /// Set the current drawn while charging
    pub fn with_max_current(mut self, amps: f64) -> Self {
        self.max_current_amps = amps;
        self
    }

    /// Set meter value interval
    pub fn with_meter_interval(mut self, interval: Duration) -> Self {
        self.meter_interval = interval;
        self
    }

    /// Set reconnect behaviour
    pub fn with_reconnect(mut self, delay: Option<Duration>) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Full WebSocket URL including the identity
    pub fn url(&self) -> String {
        format!("{}/{}", self.csms_url.trim_end_matches('/'), self.identity)
    }
}
