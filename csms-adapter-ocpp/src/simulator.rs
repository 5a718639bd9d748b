//! Simulated OCPP 1.6 charge point
//!
//! Stands in for hardware by speaking the same wire contract as a real charge
//! point:
//! - BootNotification on connect, then StatusNotification Available
//! - optional local start after a delay (Preparing + StartTransaction)
//! - periodic MeterValues while a transaction runs, capped by the active limit
//! - heartbeats at the interval announced by the central system
//! - RemoteStart/RemoteStop, SetChargingProfile and Reset from the central system
//! - fault injection and disconnect through a [`SimulatorHandle`]
//!
//! Reconnects with exponential backoff unless configured not to.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

use crate::config::{SimulatorConfig, OCPP_SUBPROTOCOL};
use crate::ocpp::codec::CONNECTOR_ID;
use crate::ocpp::messages::*;
use crate::ocpp::types::*;

/// Line voltage used for the energy register
const NOMINAL_VOLTAGE: f64 = 230.0;

/// Shortest tick accepted for timers
const MIN_TICK: Duration = Duration::from_millis(10);

/// Errors ending a simulator run
#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error("Connection failed: {0}")]
    Connect(#[source] WsError),

    #[error("WebSocket error: {0}")]
    Transport(#[from] WsError),

    #[error("OCPP error: {0}")]
    Ocpp(#[from] OcppError),

    #[error("Boot rejected by central system")]
    BootRejected,

    #[error("Connection closed by central system")]
    Closed,
}

enum Control {
    InjectFault(ChargePointErrorCode),
    Disconnect,
}

/// Remote control for a running simulator
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    identity: String,
    control: mpsc::Sender<Control>,
}

impl SimulatorHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Report a fault; a running transaction is stopped. Returns false if the
    /// simulator has exited.
    pub async fn inject_fault(&self, code: ChargePointErrorCode) -> bool {
        self.control.send(Control::InjectFault(code)).await.is_ok()
    }

    /// Close the connection and end the simulator
    pub async fn disconnect(&self) -> bool {
        self.control.send(Control::Disconnect).await.is_ok()
    }
}

/// Synthetic charge point acting as an OCPP client
pub struct ChargePointSimulator {
    config: SimulatorConfig,
    control_rx: mpsc::Receiver<Control>,
}

impl ChargePointSimulator {
    pub fn new(config: SimulatorConfig) -> (Self, SimulatorHandle) {
        let (control, control_rx) = mpsc::channel(8);
        let handle = SimulatorHandle {
            identity: config.identity.clone(),
            control,
        };
        (Self { config, control_rx }, handle)
    }

    /// Run until disconnected through the handle, or until a connection
    /// failure when reconnecting is disabled
    pub async fn run(mut self) -> Result<(), SimulatorError> {
        let mut delay = self.config.reconnect_delay;

        loop {
            info!("{}: connecting to {}", self.config.identity, self.config.url());

            match self.connect_and_run().await {
                Ok(()) => {
                    info!("{}: disconnected", self.config.identity);
                    return Ok(());
                }
                Err(SimulatorError::BootRejected) => return Err(SimulatorError::BootRejected),
                Err(e) => {
                    let Some(wait) = delay else {
                        return Err(e);
                    };
                    warn!("{}: {}; reconnecting in {:?}", self.config.identity, e, wait);
                    tokio::time::sleep(wait).await;
                    delay = Some(std::cmp::min(wait * 2, self.config.max_reconnect_delay));
                }
            }
        }
    }

    async fn connect_and_run(&mut self) -> Result<(), SimulatorError> {
        let url = self.config.url();
        let mut request = url.as_str().into_client_request().map_err(SimulatorError::Connect)?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(SimulatorError::Connect)?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!(
                "{}: central system did not accept {}, got {:?}",
                self.config.identity, OCPP_SUBPROTOCOL, accepted_protocol
            );
        }

        let (mut sink, mut stream) = ws.split();
        let mut charger = Charger::new(self.config.clone());

        let boot = charger.boot()?;
        sink.send(text_frame(&boot)?).await?;

        let mut heartbeat = ticker(self.config.heartbeat_interval);
        let mut meter = ticker(self.config.meter_interval);
        let mut last_meter = Instant::now();
        let mut auto_start: Option<Instant> = None;
        let mut first_boot = true;

        loop {
            let mut outgoing = Vec::new();

            tokio::select! {
                Some(control) = self.control_rx.recv() => match control {
                    Control::Disconnect => {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                    Control::InjectFault(code) => outgoing = charger.inject_fault(code)?,
                },

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reaction = charger.on_text(&text)?;
                        if let Some(interval) = reaction.booted {
                            heartbeat = ticker(interval);
                            if first_boot {
                                first_boot = false;
                                auto_start = self.config.auto_start_after.map(|delay| Instant::now() + delay);
                            }
                        }
                        outgoing = reaction.outgoing;
                    }
                    Some(Ok(Message::Close(_))) | None => return Err(SimulatorError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },

                _ = heartbeat.tick() => outgoing.extend(charger.heartbeat()?),

                _ = meter.tick() => {
                    let now = Instant::now();
                    outgoing.extend(charger.meter(now - last_meter)?);
                    last_meter = now;
                }

                _ = sleep_until(auto_start.unwrap_or_else(Instant::now)), if auto_start.is_some() => {
                    auto_start = None;
                    outgoing = charger.auto_start()?;
                }
            }

            for message in &outgoing {
                sink.send(text_frame(message)?).await?;
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK);
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn text_frame(message: &OcppMessage) -> Result<Message, OcppError> {
    let text = message.to_text()?;
    debug!("-> {}", text);
    Ok(Message::Text(text.into()))
}

/// What the loop should do after an inbound frame
#[derive(Debug, Default)]
struct Reaction {
    outgoing: Vec<OcppMessage>,
    /// Boot accepted with this heartbeat interval
    booted: Option<Duration>,
}

/// Charger state, independent of the socket
struct Charger {
    config: SimulatorConfig,
    limit_amps: f64,
    registered: bool,
    boot_sent: bool,
    starting: bool,
    transaction_id: Option<i32>,
    fault: Option<ChargePointErrorCode>,
    energy_wh: f64,
    /// Our outstanding CALLs by message id
    pending: HashMap<String, Action>,
}

impl Charger {
    fn new(config: SimulatorConfig) -> Self {
        Self {
            limit_amps: config.max_current_amps,
            config,
            registered: false,
            boot_sent: false,
            starting: false,
            transaction_id: None,
            fault: None,
            energy_wh: 0.0,
            pending: HashMap::new(),
        }
    }

    fn track(&mut self, call: Call) -> OcppMessage {
        self.pending.insert(call.message_id.clone(), call.action);
        OcppMessage::Call(call)
    }

    fn boot(&mut self) -> Result<OcppMessage, OcppError> {
        self.boot_sent = true;
        let call = Call::boot_notification(&self.config.vendor, &self.config.model)?;
        Ok(self.track(call))
    }

    fn status(&mut self, error_code: ChargePointErrorCode, status: ChargePointStatus) -> Result<OcppMessage, OcppError> {
        let call = Call::status_notification(CONNECTOR_ID, error_code, status)?;
        Ok(self.track(call))
    }

    /// Current drawn right now, rounded down to the 0.1 A reported on the wire
    fn charging_current(&self) -> f64 {
        if self.transaction_id.is_none() || self.fault.is_some() {
            return 0.0;
        }
        let amps = self.config.max_current_amps.min(self.limit_amps).max(0.0);
        (amps * 10.0).floor() / 10.0
    }

    fn can_start(&self) -> bool {
        self.registered && self.fault.is_none() && self.transaction_id.is_none() && !self.starting
    }

    fn begin_transaction(&mut self, id_tag: &str) -> Result<Vec<OcppMessage>, OcppError> {
        self.starting = true;
        let preparing = self.status(ChargePointErrorCode::NoError, ChargePointStatus::Preparing)?;
        let start = Call::start_transaction(CONNECTOR_ID, id_tag, self.energy_wh as i32)?;
        Ok(vec![preparing, self.track(start)])
    }

    fn end_transaction(&mut self, reason: &str) -> Result<Option<OcppMessage>, OcppError> {
        let Some(transaction_id) = self.transaction_id.take() else {
            return Ok(None);
        };
        info!(
            "{}: stopping transaction {} ({})",
            self.config.identity, transaction_id, reason
        );
        let stop = Call::stop_transaction(transaction_id, self.energy_wh as i32, Some(reason))?;
        Ok(Some(self.track(stop)))
    }

    fn auto_start(&mut self) -> Result<Vec<OcppMessage>, OcppError> {
        if !self.can_start() {
            debug!("{}: skipping auto start", self.config.identity);
            return Ok(Vec::new());
        }
        info!("{}: starting local transaction", self.config.identity);
        let id_tag = self.config.id_tag.clone();
        self.begin_transaction(&id_tag)
    }

    fn heartbeat(&mut self) -> Result<Option<OcppMessage>, OcppError> {
        if self.registered {
            let call = Call::heartbeat()?;
            Ok(Some(self.track(call)))
        } else if !self.boot_sent {
            self.boot().map(Some)
        } else {
            Ok(None)
        }
    }

    fn meter(&mut self, elapsed: Duration) -> Result<Option<OcppMessage>, OcppError> {
        let Some(transaction_id) = self.transaction_id else {
            return Ok(None);
        };
        if self.fault.is_some() {
            return Ok(None);
        }

        let amps = self.charging_current();
        self.energy_wh += amps * NOMINAL_VOLTAGE * elapsed.as_secs_f64() / 3600.0;

        let sample = MeterValue {
            timestamp: Utc::now(),
            sampled_value: vec![SampledValue::current_import(amps)],
        };
        let call = Call::meter_values(CONNECTOR_ID, Some(transaction_id), vec![sample])?;
        Ok(Some(self.track(call)))
    }

    fn inject_fault(&mut self, code: ChargePointErrorCode) -> Result<Vec<OcppMessage>, OcppError> {
        warn!("{}: fault {}", self.config.identity, code);
        self.fault = Some(code);
        let mut outgoing = vec![self.status(code, ChargePointStatus::Faulted)?];
        outgoing.extend(self.end_transaction("EmergencyStop")?);
        Ok(outgoing)
    }

    fn on_text(&mut self, text: &str) -> Result<Reaction, SimulatorError> {
        debug!("{} <- {}", self.config.identity, text);
        let mut reaction = Reaction::default();

        match OcppMessage::parse(text) {
            Ok(OcppMessage::Call(call)) => {
                reaction.outgoing = self.on_request(&call)?;
            }
            Ok(OcppMessage::CallResult(result)) => {
                let Some(action) = self.pending.remove(&result.message_id) else {
                    warn!(
                        "{}: reply for unknown message id {}",
                        self.config.identity, result.message_id
                    );
                    return Ok(reaction);
                };
                self.on_result(action, &result, &mut reaction)?;
            }
            Ok(OcppMessage::CallError(error)) => {
                let action = self.pending.remove(&error.message_id);
                warn!(
                    "{}: {:?} refused: {} {}",
                    self.config.identity, action, error.error_code, error.error_description
                );
                match action {
                    Some(Action::StartTransaction) => self.starting = false,
                    Some(Action::BootNotification) => self.boot_sent = false,
                    _ => {}
                }
            }
            Err(e) => warn!("{}: unreadable frame: {}", self.config.identity, e),
        }

        Ok(reaction)
    }

    fn on_result(&mut self, action: Action, result: &CallResult, reaction: &mut Reaction) -> Result<(), SimulatorError> {
        match action {
            Action::BootNotification => {
                let response: BootNotificationResponse = result.parse_payload()?;
                match response.status {
                    RegistrationStatus::Accepted => {
                        info!("{}: boot accepted", self.config.identity);
                        self.registered = true;
                        reaction.booted = Some(Duration::from_secs(response.interval.max(1) as u64));
                        let status = match self.fault {
                            Some(code) => self.status(code, ChargePointStatus::Faulted)?,
                            None => self.status(ChargePointErrorCode::NoError, ChargePointStatus::Available)?,
                        };
                        reaction.outgoing.push(status);
                    }
                    RegistrationStatus::Pending => {
                        info!("{}: boot pending", self.config.identity);
                        self.registered = false;
                        self.boot_sent = false;
                    }
                    RegistrationStatus::Rejected => return Err(SimulatorError::BootRejected),
                }
            }
            Action::StartTransaction => {
                let response: StartTransactionResponse = result.parse_payload()?;
                self.starting = false;
                if response.id_tag_info.status != AuthorizationStatus::Accepted {
                    warn!("{}: transaction not authorized", self.config.identity);
                    reaction
                        .outgoing
                        .push(self.status(ChargePointErrorCode::NoError, ChargePointStatus::Available)?);
                    return Ok(());
                }
                self.transaction_id = Some(response.transaction_id);
                info!(
                    "{}: transaction {} started",
                    self.config.identity, response.transaction_id
                );
                // Faulted while the start was in flight
                if self.fault.is_some() {
                    reaction.outgoing.extend(self.end_transaction("EmergencyStop")?);
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Answer a CALL from the central system; follow-up CALLs come after the reply
    fn on_request(&mut self, call: &Call) -> Result<Vec<OcppMessage>, OcppError> {
        let handled = match call.action {
            Action::RemoteStartTransaction => self.remote_start(call),
            Action::RemoteStopTransaction => self.remote_stop(call),
            Action::SetChargingProfile => self.set_charging_profile(call),
            Action::Reset => self.reset(call),
            other => Err(OcppError::UnsupportedAction(other)),
        };

        match handled {
            Ok((payload, follow_up)) => {
                let mut outgoing = vec![OcppMessage::CallResult(CallResult::new(&call.message_id, payload)?)];
                outgoing.extend(follow_up);
                Ok(outgoing)
            }
            Err(e) => {
                warn!("{}: cannot handle {}: {}", self.config.identity, call.action, e);
                Ok(vec![OcppMessage::CallError(CallError::new(
                    &call.message_id,
                    e.error_code(),
                    e.to_string(),
                ))])
            }
        }
    }

    fn remote_start(&mut self, call: &Call) -> Result<(Value, Vec<OcppMessage>), OcppError> {
        let request: RemoteStartTransactionRequest = call.parse_payload()?;
        if !self.can_start() {
            return respond(RemoteStartStopResponse { status: RemoteStartStopStatus::Rejected }, Vec::new());
        }
        if let Some(limit) = request.charging_profile.as_ref().and_then(ChargingProfile::amps_limit) {
            self.limit_amps = limit;
        }
        let follow_up = self.begin_transaction(&request.id_tag)?;
        respond(RemoteStartStopResponse { status: RemoteStartStopStatus::Accepted }, follow_up)
    }

    fn remote_stop(&mut self, call: &Call) -> Result<(Value, Vec<OcppMessage>), OcppError> {
        let request: RemoteStopTransactionRequest = call.parse_payload()?;
        if self.transaction_id != Some(request.transaction_id) {
            return respond(RemoteStartStopResponse { status: RemoteStartStopStatus::Rejected }, Vec::new());
        }
        let mut follow_up: Vec<OcppMessage> = self.end_transaction("Remote")?.into_iter().collect();
        follow_up.push(self.status(ChargePointErrorCode::NoError, ChargePointStatus::Available)?);
        respond(RemoteStartStopResponse { status: RemoteStartStopStatus::Accepted }, follow_up)
    }

    fn set_charging_profile(&mut self, call: &Call) -> Result<(Value, Vec<OcppMessage>), OcppError> {
        let request: SetChargingProfileRequest = call.parse_payload()?;
        let status = match request.cs_charging_profiles.amps_limit() {
            Some(limit) if limit.is_finite() && limit >= 0.0 => {
                info!("{}: current limit {} A", self.config.identity, limit);
                self.limit_amps = limit;
                ChargingProfileStatus::Accepted
            }
            _ => ChargingProfileStatus::NotSupported,
        };
        respond(SetChargingProfileResponse { status }, Vec::new())
    }

    fn reset(&mut self, call: &Call) -> Result<(Value, Vec<OcppMessage>), OcppError> {
        let request: ResetRequest = call.parse_payload()?;
        if request.reset_type == ResetType::Hard {
            return respond(ResetResponse { status: ResetStatus::Rejected }, Vec::new());
        }
        let mut follow_up = Vec::new();
        if self.fault.take().is_some() {
            info!("{}: fault cleared by reset", self.config.identity);
            follow_up.push(self.status(ChargePointErrorCode::NoError, ChargePointStatus::Available)?);
        }
        respond(ResetResponse { status: ResetStatus::Accepted }, follow_up)
    }
}

fn respond(payload: impl Serialize, follow_up: Vec<OcppMessage>) -> Result<(Value, Vec<OcppMessage>), OcppError> {
    Ok((serde_json::to_value(payload)?, follow_up))
}
