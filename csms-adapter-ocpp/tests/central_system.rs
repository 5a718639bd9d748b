//! Loopback tests: a real listener on 127.0.0.1 with raw WebSocket clients
//! and simulated charge points.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use csms_adapter_ocpp::{
    CentralSystem, CentralSystemConfig, ChargePointErrorCode, ChargePointSimulator, SimulatorConfig,
};
use csms_core::{Command, CommandError, LifecycleState};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const BOOT: &str =
    r#"[2,"b1","BootNotification",{"chargePointVendor":"Acme","chargePointModel":"Wallbox"}]"#;

async fn start(config: CentralSystemConfig) -> CentralSystem {
    let config = CentralSystemConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    CentralSystem::start(config).await.unwrap()
}

fn url(csms: &CentralSystem, identity: &str) -> String {
    format!("ws://{}/ocpp/{}", csms.local_addr(), identity)
}

async fn connect(csms: &CentralSystem, identity: &str) -> Client {
    let mut request = url(csms, identity).into_client_request().unwrap();
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("ocpp1.6"));
    let (ws, response) = connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get(header::SEC_WEBSOCKET_PROTOCOL).unwrap(),
        "ocpp1.6"
    );
    ws
}

async fn send(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string().into())).await.unwrap();
}

async fn recv(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("no frame within 5s");
        match frame {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

async fn request(client: &mut Client, text: &str) -> Value {
    send(client, text).await;
    recv(client).await
}

/// Boot, then accept the default charging profile the central system pushes;
/// returns the boot reply
async fn boot(client: &mut Client) -> Value {
    let reply = request(client, BOOT).await;
    let profile = recv(client).await;
    assert_eq!(profile[0], 2);
    assert_eq!(profile[2], "SetChargingProfile");
    send(client, &format!(r#"[3,"{}",{{"status":"Accepted"}}]"#, profile[1].as_str().unwrap())).await;
    reply
}

async fn expect_close(client: &mut Client) -> Option<CloseCode> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("connection not closed within 5s");
        match frame {
            Some(Ok(Message::Close(frame))) => return frame.map(|f| f.code),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_boot_then_charge() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP001").await;

    let reply = boot(&mut client).await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[1], "b1");
    assert_eq!(reply[2]["status"], "Accepted");
    assert_eq!(reply[2]["interval"], 10);
    assert_eq!(csms.registry().lifecycle_state("CP001"), LifecycleState::Available);

    request(
        &mut client,
        r#"[2,"s1","StatusNotification",{"connectorId":1,"errorCode":"NoError","status":"Preparing"}]"#,
    )
    .await;
    assert_eq!(csms.registry().lifecycle_state("CP001"), LifecycleState::Preparing);

    let reply = request(
        &mut client,
        r#"[2,"m1","MeterValues",{"connectorId":1,"meterValue":[{"timestamp":"2026-01-20T12:00:01Z","sampledValue":[{"value":"8.0","measurand":"Current.Import","unit":"A"}]}]}]"#,
    )
    .await;
    assert_eq!(reply, serde_json::json!([3, "m1", {}]));

    let snapshot = csms.snapshot();
    assert_eq!(snapshot.len(), 1);
    let entry = &snapshot[0];
    assert_eq!(entry.identity, "CP001");
    assert_eq!(entry.state, LifecycleState::Charging);
    assert_eq!(entry.current_amps, 8.0);
    assert_eq!(entry.active_power_w, 8.0 * 230.0);
    assert_eq!(entry.status_code, 3);
    assert!(entry.connected);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_meter_values_before_boot() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP002").await;

    let reply = request(
        &mut client,
        r#"[2,"m1","MeterValues",{"connectorId":1,"meterValue":[{"timestamp":"2026-01-20T12:00:01Z","sampledValue":[{"value":"8","measurand":"Current.Import"}]}]}]"#,
    )
    .await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[1], "m1");
    assert_eq!(reply[2], "ProtocolError");
    assert_eq!(csms.registry().lifecycle_state("CP002"), LifecycleState::Unregistered);
    assert!(csms.snapshot().is_empty());

    // Connection stays usable
    let reply = boot(&mut client).await;
    assert_eq!(reply[2]["status"], "Accepted");

    csms.shutdown().await;
}

#[tokio::test]
async fn test_rejected_boot_creates_no_model() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP003").await;

    let reply = request(
        &mut client,
        r#"[2,"b1","BootNotification",{"chargePointVendor":"A vendor name that is far too long","chargePointModel":"Wallbox"}]"#,
    )
    .await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[2]["status"], "Rejected");
    assert!(csms.registry().get("CP003").is_err());

    let reply = request(&mut client, r#"[2,"h1","Heartbeat",{}]"#).await;
    assert_eq!(reply[0], 4);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_keep_connection_open() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP004").await;
    boot(&mut client).await;

    let reply = request(&mut client, "[2,").await;
    assert_eq!(reply[0], 4);
    assert_eq!(reply[2], "FormationViolation");

    let reply = request(&mut client, r#"[2,"x1","BootNotification",{"chargePointVendor":1}]"#).await;
    assert_eq!(reply[1], "x1");
    assert_eq!(reply[2], "FormationViolation");

    let reply = request(&mut client, r#"[2,"x2","FirmwareStatusNotification",{"status":"Idle"}]"#).await;
    assert_eq!(reply[2], "NotImplemented");

    let reply = request(
        &mut client,
        r#"[2,"x3","MeterValues",{"connectorId":1,"meterValue":[{"timestamp":"2026-01-20T12:00:01Z","sampledValue":[{"value":"-3","measurand":"Current.Import"}]}]}]"#,
    )
    .await;
    assert_eq!(reply[2], "PropertyConstraintViolation");

    let reply = request(&mut client, r#"[2,"h1","Heartbeat",{}]"#).await;
    assert_eq!(reply[0], 3);
    assert!(reply[2]["currentTime"].is_string());
    assert_eq!(csms.registry().lifecycle_state("CP004"), LifecycleState::Available);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_invalid_identity_fails_handshake() {
    let csms = start(CentralSystemConfig::default()).await;

    let bad = format!("ws://{}/ocpp/bad%20id", csms.local_addr());
    match connect_async(bad).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 400),
        other => panic!("expected HTTP 400, got {:?}", other.map(|(_, r)| r.status())),
    }
    assert!(csms.snapshot().is_empty());

    csms.shutdown().await;
}

#[tokio::test]
async fn test_newest_connection_wins() {
    let csms = start(CentralSystemConfig::default()).await;

    let mut first = connect(&csms, "CP005").await;
    boot(&mut first).await;

    let mut second = connect(&csms, "CP005").await;
    assert_eq!(expect_close(&mut first).await, Some(CloseCode::Policy));

    // The evicted engine's unbind must not touch the new binding
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(csms.registry().connection("CP005").is_some());
    assert_eq!(csms.registry().lifecycle_state("CP005"), LifecycleState::Available);
    assert_eq!(csms.registry().connected_count(), 1);

    let reply = request(&mut second, r#"[2,"h1","Heartbeat",{}]"#).await;
    assert_eq!(reply[0], 3);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_submit_without_connection() {
    let csms = start(CentralSystemConfig::default()).await;

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        csms.submit("nobody", Command::SetCurrent { amps: 6.0 }),
    )
    .await
    .expect("submit must not block");
    assert!(matches!(result, Err(CommandError::NoActiveSession(_))));

    csms.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_resolves_pending_command() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP006").await;
    boot(&mut client).await;

    let dispatcher = csms.dispatcher();
    let pending = tokio::spawn(async move {
        dispatcher.submit("CP006", Command::SetCurrent { amps: 6.0 }).await
    });

    let call = recv(&mut client).await;
    assert_eq!(call[0], 2);
    assert_eq!(call[2], "SetChargingProfile");
    drop(client);

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending command must resolve")
        .unwrap();
    assert_eq!(result, Err(CommandError::ConnectionClosed));

    eventually("Unavailable after disconnect", || {
        csms.registry().lifecycle_state("CP006") == LifecycleState::Unavailable
    })
    .await;
    assert_eq!(csms.registry().get("CP006").unwrap().setpoint_amps(), 8.0);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_command_timeout() {
    let csms = start(CentralSystemConfig::default().with_command_timeout(Duration::from_millis(200))).await;
    let mut client = connect(&csms, "CP007").await;
    boot(&mut client).await;

    let result = csms.submit("CP007", Command::SetCurrent { amps: 6.0 }).await;
    assert_eq!(result, Err(CommandError::Timeout));

    // The call did go out, after the default profile
    let call = recv(&mut client).await;
    assert_eq!(call[1], "csms-2");

    csms.shutdown().await;
}

#[tokio::test]
async fn test_command_accepted_and_rejected() {
    let csms = start(CentralSystemConfig::default()).await;
    let mut client = connect(&csms, "CP008").await;
    boot(&mut client).await;

    let dispatcher = csms.dispatcher();
    let accepted = tokio::spawn(async move {
        dispatcher.submit("CP008", Command::SetCurrent { amps: 6.0 }).await
    });
    let call = recv(&mut client).await;
    assert_eq!(call[3]["csChargingProfiles"]["chargingSchedule"]["chargingSchedulePeriod"][0]["limit"], 6.0);
    send(&mut client, &format!(r#"[3,"{}",{{"status":"Accepted"}}]"#, call[1].as_str().unwrap())).await;

    let confirmation = accepted.await.unwrap().unwrap();
    assert_eq!(confirmation.state, LifecycleState::Available);
    assert_eq!(csms.registry().get("CP008").unwrap().setpoint_amps(), 6.0);

    let dispatcher = csms.dispatcher();
    let rejected = tokio::spawn(async move {
        dispatcher.submit("CP008", Command::RemoteStart { setpoint_amps: 10.0 }).await
    });
    let call = recv(&mut client).await;
    assert_eq!(call[1], "csms-3");
    assert_eq!(call[2], "RemoteStartTransaction");
    send(&mut client, r#"[3,"csms-3",{"status":"Rejected"}]"#).await;

    assert!(matches!(rejected.await.unwrap(), Err(CommandError::Rejected(_))));
    assert_eq!(csms.registry().lifecycle_state("CP008"), LifecycleState::Available);

    csms.shutdown().await;
}

#[tokio::test]
async fn test_idle_timeout_marks_unavailable() {
    let csms = start(CentralSystemConfig::default().with_idle_timeout(Duration::from_millis(300))).await;
    let mut client = connect(&csms, "CP009").await;
    boot(&mut client).await;

    assert_eq!(expect_close(&mut client).await, Some(CloseCode::Normal));
    eventually("Unavailable after idle timeout", || {
        csms.registry().lifecycle_state("CP009") == LifecycleState::Unavailable
    })
    .await;

    csms.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_connections() {
    let csms = start(CentralSystemConfig::default().with_shutdown_grace(Duration::from_secs(2))).await;
    let mut client = connect(&csms, "CP010").await;
    boot(&mut client).await;

    let registry = csms.registry().clone();
    csms.shutdown().await;

    assert_eq!(expect_close(&mut client).await, Some(CloseCode::Away));
    assert_eq!(registry.lifecycle_state("CP010"), LifecycleState::Unavailable);
}

#[tokio::test]
async fn test_simulator_session() {
    let csms = start(CentralSystemConfig::default()).await;

    let config = SimulatorConfig::new(format!("ws://{}/ocpp", csms.local_addr()), "SIM-1")
        .with_auto_start(Some(Duration::from_millis(100)))
        .with_meter_interval(Duration::from_millis(50))
        .with_max_current(8.0)
        .with_reconnect(None);
    let (simulator, handle) = ChargePointSimulator::new(config);
    let task = tokio::spawn(simulator.run());

    let registry = csms.registry().clone();
    let current = |amps: f64| {
        let registry = registry.clone();
        move || {
            registry
                .get("SIM-1")
                .map(|m| m.state() == LifecycleState::Charging && m.current_amps() == amps)
                .unwrap_or(false)
        }
    };

    eventually("charging at 8 A", current(8.0)).await;

    let confirmation = csms.submit("SIM-1", Command::SetCurrent { amps: 6.0 }).await.unwrap();
    assert_eq!(confirmation.state, LifecycleState::Charging);
    eventually("charging at 6 A", current(6.0)).await;
    assert_eq!(registry.get("SIM-1").unwrap().setpoint_amps(), 6.0);

    assert!(handle.inject_fault(ChargePointErrorCode::GroundFailure).await);
    eventually("faulted", || registry.lifecycle_state("SIM-1") == LifecycleState::Faulted).await;
    assert_eq!(
        registry.get("SIM-1").unwrap().fault_code(),
        Some("GroundFailure")
    );

    let confirmation = csms.submit("SIM-1", Command::ClearFault).await.unwrap();
    assert_eq!(confirmation.state, LifecycleState::Available);

    let confirmation = csms
        .submit("SIM-1", Command::RemoteStart { setpoint_amps: 7.0 })
        .await
        .unwrap();
    assert_eq!(confirmation.state, LifecycleState::Preparing);
    eventually("charging at 7 A", current(7.0)).await;
    eventually("transaction known", || {
        registry
            .get("SIM-1")
            .map(|m| m.transaction_id().is_some())
            .unwrap_or(false)
    })
    .await;

    let confirmation = csms.submit("SIM-1", Command::RemoteStop).await.unwrap();
    assert_eq!(confirmation.state, LifecycleState::Available);

    assert!(handle.disconnect().await);
    task.await.unwrap().unwrap();
    eventually("unavailable", || registry.lifecycle_state("SIM-1") == LifecycleState::Unavailable).await;

    csms.shutdown().await;
}

#[tokio::test]
async fn test_default_profile_caps_local_start() {
    // Charger capable of 16 A, setpoint left at the 8 A default
    let csms = start(CentralSystemConfig::default()).await;

    let config = SimulatorConfig::new(format!("ws://{}/ocpp", csms.local_addr()), "SIM-2")
        .with_auto_start(Some(Duration::from_millis(100)))
        .with_meter_interval(Duration::from_millis(50))
        .with_max_current(16.0)
        .with_reconnect(None);
    let (simulator, handle) = ChargePointSimulator::new(config);
    let task = tokio::spawn(simulator.run());

    let registry = csms.registry().clone();
    eventually("charging within the default setpoint", || {
        registry
            .get("SIM-2")
            .map(|m| m.state() == LifecycleState::Charging && m.current_amps() == 8.0)
            .unwrap_or(false)
    })
    .await;
    let model = registry.get("SIM-2").unwrap();
    assert_eq!(model.setpoint_amps(), 8.0);
    assert!(model.transaction_id().is_some());

    assert!(handle.disconnect().await);
    task.await.unwrap().unwrap();
    csms.shutdown().await;
}

#[tokio::test]
async fn test_profile_not_pushed_when_disabled() {
    let csms = start(CentralSystemConfig::default().with_default_profile(false)).await;
    let mut client = connect(&csms, "CP011").await;

    let reply = request(&mut client, BOOT).await;
    assert_eq!(reply[2]["status"], "Accepted");
    let reply = request(&mut client, r#"[2,"h1","Heartbeat",{}]"#).await;
    assert_eq!(reply[0], 3);
    assert_eq!(reply[1], "h1");

    csms.shutdown().await;
}
