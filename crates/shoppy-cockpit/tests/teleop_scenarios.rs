//! End-to-end teleop scenarios over a real WebSocket, with the simulated
//! controller behind the driver supervisor.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use shoppy_cockpit::CockpitServer;
use shoppy_hal::{DriverSupervisor, SimMotorController, SupervisorConfig};
use shoppy_kernel::{
    GradualStopController, SafetyConfig, SessionContext, ShutdownTrigger, StopReason, run_liveness_monitor,
    shutdown_pair,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

struct Rover {
    ctx: Arc<SessionContext>,
    board: SimMotorController,
    addr: SocketAddr,
    _trigger: ShutdownTrigger,
}

fn safety(heartbeat_timeout: Duration) -> SafetyConfig {
    SafetyConfig {
        heartbeat_timeout,
        monitor_poll_interval: Duration::from_millis(100),
        decay_tick: Duration::from_millis(10),
        ..SafetyConfig::default()
    }
}

fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        connect_backoff: Duration::from_millis(100),
        fault_cooldown: Duration::from_millis(100),
        hw_watchdog_timeout: Duration::from_millis(500),
        dequeue_timeout: Duration::from_millis(20),
        fault_poll_interval: Duration::from_millis(50),
    }
}

async fn boot(safety: SafetyConfig, board: SimMotorController) -> Rover {
    let (ctx, consumer) = SessionContext::new(safety).unwrap();
    let stop = GradualStopController::new(Arc::clone(&ctx));
    let (trigger, shutdown) = shutdown_pair();

    let supervisor = DriverSupervisor::new(Arc::new(board.clone()), fast_supervisor(), consumer, stop.clone());
    tokio::spawn(supervisor.run(shutdown.clone()));
    tokio::spawn(run_liveness_monitor(Arc::clone(&ctx), stop.clone(), shutdown.clone()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(CockpitServer::new(Arc::clone(&ctx), stop).serve(listener, shutdown));

    Rover {
        ctx,
        board,
        addr,
        _trigger: trigger,
    }
}

async fn connect(addr: SocketAddr) -> Client {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    let status = next_event(&mut ws, "connection_status").await;
    assert_eq!(status["status"], "connected");
    ws
}

async fn emit(ws: &mut Client, event: &str, data: Value) {
    let frame = json!({ "event": event, "data": data }).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

async fn drive(ws: &mut Client, motor: &str, value: f64) {
    emit(ws, "control_command", json!({ "motor": motor, "value": value, "power": 1.0 })).await;
}

/// Read frames until one carries `event`, returning its `data`.
async fn next_event(ws: &mut Client, event: &str) -> Value {
    tokio::time::timeout(WAIT, async {
        loop {
            let msg = ws.next().await.expect("socket closed").unwrap();
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["event"] == event {
                    return frame["data"].clone();
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {event} event within {WAIT:?}"))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !cond() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn left_history(board: &SimMotorController) -> Vec<f32> {
    board
        .snapshot()
        .applied
        .iter()
        .filter(|(axis, _)| *axis == 0)
        .map(|(_, v)| *v)
        .collect()
}

// ── Scenario A: command reaches the driver ──────────────────────────────────

#[tokio::test]
async fn command_is_acknowledged_and_applied() {
    let rover = boot(safety(Duration::from_secs(2)), SimMotorController::new()).await;
    let mut ws = connect(rover.addr).await;

    emit(&mut ws, "heartbeat", json!({})).await;
    drive(&mut ws, "both", 0.5).await;

    let reply = next_event(&mut ws, "control_response").await;
    assert_eq!(reply["status"], "received");
    assert_eq!(reply["power"], 1.0);
    assert_eq!(reply["motor"], "both");

    wait_until("command applied", || {
        let applied = rover.board.snapshot().applied;
        applied.contains(&(0, 0.5)) && applied.contains(&(1, -0.5))
    })
    .await;
}

// ── Scenario B: silent operator is dropped and the rover ramps down ─────────

#[tokio::test]
async fn silent_operator_is_disconnected_and_rover_decays_to_rest() {
    let rover = boot(safety(Duration::from_millis(400)), SimMotorController::new()).await;
    let mut ws = connect(rover.addr).await;

    emit(&mut ws, "heartbeat", json!({})).await;
    drive(&mut ws, "both", 0.5).await;
    next_event(&mut ws, "control_response").await;

    // Stop heartbeating; the server must hang up on its own.
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "server did not force a disconnect");

    wait_until("ramp to finish", || {
        !rover.ctx.stop_state().is_active() && rover.board.snapshot().velocities == [0.0, 0.0]
    })
    .await;

    let left = left_history(&rover.board);
    let start = left.iter().position(|v| *v == 0.5).unwrap();
    let ramp = &left[start..];
    assert!(ramp.len() > 10, "expected a gradual ramp, got {ramp:?}");
    assert!(ramp.windows(2).all(|w| w[1] <= w[0]), "ramp must not increase: {ramp:?}");
    assert_eq!(*ramp.last().unwrap(), 0.0);
}

// ── Scenario C: saturated queue reports an error, contents unchanged ───────

#[tokio::test]
async fn full_queue_reports_error_and_keeps_contents() {
    let board = SimMotorController::new();
    board.fail_next_connects(u32::MAX);
    let rover = boot(
        SafetyConfig {
            queue_capacity: 5,
            ..safety(Duration::from_secs(5))
        },
        board,
    )
    .await;
    let mut ws = connect(rover.addr).await;

    for i in 1..=5 {
        drive(&mut ws, "left", 0.1 * i as f64).await;
        next_event(&mut ws, "control_response").await;
    }
    assert_eq!(rover.ctx.queue().len(), 5);

    drive(&mut ws, "left", 0.9).await;
    let err = next_event(&mut ws, "error").await;
    assert!(err["message"].as_str().unwrap().contains("full"), "{err}");
    assert_eq!(rover.ctx.queue().len(), 5);
    assert!(!rover.ctx.stop_state().is_active(), "backpressure is not a safety event");
}

// ── Scenario D: driver keeps failing, then catches up in order ─────────────

#[tokio::test]
async fn queued_commands_apply_in_order_once_driver_connects() {
    let board = SimMotorController::new();
    board.fail_next_connects(4);
    let rover = boot(safety(Duration::from_secs(5)), board).await;
    let mut ws = connect(rover.addr).await;

    drive(&mut ws, "both", 0.3).await;
    drive(&mut ws, "left", 0.6).await;
    drive(&mut ws, "right", -0.4).await;

    wait_until("driver connect", || rover.board.snapshot().connects == 1).await;
    wait_until("commands applied", || rover.board.snapshot().applied.len() == 4).await;

    let snap = rover.board.snapshot();
    assert_eq!(snap.connect_attempts, 5);
    assert_eq!(snap.applied, vec![(0, 0.3), (1, -0.3), (0, 0.6), (1, 0.4)]);
}

// ── Other behaviour ─────────────────────────────────────────────────────────

#[tokio::test]
async fn client_disconnect_starts_a_gradual_stop() {
    let rover = boot(
        SafetyConfig {
            decay_tick: Duration::from_millis(50),
            ..safety(Duration::from_secs(5))
        },
        SimMotorController::new(),
    )
    .await;
    let mut ws = connect(rover.addr).await;
    drive(&mut ws, "both", 0.8).await;
    next_event(&mut ws, "control_response").await;

    ws.close(None).await.unwrap();
    wait_until("stop to begin", || rover.ctx.stop_state().current() == Some(StopReason::Disconnect)).await;
    wait_until("rover at rest", || {
        !rover.ctx.stop_state().is_active() && rover.board.snapshot().velocities == [0.0, 0.0]
    })
    .await;
}

#[tokio::test]
async fn driver_fault_is_announced_to_operator() {
    let rover = boot(
        SafetyConfig {
            decay_tick: Duration::from_millis(50),
            ..safety(Duration::from_secs(5))
        },
        SimMotorController::new(),
    )
    .await;
    let mut ws = connect(rover.addr).await;
    drive(&mut ws, "both", 0.5).await;
    next_event(&mut ws, "control_response").await;
    wait_until("armed", || rover.board.snapshot().applied.len() == 2).await;

    rover.board.inject_fault(0x4);
    let stop = next_event(&mut ws, "gradual_stop").await;
    assert_eq!(stop["reason"], "driver_fault");

    wait_until("recovery", || {
        let snap = rover.board.snapshot();
        snap.reboots == 1 && snap.connects == 2 && !rover.ctx.stop_state().is_active()
    })
    .await;
    wait_until("drained", || rover.ctx.queue().is_empty()).await;

    // The rebooted board only ever sees zeros from the stop.
    let after = rover.board.snapshot().applied[2..].to_vec();
    assert!(after.iter().all(|(_, v)| *v == 0.0), "{after:?}");
    assert_eq!(rover.board.snapshot().velocities, [0.0, 0.0]);
}

#[tokio::test]
async fn malformed_command_gets_error_and_session_survives() {
    let rover = boot(safety(Duration::from_secs(5)), SimMotorController::new()).await;
    let mut ws = connect(rover.addr).await;

    emit(&mut ws, "control_command", json!({ "motor": "sideways", "value": 0.5, "power": 1.0 })).await;
    next_event(&mut ws, "error").await;

    drive(&mut ws, "right", 0.2).await;
    let reply = next_event(&mut ws, "control_response").await;
    assert_eq!(reply["motor"], "right");
    assert!(!rover.ctx.stop_state().is_active());
}

#[tokio::test]
async fn server_pings_at_half_the_timeout() {
    let rover = boot(safety(Duration::from_millis(400)), SimMotorController::new()).await;
    let mut ws = connect(rover.addr).await;
    emit(&mut ws, "heartbeat", json!({})).await;

    let ping = next_event(&mut ws, "ping").await;
    assert!(ping["timestamp"].is_string());
}

#[tokio::test]
async fn plain_http_gets_the_operator_page() {
    let rover = boot(safety(Duration::from_secs(2)), SimMotorController::new()).await;
    let mut stream = TcpStream::connect(rover.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut body = String::new();
    stream.read_to_string(&mut body).await.unwrap();
    assert!(body.starts_with("HTTP/1.1 200 OK"));
    assert!(body.contains("Shoppy Control Interface"));
}
