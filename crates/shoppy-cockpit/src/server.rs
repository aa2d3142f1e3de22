//! [`CockpitServer`] – HTTP + WebSocket ingress for the operator.
//!
//! Listens on `0.0.0.0:5000` (configurable via [`CockpitServer::with_port`]).
//!
//! * Regular HTTP requests → 200 OK with the embedded operator page.
//! * WebSocket upgrades → one operator session feeding the safety core.
//!
//! Messages in both directions use the envelope `{"event": ..., "data": ...}`.
//!
//! | Inbound event | Effect |
//! |---|---|
//! | `heartbeat` | Liveness re-check, then [`LivenessMonitor::record_heartbeat`] |
//! | `control_command` | Liveness re-check → validate → dead-zone → enqueue; replies `control_response` or `error` |
//!
//! A stale heartbeat closes the connection.  A client disconnect or a
//! transport error starts a gradual stop.  A handler that panics or fails
//! internally gets a fail-safe `(0, 0)` queued on its behalf.
//!
//! [`LivenessMonitor::record_heartbeat`]: shoppy_kernel::LivenessMonitor::record_heartbeat

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use shoppy_kernel::{CommandSource, GradualStopController, SessionContext, Shutdown, StopReason};
use shoppy_types::{ControlMessage, ServerEvent, ShoppyError};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::{WebSocketStream, accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Default TCP port for the operator console.
pub const DEFAULT_PORT: u16 = 5000;

/// The compiled-in operator page (HTML + CSS + JS).
const COCKPIT_HTML: &str = include_str!("cockpit.html");

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

// ---------------------------------------------------------------------------
// CockpitServer
// ---------------------------------------------------------------------------

pub struct CockpitServer {
    ctx: Arc<SessionContext>,
    stop: GradualStopController,
    port: u16,
}

impl CockpitServer {
    /// Create a server feeding `ctx` on the [`DEFAULT_PORT`].
    pub fn new(ctx: Arc<SessionContext>, stop: GradualStopController) -> Self {
        Self {
            ctx,
            stop,
            port: DEFAULT_PORT,
        }
    }

    /// Override the listening port (builder-style).
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Bind `0.0.0.0:<port>` and serve until `shutdown` fires.
    ///
    /// # Errors
    ///
    /// Returns [`ShoppyError::Transport`] if the TCP listener cannot bind.
    pub async fn run(self, shutdown: Shutdown) -> Result<(), ShoppyError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ShoppyError::Transport(format!("bind error on {addr}: {e}")))?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound `listener`.
    ///
    /// # Errors
    ///
    /// Returns [`ShoppyError::Transport`] if the listener has no local address.
    pub async fn serve(self, listener: TcpListener, mut shutdown: Shutdown) -> Result<(), ShoppyError> {
        let local = listener
            .local_addr()
            .map_err(|e| ShoppyError::Transport(format!("listener address: {e}")))?;
        info!(addr = %local, "operator console listening on http://{local}");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let handler = handle_connection(
                            stream,
                            peer,
                            Arc::clone(&self.ctx),
                            self.stop.clone(),
                            shutdown.clone(),
                        );
                        spawn_guarded(peer, Arc::clone(&self.ctx), self.stop.clone(), handler);
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                },
                _ = shutdown.wait() => break,
            }
        }
        info!("operator console stopped");
        Ok(())
    }
}

/// Run one connection on its own task and turn an internal failure or panic
/// into a fail-safe stop.
///
/// The `(0, 0)` is queued before operators are locked out, so the lockout's
/// ramp starts from rest and never re-energises the motors.
fn spawn_guarded<F>(peer: SocketAddr, ctx: Arc<SessionContext>, stop: GradualStopController, handler: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), ShoppyError>> + Send + 'static,
{
    tokio::spawn(async move {
        let failed = match tokio::spawn(handler).await {
            Ok(Ok(())) => false,
            Ok(Err(ShoppyError::Transport(e))) => {
                debug!(%peer, error = %e, "connection ended with transport error");
                false
            }
            Ok(Err(e)) => {
                error!(%peer, error = %e, "connection handler failed");
                true
            }
            Err(join) if join.is_panic() => {
                error!(%peer, "connection handler panicked");
                true
            }
            Err(_) => false,
        };
        if failed {
            ctx.fail_safe();
            stop.trigger(StopReason::IngressError);
        }
    })
}

// ---------------------------------------------------------------------------
// Per-connection handler
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    stop: GradualStopController,
    shutdown: Shutdown,
) -> Result<(), ShoppyError> {
    // `peek` leaves the request in place for tungstenite's handshake.
    let mut buf = [0u8; 1024];
    let n = stream
        .peek(&mut buf)
        .await
        .map_err(|e| ShoppyError::Transport(format!("peek error from {peer}: {e}")))?;

    let header_preview = String::from_utf8_lossy(&buf[..n]);
    let is_ws_upgrade = header_preview.lines().any(|line| {
        let line = line.to_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });

    if is_ws_upgrade {
        handle_ws(stream, peer, ctx, stop, shutdown).await
    } else {
        serve_html(stream).await
    }
}

// ---------------------------------------------------------------------------
// Plain HTTP: serve the embedded operator page
// ---------------------------------------------------------------------------

async fn serve_html(mut stream: TcpStream) -> Result<(), ShoppyError> {
    let body = COCKPIT_HTML;
    let response = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {}",
        body.len(),
        body
    );
    stream
        .write_all(response.as_bytes())
        .await
        .map_err(|e| ShoppyError::Transport(format!("HTTP write error: {e}")))
}

// ---------------------------------------------------------------------------
// WebSocket: operator session
// ---------------------------------------------------------------------------

/// Why an operator session ended.
enum Exit {
    /// Heartbeat went stale; the stop has already been started.
    Stale,
    /// Client closed the socket.
    Closed,
    Transport(String),
    Internal(ShoppyError),
    Shutdown,
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
    stop: GradualStopController,
    mut shutdown: Shutdown,
) -> Result<(), ShoppyError> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| ShoppyError::Transport(format!("WS handshake from {peer}: {e}")))?;
    let session = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    ctx.liveness().open_session();
    info!(%session, %peer, "operator connected");

    let cfg = ctx.config();
    let ping_every = cfg.heartbeat_timeout / 2;
    let mut ping = tokio::time::interval_at(Instant::now() + ping_every, ping_every);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut liveness_check =
        tokio::time::interval_at(Instant::now() + cfg.monitor_poll_interval, cfg.monitor_poll_interval);
    liveness_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut stops = ctx.stop_state().subscribe();

    let exit = match send_event(&mut ws_tx, &ServerEvent::connected()).await {
        Err(e) => classify(e),
        Ok(()) => loop {
            tokio::select! {
                _ = ping.tick() => {
                    if let Err(e) = send_event(&mut ws_tx, &ServerEvent::ping()).await {
                        break classify(e);
                    }
                }
                _ = liveness_check.tick() => {
                    if ctx.liveness().enforce(&stop).is_err() {
                        break Exit::Stale;
                    }
                }
                changed = stops.changed() => {
                    if changed.is_err() {
                        break Exit::Shutdown;
                    }
                    let current = *stops.borrow_and_update();
                    if let Some(reason) = current {
                        let event = ServerEvent::GradualStop { reason: reason.to_string() };
                        if let Err(e) = send_event(&mut ws_tx, &event).await {
                            break classify(e);
                        }
                    }
                }
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        match handle_operator_message(text.as_str(), &ctx, &stop) {
                            Inbound::Reply(event) => {
                                if let Err(e) = send_event(&mut ws_tx, &event).await {
                                    break classify(e);
                                }
                            }
                            Inbound::Silent => {}
                            Inbound::Disconnect => break Exit::Stale,
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Exit::Closed,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Exit::Transport(e.to_string()),
                },
                _ = shutdown.wait() => break Exit::Shutdown,
            }
        },
    };

    ctx.liveness().close_session();
    match exit {
        Exit::Stale => {
            warn!(%session, %peer, "heartbeat timeout; forcing disconnect");
            close(&mut ws_tx, session).await;
            Ok(())
        }
        Exit::Closed => {
            info!(%session, %peer, "operator disconnected");
            stop.trigger(StopReason::Disconnect);
            Ok(())
        }
        Exit::Transport(e) => {
            warn!(%session, %peer, error = %e, "operator transport error");
            stop.trigger(StopReason::IngressError);
            Err(ShoppyError::Transport(e))
        }
        // The spawn guard queues the fail-safe zero and locks operators out.
        Exit::Internal(e) => Err(e),
        Exit::Shutdown => {
            close(&mut ws_tx, session).await;
            info!(%session, %peer, "operator session closed for shutdown");
            Ok(())
        }
    }
}

async fn close(tx: &mut WsSink, session: Uuid) {
    if let Err(e) = tx.send(Message::Close(None)).await {
        debug!(%session, error = %e, "close frame not delivered");
    }
}

fn classify(err: ShoppyError) -> Exit {
    match err {
        ShoppyError::Transport(e) => Exit::Transport(e),
        other => Exit::Internal(other),
    }
}

async fn send_event(tx: &mut WsSink, event: &ServerEvent) -> Result<(), ShoppyError> {
    let json = serde_json::to_string(event).map_err(|e| ShoppyError::Serialization(e.to_string()))?;
    tx.send(Message::Text(json.into()))
        .await
        .map_err(|e| ShoppyError::Transport(e.to_string()))
}

// ---------------------------------------------------------------------------
// Inbound message handling
// ---------------------------------------------------------------------------

/// What the connection should do after an inbound message.
#[derive(Debug, PartialEq)]
pub(crate) enum Inbound {
    Reply(ServerEvent),
    Silent,
    /// The link is stale; drop the connection.
    Disconnect,
}

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Act on one text frame from the operator.
///
/// Never blocks: every path is a synchronous check or a non-blocking enqueue.
pub(crate) fn handle_operator_message(text: &str, ctx: &SessionContext, stop: &GradualStopController) -> Inbound {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(envelope) => envelope,
        Err(e) => return Inbound::Reply(ServerEvent::error(ShoppyError::MalformedCommand(e.to_string()))),
    };

    match envelope.event.as_str() {
        "heartbeat" => {
            if ctx.liveness().enforce(stop).is_err() {
                return Inbound::Disconnect;
            }
            ctx.liveness().record_heartbeat();
            Inbound::Silent
        }
        "control_command" => {
            if ctx.liveness().enforce(stop).is_err() {
                return Inbound::Disconnect;
            }
            Inbound::Reply(control_command(envelope.data, ctx))
        }
        other => Inbound::Reply(ServerEvent::error(ShoppyError::MalformedCommand(format!(
            "unknown event {other:?}"
        )))),
    }
}

fn control_command(data: Value, ctx: &SessionContext) -> ServerEvent {
    let msg: ControlMessage = match serde_json::from_value(data) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(error = %e, "malformed control_command");
            return ServerEvent::error(ShoppyError::MalformedCommand(e.to_string()));
        }
    };
    let cmd = match msg.to_command(ctx.config().dead_zone) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(error = %e, "rejected control_command");
            return ServerEvent::error(e);
        }
    };

    match ctx.queue().try_enqueue(cmd, CommandSource::Operator) {
        Ok(()) => {
            let (left, right) = ctx.queue().target();
            ServerEvent::ControlResponse {
                status: "received".to_string(),
                motor: msg.motor,
                value: cmd.left.or(cmd.right).unwrap_or(0.0),
                power: msg.power,
                left,
                right,
            }
        }
        Err(e) => {
            warn!(error = %e, "operator command refused");
            ServerEvent::error(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
