//! [`LivenessMonitor`] – operator heartbeat tracking.
//!
//! The ingress calls [`LivenessMonitor::record_heartbeat`] for every
//! heartbeat the operator sends.  Silence is detected in two places:
//!
//! | Where | How |
//! |---|---|
//! | [`run_liveness_monitor`] | periodic poll, independent of traffic |
//! | [`LivenessMonitor::enforce`] | eager re-check before each inbound message |
//!
//! Both report a stale period exactly once (the first observer wins), so one
//! silence never yields more than one gradual stop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use shoppy_types::ShoppyError;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::gradual_stop::{GradualStopController, StopReason};
use crate::session::SessionContext;
use crate::shutdown::Shutdown;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of one liveness poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessVerdict {
    /// No operator session is open.
    Idle,
    /// Last heartbeat is within the timeout.
    Alive,
    /// The timeout was exceeded and this is the first poll to notice.
    NewlyStale,
    /// The timeout was exceeded and the stale period was already reported.
    StillStale,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal record
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HeartbeatState {
    /// `None` while no operator is connected.
    last_seen: Option<Instant>,
    stale_reported: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// LivenessMonitor
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct LivenessMonitor {
    timeout: Duration,
    state: Mutex<HeartbeatState>,
}

impl LivenessMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            state: Mutex::new(HeartbeatState::default()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start timing a newly connected operator.
    pub fn open_session(&self) {
        self.stamp();
        info!(timeout_ms = self.timeout.as_millis() as u64, "operator session opened");
    }

    /// Stop timing; with nobody connected there is nothing to time out.
    pub fn close_session(&self) {
        let mut state = self.lock();
        state.last_seen = None;
        state.stale_reported = false;
        debug!("operator session closed");
    }

    /// Stamp the current time and start a fresh stale period.
    pub fn record_heartbeat(&self) {
        self.stamp();
        debug!("heartbeat");
    }

    /// `false` once more than `timeout` has passed since the last heartbeat,
    /// or when no session is open.
    pub fn is_alive(&self, timeout: Duration) -> bool {
        match self.lock().last_seen {
            Some(seen) => seen.elapsed() <= timeout,
            None => false,
        }
    }

    /// Classify the current state, marking a fresh stale period as reported.
    pub fn poll(&self) -> LivenessVerdict {
        let mut state = self.lock();
        let Some(seen) = state.last_seen else {
            return LivenessVerdict::Idle;
        };
        if seen.elapsed() <= self.timeout {
            LivenessVerdict::Alive
        } else if state.stale_reported {
            LivenessVerdict::StillStale
        } else {
            state.stale_reported = true;
            LivenessVerdict::NewlyStale
        }
    }

    /// Eager check used before acting on an inbound message.
    ///
    /// Triggers a gradual stop if this call is the first to see the stale
    /// period.
    ///
    /// # Errors
    ///
    /// [`ShoppyError::HeartbeatTimeout`] when the link is stale or no session
    /// is open; the caller must drop the message and the connection.
    pub fn enforce(&self, stop: &GradualStopController) -> Result<(), ShoppyError> {
        match self.poll() {
            LivenessVerdict::Alive => Ok(()),
            LivenessVerdict::NewlyStale => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "heartbeat timeout seen at ingress");
                stop.trigger(StopReason::HeartbeatTimeout);
                Err(ShoppyError::HeartbeatTimeout)
            }
            LivenessVerdict::StillStale | LivenessVerdict::Idle => Err(ShoppyError::HeartbeatTimeout),
        }
    }

    fn stamp(&self) {
        let mut state = self.lock();
        state.last_seen = Some(Instant::now());
        state.stale_reported = false;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HeartbeatState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Poll the heartbeat every `monitor_poll_interval` until shutdown, starting
/// a gradual stop at the start of each stale period.
pub async fn run_liveness_monitor(ctx: Arc<SessionContext>, stop: GradualStopController, mut shutdown: Shutdown) {
    let mut ticker = tokio::time::interval(ctx.config().monitor_poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        poll_ms = ctx.config().monitor_poll_interval.as_millis() as u64,
        "liveness monitor started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ctx.liveness().poll() == LivenessVerdict::NewlyStale {
                    warn!(
                        timeout_ms = ctx.liveness().timeout().as_millis() as u64,
                        "operator heartbeat lost"
                    );
                    stop.trigger(StopReason::HeartbeatTimeout);
                }
            }
            _ = shutdown.wait() => break,
        }
    }
    info!("liveness monitor stopped");
}
