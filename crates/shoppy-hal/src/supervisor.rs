//! [`DriverSupervisor`] – owns the motor controller session.
//!
//! One task, one session at a time:
//!
//! ```text
//! Connecting ──ok──► Arming ──ok──► Running ──reset──► Disconnected ─┐
//!     ▲  │                │            │                            │
//!     │  └─fail, backoff  │            └──error──► Faulted ─cooldown┤
//!     │                   └──fault/error─────────► Faulted          │
//!     └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! While running, both axis watchdogs are fed on every iteration, before the
//! bounded dequeue, so an idle queue never starves the board.  Driver errors
//! are values; [`recovery_for`] decides what each one costs.
//!
//! A rebooted board or a dropped session leaves the motors at rest (the board
//! watchdog cuts them when the feed stops), so the queue's commanded target
//! is reset at those points and a later gradual stop never ramps a stationary
//! rover up from a stale target.  The supervisor
//! itself never fails: [`DriverSupervisor::run`] returns only on shutdown.

use std::sync::Arc;
use std::time::Duration;

use shoppy_kernel::{CommandConsumer, GradualStopController, Shutdown, StopReason};
use shoppy_types::{Axis, DriverError, ShoppyError, VelocityCommand};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::motor::{AXES, MotorDriver, MotorSession};

/// Fixed wiring: logical axis → (hardware axis, sign).
const WIRING: [(Axis, u8, f32); 2] = [(Axis::Left, 0, 1.0), (Axis::Right, 1, -1.0)];

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    /// Wait between failed connect attempts.
    pub connect_backoff: Duration,
    /// Pause in `Faulted` before reconnecting.
    pub fault_cooldown: Duration,
    /// Board-side watchdog timeout armed on each axis.
    pub hw_watchdog_timeout: Duration,
    /// Longest wait for a command; bounds the watchdog feed interval.
    pub dequeue_timeout: Duration,
    /// How often the board's fault code is read while running.
    pub fault_poll_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            connect_backoff: Duration::from_secs(5),
            fault_cooldown: Duration::from_secs(3),
            hw_watchdog_timeout: Duration::from_millis(500),
            dequeue_timeout: Duration::from_millis(50),
            fault_poll_interval: Duration::from_millis(250),
        }
    }
}

impl SupervisorConfig {
    /// # Errors
    ///
    /// [`ShoppyError::Config`] if a duration is zero or the feed interval
    /// would not keep the hardware watchdog satisfied.
    pub fn validate(&self) -> Result<(), ShoppyError> {
        let named = [
            ("connect_backoff", self.connect_backoff),
            ("fault_cooldown", self.fault_cooldown),
            ("hw_watchdog_timeout", self.hw_watchdog_timeout),
            ("dequeue_timeout", self.dequeue_timeout),
            ("fault_poll_interval", self.fault_poll_interval),
        ];
        if let Some((name, _)) = named.iter().find(|(_, d)| d.is_zero()) {
            return Err(ShoppyError::Config(format!("{name} must be non-zero")));
        }
        if self.dequeue_timeout >= self.hw_watchdog_timeout {
            return Err(ShoppyError::Config(format!(
                "dequeue_timeout ({:?}) must be shorter than hw_watchdog_timeout ({:?})",
                self.dequeue_timeout, self.hw_watchdog_timeout
            )));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// State and recovery policy
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Connecting,
    Arming,
    Running,
    Faulted,
    Disconnected,
}

/// What a driver error costs the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Drop the session and connect again.
    Reconnect,
    /// Reboot the board (best effort), then connect again.
    Reboot,
    /// Log and carry on with the current session.
    Ignore,
}

/// Dispatch table from failure kind to recovery action.
pub fn recovery_for(err: &DriverError) -> RecoveryAction {
    match err {
        DriverError::Connect(_)
        | DriverError::Io(_)
        | DriverError::Timeout(_)
        | DriverError::Disconnected
        | DriverError::Protocol(_) => RecoveryAction::Reconnect,
        DriverError::Fault { .. } => RecoveryAction::Reboot,
        DriverError::Unsupported(_) => RecoveryAction::Ignore,
    }
}

/// Pass through everything except errors the table says to ignore.
fn absorb<T: Default>(result: Result<T, DriverError>) -> Result<T, DriverError> {
    match result {
        Err(e) if recovery_for(&e) == RecoveryAction::Ignore => {
            debug!(error = %e, "driver error ignored");
            Ok(T::default())
        }
        other => other,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Session
// ────────────────────────────────────────────────────────────────────────────

struct DriverSession {
    link: Box<dyn MotorSession>,
    armed: bool,
    last_fault: u32,
}

enum SessionEnd {
    Shutdown,
    Reset,
}

/// Which phase a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Arming,
    Running,
}

// ────────────────────────────────────────────────────────────────────────────
// DriverSupervisor
// ────────────────────────────────────────────────────────────────────────────

pub struct DriverSupervisor {
    driver: Arc<dyn MotorDriver>,
    config: SupervisorConfig,
    consumer: CommandConsumer,
    stop: GradualStopController,
    state: watch::Sender<SupervisorState>,
}

impl DriverSupervisor {
    pub fn new(
        driver: Arc<dyn MotorDriver>,
        config: SupervisorConfig,
        consumer: CommandConsumer,
        stop: GradualStopController,
    ) -> Self {
        let (state, _) = watch::channel(SupervisorState::Connecting);
        Self {
            driver,
            config,
            consumer,
            stop,
            state,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Drive the session loop until `shutdown` fires.
    pub async fn run(mut self, mut shutdown: Shutdown) {
        let driver = self.driver.name();
        info!(driver = %driver, "driver supervisor started");

        loop {
            self.set_state(SupervisorState::Connecting);
            let Some(link) = self.connect(&mut shutdown).await else {
                break;
            };
            let mut session = DriverSession {
                link,
                armed: false,
                last_fault: 0,
            };

            self.set_state(SupervisorState::Arming);
            if let Err(e) = self.arm(&mut session).await {
                if !self.fail(&mut session, e, Phase::Arming, &mut shutdown).await {
                    break;
                }
                continue;
            }
            info!(driver = %driver, "motor controller armed");

            self.set_state(SupervisorState::Running);
            match self.run_session(&mut session, &mut shutdown).await {
                Ok(SessionEnd::Shutdown) => {
                    Self::command_zero(&mut session).await;
                    break;
                }
                Ok(SessionEnd::Reset) => {
                    self.set_state(SupervisorState::Disconnected);
                    info!(driver = %driver, "controller rebooted on operator reset");
                }
                Err(e) => {
                    if !self.fail(&mut session, e, Phase::Running, &mut shutdown).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Disconnected);
        info!(driver = %driver, "driver supervisor stopped");
    }

    /// Retry `connect` at the configured backoff.  `None` on shutdown.
    async fn connect(&self, shutdown: &mut Shutdown) -> Option<Box<dyn MotorSession>> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = tokio::select! {
                r = self.driver.connect() => r,
                _ = shutdown.wait() => return None,
            };
            match result {
                Ok(link) => {
                    info!(driver = %self.driver.name(), attempt, "motor controller connected");
                    return Some(link);
                }
                Err(e) => error!(
                    driver = %self.driver.name(),
                    attempt,
                    error = %e,
                    retry_in_ms = self.config.connect_backoff.as_millis() as u64,
                    "motor controller connect failed"
                ),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.connect_backoff) => {}
                _ = shutdown.wait() => return None,
            }
        }
    }

    async fn arm(&self, session: &mut DriverSession) -> Result<(), DriverError> {
        let link = session.link.as_mut();
        absorb(link.clear_errors().await)?;
        for axis in AXES {
            link.set_watchdog_timeout(axis, self.config.hw_watchdog_timeout).await?;
            link.set_closed_loop(axis).await?;
        }
        let code = link.read_fault_code().await?;
        session.last_fault = code;
        if code != 0 {
            return Err(DriverError::Fault { code });
        }
        session.armed = true;
        Ok(())
    }

    async fn run_session(
        &mut self,
        session: &mut DriverSession,
        shutdown: &mut Shutdown,
    ) -> Result<SessionEnd, DriverError> {
        let consumer = &mut self.consumer;
        let config = &self.config;
        let mut fault_poll = tokio::time::interval(config.fault_poll_interval);
        fault_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            for axis in AXES {
                absorb(session.link.feed_watchdog(axis).await)?;
            }

            tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(SessionEnd::Shutdown),
                _ = fault_poll.tick() => {
                    let code = absorb(session.link.read_fault_code().await)?;
                    session.last_fault = code;
                    if code != 0 {
                        return Err(DriverError::Fault { code });
                    }
                }
                cmd = consumer.dequeue(config.dequeue_timeout) => match cmd {
                    None => {}
                    Some(cmd) if cmd.is_reset() => {
                        info!("reset requested; rebooting controller");
                        session.link.reboot().await?;
                        consumer.reset_target();
                        return Ok(SessionEnd::Reset);
                    }
                    Some(cmd) => Self::apply(session.link.as_mut(), cmd).await?,
                },
            }
        }
    }

    async fn apply(link: &mut dyn MotorSession, cmd: VelocityCommand) -> Result<(), DriverError> {
        for (axis, hw_axis, sign) in WIRING {
            if let Some(value) = cmd.get(axis) {
                absorb(link.set_velocity(hw_axis, sign * value).await)?;
            }
        }
        debug!(?cmd, "command applied");
        Ok(())
    }

    /// Handle a failed session.  Returns `false` if shutdown fired during
    /// the cooldown.
    async fn fail(
        &self,
        session: &mut DriverSession,
        err: DriverError,
        phase: Phase,
        shutdown: &mut Shutdown,
    ) -> bool {
        self.set_state(SupervisorState::Faulted);
        let action = recovery_for(&err);
        error!(
            driver = %self.driver.name(),
            ?phase,
            ?action,
            error = %err,
            armed = session.armed,
            fault_code = session.last_fault,
            "motor controller failure"
        );

        // The session is gone; whatever the board does next starts from rest.
        self.consumer.reset_target();
        if phase == Phase::Running {
            self.stop.trigger(StopReason::DriverFault);
        }
        if action == RecoveryAction::Reboot {
            if let Err(e) = session.link.reboot().await {
                warn!(error = %e, "reboot after fault failed");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(self.config.fault_cooldown) => true,
            _ = shutdown.wait() => false,
        }
    }

    /// Best-effort zero velocity before letting go of the session.
    async fn command_zero(session: &mut DriverSession) {
        if !session.armed {
            return;
        }
        for (_, hw_axis, _) in WIRING {
            if let Err(e) = session.link.set_velocity(hw_axis, 0.0).await {
                warn!(axis = hw_axis, error = %e, "could not zero axis on shutdown");
            }
        }
    }

    fn set_state(&self, next: SupervisorState) {
        let changed = self.state.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            debug!(state = ?next, "supervisor state");
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
