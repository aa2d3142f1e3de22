//! [`GradualStopController`] – open-loop ramp-down to rest.
//!
//! State machine: `Idle → Stopping → Idle`, held in [`StopState`].  A trigger
//! while already stopping is logged and discarded.  While stopping, operator
//! commands are refused by the [`CommandQueue`] and a decay task scales the
//! queue's commanded target by the decay factor every tick, until both
//! magnitudes are at or below epsilon.  It then pushes an explicit `(0, 0)`
//! and returns to idle.
//!
//! Each step is computed from the target at that tick, not from a snapshot
//! taken at trigger time.  A fail-safe zero or a reboot that resets the
//! target therefore shortens the ramp instead of being overtaken by it.
//! The first step lands one tick after the trigger.
//!
//! The ramp is synthesised; nothing is read back from the hardware.
//!
//! [`CommandQueue`]: crate::command_queue::CommandQueue

use std::fmt;
use std::sync::Arc;

use shoppy_types::{ShoppyError, VelocityCommand};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::command_queue::decay_step;
use crate::session::SessionContext;

/// Why a gradual stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    HeartbeatTimeout,
    Disconnect,
    IngressError,
    DriverFault,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::HeartbeatTimeout => "heartbeat_timeout",
            StopReason::Disconnect => "disconnect",
            StopReason::IngressError => "ingress_error",
            StopReason::DriverFault => "driver_fault",
            StopReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// StopState
// ────────────────────────────────────────────────────────────────────────────

/// Process-wide "a gradual stop is running" flag.
///
/// Backed by a [`watch`] channel so that observers (the operator connection)
/// are told when a stop begins.  `None` means idle.
#[derive(Debug)]
pub struct StopState {
    tx: watch::Sender<Option<StopReason>>,
}

impl Default for StopState {
    fn default() -> Self {
        Self::new()
    }
}

impl StopState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Transition `Idle → Stopping`.  Returns `false` if already stopping.
    pub fn try_begin(&self, reason: StopReason) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_some() {
                false
            } else {
                *state = Some(reason);
                true
            }
        })
    }

    /// Transition `Stopping → Idle`.
    pub fn finish(&self) {
        self.tx.send_if_modified(|state| state.take().is_some());
    }

    pub fn is_active(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Reason of the running stop, if any.
    pub fn current(&self) -> Option<StopReason> {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<StopReason>> {
        self.tx.subscribe()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// DecayRamp
// ────────────────────────────────────────────────────────────────────────────

/// The sequence of commands a gradual stop emits.
///
/// Yields `start * factor^n` for `n = 1, 2, …` while either magnitude of the
/// previous value is above `epsilon`, then a single [`VelocityCommand::STOP`].
///
/// ```
/// use shoppy_kernel::DecayRamp;
/// use shoppy_types::VelocityCommand;
///
/// let steps: Vec<_> = DecayRamp::new((0.02, 0.0), 0.5, 0.01).collect();
/// assert_eq!(steps, vec![VelocityCommand::pair(0.01, 0.0), VelocityCommand::STOP]);
/// ```
#[derive(Debug, Clone)]
pub struct DecayRamp {
    current: (f32, f32),
    factor: f32,
    epsilon: f32,
    done: bool,
}

impl DecayRamp {
    pub fn new(start: (f32, f32), factor: f32, epsilon: f32) -> Self {
        Self {
            current: start,
            factor,
            epsilon,
            done: false,
        }
    }
}

impl Iterator for DecayRamp {
    type Item = VelocityCommand;

    fn next(&mut self) -> Option<VelocityCommand> {
        if self.done {
            return None;
        }
        match decay_step(self.current, self.factor, self.epsilon) {
            Some(next) => {
                self.current = next;
                Some(VelocityCommand::pair(next.0, next.1))
            }
            None => {
                self.done = true;
                Some(VelocityCommand::STOP)
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// GradualStopController
// ────────────────────────────────────────────────────────────────────────────

/// Triggers and runs gradual stops against a [`SessionContext`].
#[derive(Clone)]
pub struct GradualStopController {
    ctx: Arc<SessionContext>,
}

impl GradualStopController {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Request a gradual stop.
    ///
    /// Returns `true` if this call started a new stop and `false` if one was
    /// already running (the request is discarded).  Must be called from
    /// within a Tokio runtime; the decay loop runs on its own task.
    pub fn trigger(&self, reason: StopReason) -> bool {
        let Some(start) = self.ctx.queue().lock_out_operators(reason) else {
            debug!(%reason, "gradual stop already in progress; trigger discarded");
            return false;
        };
        warn!(%reason, left = start.0, right = start.1, "gradual stop triggered");

        tokio::spawn(run_decay(Arc::clone(&self.ctx)));
        true
    }

    pub fn is_stopping(&self) -> bool {
        self.ctx.stop_state().is_active()
    }
}

async fn run_decay(ctx: Arc<SessionContext>) {
    let cfg = ctx.config();
    let mut ticker = tokio::time::interval_at(Instant::now() + cfg.decay_tick, cfg.decay_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut steps = 0usize;
    loop {
        ticker.tick().await;
        match ctx.queue().push_decay_step(cfg.decay_factor, cfg.stop_epsilon) {
            Ok(cmd) => {
                steps += 1;
                if cmd == VelocityCommand::STOP {
                    break;
                }
            }
            Err(ShoppyError::QueueClosed) => {
                error!(steps, "command queue closed; abandoning gradual stop");
                break;
            }
            // The target only moves when a step lands, so the next tick
            // retries from the same value; the final zero is retried too.
            Err(e) => warn!(error = %e, "decay step refused; retrying next tick"),
        }
    }

    ctx.stop_state().finish();
    info!(steps, "gradual stop complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SafetyConfig;
    use crate::command_queue::{CommandConsumer, CommandSource};
    use proptest::prelude::*;
    use std::time::Duration;

    fn context() -> (Arc<SessionContext>, CommandConsumer) {
        SessionContext::new(SafetyConfig::default()).unwrap()
    }

    fn drain(consumer: &mut CommandConsumer) -> Vec<VelocityCommand> {
        std::iter::from_fn(|| consumer.try_dequeue()).collect()
    }

    #[test]
    fn stop_state_begins_once() {
        let state = StopState::new();
        assert!(state.try_begin(StopReason::Disconnect));
        assert!(!state.try_begin(StopReason::HeartbeatTimeout));
        assert_eq!(state.current(), Some(StopReason::Disconnect));
        state.finish();
        assert!(!state.is_active());
        assert!(state.try_begin(StopReason::HeartbeatTimeout));
    }

    #[test]
    fn ramp_from_rest_is_a_single_stop() {
        let steps: Vec<_> = DecayRamp::new((0.0, 0.0), 0.9, 0.01).collect();
        assert_eq!(steps, vec![VelocityCommand::STOP]);
    }

    #[test]
    fn ramp_preserves_sign() {
        let steps: Vec<_> = DecayRamp::new((-0.5, 0.5), 0.9, 0.01).collect();
        for cmd in &steps[..steps.len() - 1] {
            assert!(cmd.left.unwrap() < 0.0);
            assert!(cmd.right.unwrap() > 0.0);
        }
    }

    proptest! {
        #[test]
        fn ramp_is_monotone_and_terminates(
            left in -1.0f32..=1.0,
            right in -1.0f32..=1.0,
            factor in 0.1f32..=0.9,
        ) {
            let eps = 0.01f32;
            let steps: Vec<_> = DecayRamp::new((left, right), factor, eps).collect();

            // Bounded: ceil(log_factor(eps / 1.0)) decay steps plus the final stop.
            let bound = ((eps.ln() / factor.ln()).ceil() as usize) + 2;
            prop_assert!(steps.len() <= bound, "{} steps > bound {}", steps.len(), bound);
            prop_assert_eq!(*steps.last().unwrap(), VelocityCommand::STOP);

            let mut prev = (left.abs(), right.abs());
            for cmd in &steps {
                let (l, r) = (cmd.left.unwrap().abs(), cmd.right.unwrap().abs());
                prop_assert!(l <= prev.0 && r <= prev.1);
                prev = (l, r);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn decay_runs_to_zero_and_releases_lockout() {
        let (ctx, mut consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(0.5, -0.5), CommandSource::Operator)
            .unwrap();
        let stop = GradualStopController::new(Arc::clone(&ctx));

        assert!(stop.trigger(StopReason::HeartbeatTimeout));
        assert!(stop.is_stopping());

        // 0.5 * 0.9^n <= 0.01 after 38 steps; give the ramp ample time.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!stop.is_stopping());

        let cmds = drain(&mut consumer);
        assert_eq!(cmds[0], VelocityCommand::pair(0.5, -0.5));
        assert_eq!(*cmds.last().unwrap(), VelocityCommand::STOP);
        assert!((cmds[1].left.unwrap() - 0.45).abs() < 1e-6);
        assert!((cmds[1].right.unwrap() + 0.45).abs() < 1e-6);
        assert!(ctx.queue().try_enqueue(VelocityCommand::pair(0.2, 0.2), CommandSource::Operator).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_is_discarded() {
        let (ctx, mut consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(0.3, 0.3), CommandSource::Operator)
            .unwrap();
        let stop = GradualStopController::new(Arc::clone(&ctx));

        assert!(stop.trigger(StopReason::HeartbeatTimeout));
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!stop.trigger(StopReason::Disconnect));
        assert!(!stop.trigger(StopReason::DriverFault));

        tokio::time::sleep(Duration::from_secs(6)).await;
        let cmds = drain(&mut consumer);
        let stops = cmds.iter().filter(|c| **c == VelocityCommand::STOP).count();
        assert_eq!(stops, 1, "exactly one ramp must have run");
        let expected = DecayRamp::new((0.3, 0.3), 0.9, 0.01).count() + 1;
        assert_eq!(cmds.len(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn operator_commands_refused_mid_ramp() {
        let (ctx, _consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(1.0, 1.0), CommandSource::Operator)
            .unwrap();
        let stop = GradualStopController::new(Arc::clone(&ctx));
        stop.trigger(StopReason::Disconnect);

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(
            ctx.queue().try_enqueue(VelocityCommand::pair(1.0, 1.0), CommandSource::Operator),
            Err(shoppy_types::ShoppyError::StopInProgress)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ramp_waits_for_room_in_a_full_queue() {
        let cfg = SafetyConfig {
            queue_capacity: 2,
            ..SafetyConfig::default()
        };
        let (ctx, mut consumer) = SessionContext::new(cfg).unwrap();
        ctx.queue().try_enqueue(VelocityCommand::pair(0.2, 0.2), CommandSource::Operator).unwrap();
        ctx.queue().try_enqueue(VelocityCommand::pair(0.2, 0.2), CommandSource::Operator).unwrap();

        let stop = GradualStopController::new(Arc::clone(&ctx));
        stop.trigger(StopReason::DriverFault);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(stop.is_stopping(), "ramp cannot finish until the final stop is queued");
        assert_eq!(ctx.queue().target(), (0.2, 0.2), "refused steps leave the target alone");

        let mut seen = drain(&mut consumer);
        while stop.is_stopping() {
            tokio::time::sleep(Duration::from_millis(100)).await;
            seen.extend(drain(&mut consumer));
        }
        seen.extend(drain(&mut consumer));

        let ramp = &seen[2..];
        assert!((ramp[0].left.unwrap() - 0.18).abs() < 1e-6, "resumes from the held target");
        assert_eq!(*ramp.last().unwrap(), VelocityCommand::STOP);
        assert!(ramp.windows(2).all(|w| w[1].left.unwrap() <= w[0].left.unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn fail_safe_zero_cuts_the_ramp_short() {
        let (ctx, mut consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(0.8, 0.8), CommandSource::Operator)
            .unwrap();
        let stop = GradualStopController::new(Arc::clone(&ctx));
        stop.trigger(StopReason::IngressError);
        ctx.fail_safe();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!stop.is_stopping());
        assert_eq!(
            drain(&mut consumer),
            vec![VelocityCommand::pair(0.8, 0.8), VelocityCommand::STOP, VelocityCommand::STOP]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reset_target_mid_ramp_ends_it_at_rest() {
        let (ctx, mut consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(0.6, -0.6), CommandSource::Operator)
            .unwrap();
        let stop = GradualStopController::new(Arc::clone(&ctx));
        stop.trigger(StopReason::DriverFault);

        tokio::time::sleep(Duration::from_millis(250)).await;
        drain(&mut consumer);
        consumer.reset_target();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!stop.is_stopping());
        assert_eq!(drain(&mut consumer), vec![VelocityCommand::STOP]);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_abandons_the_ramp() {
        let (ctx, consumer) = context();
        ctx.queue()
            .try_enqueue(VelocityCommand::pair(0.5, 0.5), CommandSource::Operator)
            .unwrap();
        drop(consumer);
        let stop = GradualStopController::new(Arc::clone(&ctx));
        assert!(stop.trigger(StopReason::Shutdown));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!stop.is_stopping(), "no consumer, nothing left to stop");
    }
}
