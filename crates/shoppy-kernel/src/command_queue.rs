//! [`CommandQueue`] – bounded FIFO between ingress and actuation.
//!
//! Built on a bounded [`tokio::sync::mpsc`] channel.  The sending half
//! ([`CommandQueue`]) lives in the shared [`SessionContext`] and is used by
//! every writer; the receiving half ([`CommandConsumer`]) is handed to the
//! driver supervisor, which makes "single consumer" a property of the types.
//!
//! Enqueue never waits.  When the channel is full the command is refused and
//! the caller reports it; nothing is buffered beyond the capacity.
//!
//! The queue also tracks the commanded target `(left, right)`: the state the
//! hardware reaches once every queued command has been applied.  A gradual
//! stop ramps down from it.  When the hardware comes to rest on its own (a
//! reboot or a dropped session) the consumer calls
//! [`CommandConsumer::reset_target`] so the target is rebuilt from rest plus
//! whatever is still pending.
//!
//! [`SessionContext`]: crate::session::SessionContext

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use shoppy_types::{ShoppyError, VelocityCommand};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::debug;

use crate::gradual_stop::{StopReason, StopState};

/// Who produced a command.  Only operator commands are subject to the
/// lockout while a gradual stop is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSource {
    Operator,
    GradualStop,
    FailSafe,
}

/// Target bookkeeping shared by both halves.  Held across every send and
/// receive so that `pending` mirrors the channel order.
#[derive(Debug, Default)]
struct Track {
    target: (f32, f32),
    pending: VecDeque<VelocityCommand>,
}

impl Track {
    fn record(&mut self, cmd: VelocityCommand) {
        self.target = merge(self.target, cmd);
        self.pending.push_back(cmd);
    }
}

fn merge(target: (f32, f32), cmd: VelocityCommand) -> (f32, f32) {
    (cmd.left.unwrap_or(target.0), cmd.right.unwrap_or(target.1))
}

fn lock(track: &Mutex<Track>) -> MutexGuard<'_, Track> {
    track.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writer side of the queue.
pub struct CommandQueue {
    tx: mpsc::Sender<VelocityCommand>,
    capacity: usize,
    stop: Arc<StopState>,
    track: Arc<Mutex<Track>>,
}

/// Reader side of the queue, owned by the driver supervisor.
pub struct CommandConsumer {
    rx: mpsc::Receiver<VelocityCommand>,
    track: Arc<Mutex<Track>>,
}

/// Create a queue of `capacity` commands whose operator writes are locked out
/// while `stop` is active.
///
/// # Panics
///
/// Panics if `capacity` is zero; [`SafetyConfig::validate`] rejects that.
///
/// [`SafetyConfig::validate`]: crate::config::SafetyConfig::validate
pub fn command_queue(capacity: usize, stop: Arc<StopState>) -> (CommandQueue, CommandConsumer) {
    let (tx, rx) = mpsc::channel(capacity);
    let track = Arc::new(Mutex::new(Track::default()));
    (
        CommandQueue {
            tx,
            capacity,
            stop,
            track: Arc::clone(&track),
        },
        CommandConsumer { rx, track },
    )
}

impl CommandQueue {
    /// Append `cmd` without blocking.
    ///
    /// # Errors
    ///
    /// - [`ShoppyError::StopInProgress`] – `source` is the operator and a
    ///   gradual stop is active.
    /// - [`ShoppyError::QueueFull`] – the queue already holds `capacity`
    ///   commands; its contents are unchanged.
    /// - [`ShoppyError::QueueClosed`] – the consumer has been dropped.
    pub fn try_enqueue(&self, cmd: VelocityCommand, source: CommandSource) -> Result<(), ShoppyError> {
        let mut track = lock(&self.track);
        self.send_locked(&mut track, cmd, source)
    }

    /// Queue the next step of a gradual stop: the current target scaled by
    /// `factor`, or [`VelocityCommand::STOP`] once both magnitudes are at or
    /// below `epsilon`.  Reading the target and queueing the step happen
    /// under one lock, so a concurrent fail-safe zero is never overtaken.
    pub(crate) fn push_decay_step(&self, factor: f32, epsilon: f32) -> Result<VelocityCommand, ShoppyError> {
        let mut track = lock(&self.track);
        let cmd = match decay_step(track.target, factor, epsilon) {
            Some((left, right)) => VelocityCommand::pair(left, right),
            None => VelocityCommand::STOP,
        };
        self.send_locked(&mut track, cmd, CommandSource::GradualStop)?;
        Ok(cmd)
    }

    fn send_locked(&self, track: &mut Track, cmd: VelocityCommand, source: CommandSource) -> Result<(), ShoppyError> {
        if source == CommandSource::Operator && self.stop.is_active() {
            return Err(ShoppyError::StopInProgress);
        }

        match self.tx.try_send(cmd) {
            Ok(()) => {
                track.record(cmd);
                debug!(?cmd, ?source, "command queued");
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ShoppyError::QueueFull {
                capacity: self.capacity,
            }),
            Err(TrySendError::Closed(_)) => Err(ShoppyError::QueueClosed),
        }
    }

    /// Atomically begin a gradual stop with respect to operator enqueues.
    ///
    /// Returns the commanded target at the instant operators were locked out,
    /// or `None` if a stop was already active.
    pub(crate) fn lock_out_operators(&self, reason: StopReason) -> Option<(f32, f32)> {
        let track = lock(&self.track);
        if self.stop.try_begin(reason) {
            Some(track.target)
        } else {
            None
        }
    }

    /// Commanded `(left, right)` target once the queue has drained.
    pub fn target(&self) -> (f32, f32) {
        lock(&self.track).target
    }

    /// Number of commands waiting to be consumed.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl CommandConsumer {
    /// Wait up to `timeout` for the next command.
    ///
    /// Returns `None` on expiry so the caller can do periodic housekeeping.
    /// Cancel-safe: a command is never lost if the future is dropped.
    pub async fn dequeue(&mut self, timeout: Duration) -> Option<VelocityCommand> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(cmd)) => {
                lock(&self.track).pending.pop_front();
                Some(cmd)
            }
            Ok(None) => {
                // Every writer is gone; keep the caller's cadence instead of spinning.
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_) => None,
        }
    }

    /// Take a command if one is immediately available.
    pub fn try_dequeue(&mut self) -> Option<VelocityCommand> {
        let cmd = self.rx.try_recv().ok()?;
        lock(&self.track).pending.pop_front();
        Some(cmd)
    }

    /// The hardware is at rest: rebuild the target from `(0, 0)` plus the
    /// commands still waiting in the queue.
    pub fn reset_target(&self) {
        let mut track = lock(&self.track);
        let target = track.pending.iter().fold((0.0, 0.0), |t, cmd| merge(t, *cmd));
        if target != track.target {
            debug!(from = ?track.target, to = ?target, "commanded target reset");
        }
        track.target = target;
    }
}

/// One geometric decay step from `current`, or `None` once both axes are
/// settled.  A NaN axis can never settle and counts as already at rest.
pub(crate) fn decay_step(current: (f32, f32), factor: f32, epsilon: f32) -> Option<(f32, f32)> {
    let settled = |v: f32| v.is_nan() || v.abs() <= epsilon;
    if settled(current.0) && settled(current.1) {
        None
    } else {
        Some((current.0 * factor, current.1 * factor))
    }
}
