//! [`SessionContext`] – the state shared by every task.
//!
//! Created once at startup.  Holds the heartbeat record, the stop flag and
//! the writer side of the command queue; nothing else is shared between the
//! ingress, the liveness monitor, the decay task and the driver supervisor.

use std::sync::Arc;

use shoppy_types::{ShoppyError, VelocityCommand};
use tracing::error;

use crate::command_queue::{CommandConsumer, CommandQueue, CommandSource, command_queue};
use crate::config::SafetyConfig;
use crate::gradual_stop::StopState;
use crate::liveness::LivenessMonitor;

pub struct SessionContext {
    config: SafetyConfig,
    liveness: LivenessMonitor,
    stop: Arc<StopState>,
    queue: CommandQueue,
}

impl SessionContext {
    /// Build the context and return it with the queue's single consumer.
    ///
    /// # Errors
    ///
    /// [`ShoppyError::Config`] if `config` fails validation.
    pub fn new(config: SafetyConfig) -> Result<(Arc<Self>, CommandConsumer), ShoppyError> {
        config.validate()?;
        let stop = Arc::new(StopState::new());
        let (queue, consumer) = command_queue(config.queue_capacity, Arc::clone(&stop));
        let ctx = Self {
            liveness: LivenessMonitor::new(config.heartbeat_timeout),
            config,
            stop,
            queue,
        };
        Ok((Arc::new(ctx), consumer))
    }

    pub fn config(&self) -> &SafetyConfig {
        &self.config
    }

    pub fn liveness(&self) -> &LivenessMonitor {
        &self.liveness
    }

    pub fn stop_state(&self) -> &StopState {
        &self.stop
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Immediate power cut after an unexpected internal failure.
    ///
    /// Bypasses the operator lockout.  Never fails; a refused enqueue is
    /// logged.
    pub fn fail_safe(&self) {
        match self.queue.try_enqueue(VelocityCommand::STOP, CommandSource::FailSafe) {
            Ok(()) => error!("internal fault: fail-safe stop queued"),
            Err(e) => error!(error = %e, "internal fault: fail-safe stop could not be queued"),
        }
    }
}
