//! `shoppy-kernel` – command relay and safety supervision
//!
//! The part of Shoppy that decides what reaches the motors.  It owns no I/O:
//! the WebSocket ingress (`shoppy-cockpit`) writes into it and the driver
//! supervisor (`shoppy-hal`) drains it.
//!
//! # Modules
//!
//! - [`session`] – [`SessionContext`]: the one shared object, holding the
//!   heartbeat record, the stop flag and the bounded command queue.
//! - [`liveness`] – [`LivenessMonitor`]: tracks the operator heartbeat and
//!   reports each stale period exactly once; [`run_liveness_monitor`] is the
//!   periodic poll task.
//! - [`command_queue`] – [`CommandQueue`] / [`CommandConsumer`]: bounded
//!   FIFO with non-blocking enqueue and an operator lockout while stopping.
//! - [`gradual_stop`] – [`GradualStopController`]: open-loop ramp-down that
//!   overrides operator input until the rover is at rest.
//! - [`shutdown`] – cooperative shutdown signal shared by every loop.
//! - [`config`] – [`SafetyConfig`] timing and threshold constants.

pub mod command_queue;
pub mod config;
pub mod gradual_stop;
pub mod liveness;
pub mod session;
pub mod shutdown;

pub use command_queue::{CommandConsumer, CommandQueue, CommandSource};
pub use config::SafetyConfig;
pub use gradual_stop::{DecayRamp, GradualStopController, StopReason, StopState};
pub use liveness::{LivenessMonitor, LivenessVerdict, run_liveness_monitor};
pub use session::SessionContext;
pub use shutdown::{Shutdown, ShutdownTrigger, shutdown_pair};
