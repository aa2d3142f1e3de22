//! Timing and threshold constants for the safety core.

use std::time::Duration;

use shoppy_types::{DEFAULT_DEAD_ZONE, ShoppyError};

/// Upper bound on the per-tick decay factor of a gradual stop.
pub const MAX_DECAY_FACTOR: f32 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct SafetyConfig {
    /// Maximum silence from the operator before the link is considered lost.
    pub heartbeat_timeout: Duration,
    /// Cadence of the independent liveness poll.
    pub monitor_poll_interval: Duration,
    /// Bounded command queue capacity.
    pub queue_capacity: usize,
    /// Magnitudes below this are normalised to exactly zero at ingress.
    pub dead_zone: f32,
    /// Multiplier applied to both axes on every decay tick.
    pub decay_factor: f32,
    /// Interval between decay ticks.
    pub decay_tick: Duration,
    /// The ramp ends once both magnitudes are at or below this value.
    pub stop_epsilon: f32,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(2),
            monitor_poll_interval: Duration::from_millis(500),
            queue_capacity: 50,
            dead_zone: DEFAULT_DEAD_ZONE,
            decay_factor: MAX_DECAY_FACTOR,
            decay_tick: Duration::from_millis(100),
            stop_epsilon: 0.01,
        }
    }
}

impl SafetyConfig {
    /// Reject values that would break the core's invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ShoppyError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ShoppyError> {
        if self.heartbeat_timeout.is_zero() {
            return Err(config_err("heartbeat_timeout must be non-zero"));
        }
        if self.monitor_poll_interval.is_zero() || self.monitor_poll_interval > self.heartbeat_timeout
        {
            return Err(config_err(
                "monitor_poll_interval must be non-zero and no longer than heartbeat_timeout",
            ));
        }
        if self.queue_capacity == 0 {
            return Err(config_err("queue_capacity must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.dead_zone) {
            return Err(config_err("dead_zone must be within [0, 1)"));
        }
        if !(self.decay_factor > 0.0 && self.decay_factor <= MAX_DECAY_FACTOR) {
            return Err(config_err("decay_factor must be within (0, 0.9]"));
        }
        if self.decay_tick.is_zero() {
            return Err(config_err("decay_tick must be non-zero"));
        }
        if !(self.stop_epsilon > 0.0 && self.stop_epsilon < 1.0) {
            return Err(config_err("stop_epsilon must be within (0, 1)"));
        }
        Ok(())
    }
}

fn config_err(msg: &str) -> ShoppyError {
    ShoppyError::Config(msg.to_string())
}
