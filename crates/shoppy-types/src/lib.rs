use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default magnitude below which operator input is treated as exactly zero.
pub const DEFAULT_DEAD_ZONE: f32 = 0.1;

/// One of the two independently driven motor channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Left,
    Right,
}

impl Axis {
    pub const ALL: [Axis; 2] = [Axis::Left, Axis::Right];
}

/// Per-axis velocity target carried from ingress to actuation.
///
/// `None` leaves that axis at its previous target.  A command with both
/// axes absent is the reset sentinel: the driver supervisor reboots the
/// hardware instead of applying anything.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VelocityCommand {
    pub left: Option<f32>,
    pub right: Option<f32>,
}

impl VelocityCommand {
    /// Reset/reboot sentinel.
    pub const RESET: Self = Self {
        left: None,
        right: None,
    };

    /// Explicit zero on both axes.
    pub const STOP: Self = Self {
        left: Some(0.0),
        right: Some(0.0),
    };

    pub fn pair(left: f32, right: f32) -> Self {
        Self {
            left: Some(left),
            right: Some(right),
        }
    }

    pub fn left_only(value: f32) -> Self {
        Self {
            left: Some(value),
            right: None,
        }
    }

    pub fn right_only(value: f32) -> Self {
        Self {
            left: None,
            right: Some(value),
        }
    }

    pub fn is_reset(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }

    pub fn get(&self, axis: Axis) -> Option<f32> {
        match axis {
            Axis::Left => self.left,
            Axis::Right => self.right,
        }
    }
}

/// Collapse magnitudes below `threshold` to exactly zero.
pub fn apply_dead_zone(value: f32, threshold: f32) -> f32 {
    if value.abs() < threshold { 0.0 } else { value }
}

// ────────────────────────────────────────────────────────────────────────────
// Operator control messages
// ────────────────────────────────────────────────────────────────────────────

/// Which motor(s) an operator control message addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorSelector {
    Left,
    Right,
    Both,
    Reset,
}

/// Payload of an inbound `control_command` event.
///
/// Unknown fields are rejected so that typos in the operator UI surface as
/// errors instead of silently driving the rover.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlMessage {
    pub motor: MotorSelector,
    pub value: f64,
    pub power: f64,
}

impl ControlMessage {
    /// Validate the message and map it onto a [`VelocityCommand`].
    ///
    /// `value` must be finite; it is clamped into `[-1, 1]` and dead-zoned.
    /// `power` must be finite and within `[0, 1]`.  A `reset` message maps to
    /// [`VelocityCommand::RESET`] regardless of its value.
    ///
    /// # Errors
    ///
    /// Returns [`ShoppyError::MalformedCommand`] when a numeric field is out
    /// of range or not finite.
    pub fn to_command(&self, dead_zone: f32) -> Result<VelocityCommand, ShoppyError> {
        if !self.value.is_finite() {
            return Err(ShoppyError::MalformedCommand(format!(
                "value must be a finite number, got {}",
                self.value
            )));
        }
        if !self.power.is_finite() || !(0.0..=1.0).contains(&self.power) {
            return Err(ShoppyError::MalformedCommand(format!(
                "power must be within [0, 1], got {}",
                self.power
            )));
        }

        let value = apply_dead_zone(self.value.clamp(-1.0, 1.0) as f32, dead_zone);
        Ok(match self.motor {
            MotorSelector::Left => VelocityCommand::left_only(value),
            MotorSelector::Right => VelocityCommand::right_only(value),
            MotorSelector::Both => VelocityCommand::pair(value, value),
            MotorSelector::Reset => VelocityCommand::RESET,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Outbound events
// ────────────────────────────────────────────────────────────────────────────

/// Events pushed from the rover to the operator.
///
/// Serialised as `{"event": "<snake_case name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent once when the operator connection is accepted.
    ConnectionStatus { status: String },
    /// Liveness probe, sent every half heartbeat timeout.
    Ping { timestamp: DateTime<Utc> },
    /// Acknowledges an accepted control command.
    ControlResponse {
        status: String,
        motor: MotorSelector,
        value: f32,
        power: f64,
        /// Commanded left target after the command was queued.
        left: f32,
        /// Commanded right target after the command was queued.
        right: f32,
    },
    /// A gradual stop has begun; operator commands are locked out until it ends.
    GradualStop { reason: String },
    /// A rejected command or message.
    Error { message: String },
}

impl ServerEvent {
    pub fn connected() -> Self {
        ServerEvent::ConnectionStatus {
            status: "connected".to_string(),
        }
    }

    pub fn ping() -> Self {
        ServerEvent::Ping {
            timestamp: Utc::now(),
        }
    }

    pub fn error(message: impl fmt::Display) -> Self {
        ServerEvent::Error {
            message: message.to_string(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Errors raised by the command path and configuration.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShoppyError {
    #[error("command queue is full ({capacity} commands pending)")]
    QueueFull { capacity: usize },

    #[error("gradual stop in progress; operator commands are locked out")]
    StopInProgress,

    #[error("command queue consumer has shut down")]
    QueueClosed,

    #[error("malformed command: {0}")]
    MalformedCommand(String),

    #[error("operator heartbeat timed out")]
    HeartbeatTimeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failures reported by a motor driver binding.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DriverError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("i/o error: {0}")]
    Io(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("hardware link closed")]
    Disconnected,

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("controller fault code {code:#x}")]
    Fault { code: u32 },

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}
