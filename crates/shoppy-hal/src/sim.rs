//! [`SimMotorController`] – in-process two-axis board for CI and `driver = "sim"`.
//!
//! Records every command without touching real hardware.  Clones share the
//! same board, so a test keeps one handle for inspection and fault injection
//! while the supervisor drives another.
//!
//! # Stub behaviour
//!
//! | Call | Behaviour |
//! |---|---|
//! | `connect` | Fails while injected connect failures remain, otherwise opens a session. |
//! | `set_watchdog_timeout` | Arms the per-axis watchdog; a later feed arriving after the timeout latches [`WATCHDOG_FAULT`]. |
//! | `set_velocity` | Stores the target and appends it to the history; refused while a fault is latched. |
//! | `clear_errors` | Clears latched faults except a sticky one. |
//! | `reboot` | Clears everything and invalidates every open session. |
//!
//! # Example
//!
//! ```rust
//! use shoppy_hal::sim::SimMotorController;
//!
//! let board = SimMotorController::new();
//! board.fail_next_connects(2);
//! assert_eq!(board.snapshot().connects, 0);
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use shoppy_types::DriverError;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::motor::{AXES, MotorDriver, MotorSession};

/// Fault code latched when an axis watchdog expires.
pub const WATCHDOG_FAULT: u32 = 0x800;

// ─────────────────────────────────────────────────────────────────────────────
// Board state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Board {
    generation: u64,
    connect_failures: u32,
    connect_attempts: u32,
    connects: u32,
    reboots: u32,
    feeds: u64,
    watchdog_trips: u32,
    fault_code: u32,
    sticky_fault: u32,
    closed_loop: [bool; 2],
    velocities: [f32; 2],
    watchdog_timeout: [Option<Duration>; 2],
    last_feed: [Option<Instant>; 2],
    applied: Vec<(u8, f32)>,
}

impl Board {
    fn check_session(&self, generation: u64) -> Result<(), DriverError> {
        if generation == self.generation {
            Ok(())
        } else {
            Err(DriverError::Disconnected)
        }
    }

    /// Latch the watchdog fault on any armed axis that went unfed too long.
    fn check_watchdogs(&mut self) {
        for axis in AXES {
            let i = axis as usize;
            let (Some(timeout), Some(fed)) = (self.watchdog_timeout[i], self.last_feed[i]) else {
                continue;
            };
            if fed.elapsed() > timeout && self.closed_loop[i] {
                warn!(axis, "sim watchdog expired");
                self.watchdog_trips += 1;
                self.fault_code |= WATCHDOG_FAULT;
                self.closed_loop[i] = false;
                self.velocities[i] = 0.0;
            }
        }
    }

    fn reset(&mut self) {
        self.generation += 1;
        self.fault_code = 0;
        self.sticky_fault = 0;
        self.closed_loop = [false; 2];
        self.velocities = [0.0; 2];
        self.watchdog_timeout = [None; 2];
        self.last_feed = [None; 2];
    }
}

fn axis_index(axis: u8) -> Result<usize, DriverError> {
    if AXES.contains(&axis) {
        Ok(axis as usize)
    } else {
        Err(DriverError::Protocol(format!("no such axis {axis}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Inspection
// ─────────────────────────────────────────────────────────────────────────────

/// Point-in-time copy of the simulated board.
#[derive(Debug, Clone, PartialEq)]
pub struct SimSnapshot {
    pub connect_attempts: u32,
    pub connects: u32,
    pub reboots: u32,
    pub feeds: u64,
    pub watchdog_trips: u32,
    pub fault_code: u32,
    pub closed_loop: [bool; 2],
    pub velocities: [f32; 2],
    /// Every accepted `set_velocity` call as `(axis, velocity)`, oldest first.
    pub applied: Vec<(u8, f32)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// SimMotorController
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SimMotorController {
    board: Arc<Mutex<Board>>,
}

impl SimMotorController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.lock().connect_failures = n;
    }

    /// Latch `code`; cleared by `clear_errors` or `reboot`.
    pub fn inject_fault(&self, code: u32) {
        self.lock().fault_code |= code;
    }

    /// Latch `code` so that only a reboot clears it.
    pub fn inject_sticky_fault(&self, code: u32) {
        let mut board = self.lock();
        board.sticky_fault |= code;
        board.fault_code |= code;
    }

    /// Sever the link: every open session starts returning
    /// [`DriverError::Disconnected`].
    pub fn drop_link(&self) {
        self.lock().generation += 1;
    }

    pub fn snapshot(&self) -> SimSnapshot {
        let board = self.lock();
        SimSnapshot {
            connect_attempts: board.connect_attempts,
            connects: board.connects,
            reboots: board.reboots,
            feeds: board.feeds,
            watchdog_trips: board.watchdog_trips,
            fault_code: board.fault_code,
            closed_loop: board.closed_loop,
            velocities: board.velocities,
            applied: board.applied.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Board> {
        self.board.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MotorDriver for SimMotorController {
    fn name(&self) -> String {
        "sim".to_string()
    }

    async fn connect(&self) -> Result<Box<dyn MotorSession>, DriverError> {
        let mut board = self.lock();
        board.connect_attempts += 1;
        if board.connect_failures > 0 {
            board.connect_failures -= 1;
            return Err(DriverError::Connect("simulated connect failure".to_string()));
        }
        board.connects += 1;
        debug!(generation = board.generation, "sim session opened");
        Ok(Box::new(SimSession {
            board: Arc::clone(&self.board),
            generation: board.generation,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct SimSession {
    board: Arc<Mutex<Board>>,
    generation: u64,
}

impl SimSession {
    /// Lock the board, failing if this session has been invalidated.
    fn live(&self) -> Result<MutexGuard<'_, Board>, DriverError> {
        let mut board = self.board.lock().unwrap_or_else(PoisonError::into_inner);
        board.check_session(self.generation)?;
        board.check_watchdogs();
        Ok(board)
    }
}

#[async_trait]
impl MotorSession for SimSession {
    async fn set_watchdog_timeout(&mut self, axis: u8, timeout: Duration) -> Result<(), DriverError> {
        let i = axis_index(axis)?;
        let mut board = self.live()?;
        board.watchdog_timeout[i] = Some(timeout);
        board.last_feed[i] = Some(Instant::now());
        Ok(())
    }

    async fn feed_watchdog(&mut self, axis: u8) -> Result<(), DriverError> {
        let i = axis_index(axis)?;
        let mut board = self.live()?;
        board.feeds += 1;
        board.last_feed[i] = Some(Instant::now());
        Ok(())
    }

    async fn set_closed_loop(&mut self, axis: u8) -> Result<(), DriverError> {
        let i = axis_index(axis)?;
        let mut board = self.live()?;
        board.closed_loop[i] = true;
        board.last_feed[i] = Some(Instant::now());
        Ok(())
    }

    async fn set_velocity(&mut self, axis: u8, velocity: f32) -> Result<(), DriverError> {
        let i = axis_index(axis)?;
        let mut board = self.live()?;
        if board.fault_code != 0 {
            return Err(DriverError::Fault {
                code: board.fault_code,
            });
        }
        board.velocities[i] = velocity;
        board.applied.push((axis, velocity));
        Ok(())
    }

    async fn read_fault_code(&mut self) -> Result<u32, DriverError> {
        Ok(self.live()?.fault_code)
    }

    async fn clear_errors(&mut self) -> Result<(), DriverError> {
        let mut board = self.live()?;
        board.fault_code = board.sticky_fault;
        Ok(())
    }

    async fn reboot(&mut self) -> Result<(), DriverError> {
        let mut board = self.live()?;
        board.reboots += 1;
        board.reset();
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
