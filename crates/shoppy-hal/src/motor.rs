//! Motor controller binding.
//!
//! The supervisor only ever talks to these two traits, so the simulated board
//! and the ODrive serial driver are interchangeable.
//!
//! - [`MotorDriver`] – a factory that opens a fresh session on each connect.
//! - [`MotorSession`] – one live link to the board.  Every call may fail; a
//!   failure demotes the supervisor to `Faulted`.

use std::time::Duration;

use async_trait::async_trait;
use shoppy_types::DriverError;

/// Hardware axis numbers on the controller board.
pub const AXES: [u8; 2] = [0, 1];

/// Opens sessions to a two-axis motor controller.
#[async_trait]
pub trait MotorDriver: Send + Sync {
    /// Short human-readable name used in logs, e.g. `"sim"` or `"odrive:/dev/ttyS0"`.
    fn name(&self) -> String;

    /// Acquire a handle to the hardware.
    ///
    /// # Errors
    ///
    /// [`DriverError::Connect`] when the board cannot be reached.
    async fn connect(&self) -> Result<Box<dyn MotorSession>, DriverError>;
}

/// A live link to the controller.
///
/// Owned by the supervisor alone; dropped and recreated on every reconnect.
#[async_trait]
pub trait MotorSession: Send {
    /// Arm the board-side watchdog for `axis` with the given timeout.
    async fn set_watchdog_timeout(&mut self, axis: u8, timeout: Duration) -> Result<(), DriverError>;

    /// Reset the board-side watchdog for `axis`.
    async fn feed_watchdog(&mut self, axis: u8) -> Result<(), DriverError>;

    /// Enter closed-loop velocity control on `axis`.
    async fn set_closed_loop(&mut self, axis: u8) -> Result<(), DriverError>;

    async fn set_velocity(&mut self, axis: u8, velocity: f32) -> Result<(), DriverError>;

    /// Aggregate fault code across both axes; `0` means healthy.
    async fn read_fault_code(&mut self) -> Result<u32, DriverError>;

    /// Clear latched errors.  Boards without the command report
    /// [`DriverError::Unsupported`].
    async fn clear_errors(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Unsupported("clear_errors"))
    }

    /// Reboot the board.  The session is unusable afterwards.
    async fn reboot(&mut self) -> Result<(), DriverError>;
}
