//! `shoppy-hal` – motor controller side of Shoppy.
//!
//! - [`motor`] – [`MotorDriver`] / [`MotorSession`]: the driver binding the
//!   supervisor talks to.
//! - [`sim`] – [`SimMotorController`]: in-process board with fault injection.
//! - [`odrive`] – [`OdriveAsciiDriver`]: ODrive ASCII protocol over a tty.
//! - [`supervisor`] – [`DriverSupervisor`]: connect, arm, feed, drain the
//!   command queue, recover.

pub mod motor;
pub mod odrive;
pub mod sim;
pub mod supervisor;

pub use motor::{AXES, MotorDriver, MotorSession};
pub use odrive::{DEFAULT_BAUD_RATE, OdriveAsciiDriver, OdriveSession};
pub use sim::{SimMotorController, SimSnapshot, WATCHDOG_FAULT};
pub use supervisor::{DriverSupervisor, RecoveryAction, SupervisorConfig, SupervisorState, recovery_for};
