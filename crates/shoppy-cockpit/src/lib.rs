//! `shoppy-cockpit` – operator ingress
//!
//! Boots a lightweight HTTP + WebSocket server (default port `5000`) that:
//!
//! 1. **Serves** the embedded operator page (sliders, Start / Stop / Reset,
//!    F-V-J-N keyboard control) at every non-WebSocket HTTP path.
//!
//! 2. **Accepts** one operator session per WebSocket: heartbeats go to the
//!    [`LivenessMonitor`], control commands are validated, dead-zoned and
//!    pushed onto the [`CommandQueue`] without ever waiting on it.
//!
//! 3. **Reports** back: `connection_status`, periodic `ping`,
//!    `control_response`, `gradual_stop` and `error` events.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shoppy_cockpit::CockpitServer;
//! use shoppy_kernel::{GradualStopController, SafetyConfig, SessionContext, shutdown_pair};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (ctx, _consumer) = SessionContext::new(SafetyConfig::default()).unwrap();
//!     let stop = GradualStopController::new(Arc::clone(&ctx));
//!     let (_trigger, shutdown) = shutdown_pair();
//!     CockpitServer::new(ctx, stop)
//!         .run(shutdown)
//!         .await
//!         .expect("operator console failed");
//! }
//! ```
//!
//! [`LivenessMonitor`]: shoppy_kernel::LivenessMonitor
//! [`CommandQueue`]: shoppy_kernel::CommandQueue

pub mod server;

pub use server::{CockpitServer, DEFAULT_PORT};
