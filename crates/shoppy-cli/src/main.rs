//! `shoppy` – rover teleop daemon
//!
//! Loads `~/.shoppy/config.toml` (writing defaults on first run), then runs
//! the safety core, the driver supervisor and the operator console until
//! Ctrl-C.  On Ctrl-C the rover is ramped down to rest before the tasks are
//! told to exit.
//!
//! ```text
//! shoppy [--config <path>]
//! ```

mod config;
mod telemetry;

use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use shoppy_cockpit::CockpitServer;
use shoppy_hal::{DriverSupervisor, MotorDriver, OdriveAsciiDriver, SimMotorController};
use shoppy_kernel::{GradualStopController, SessionContext, StopReason, run_liveness_monitor, shutdown_pair};
use shoppy_types::ShoppyError;

use crate::config::{Config, DriverKind};

/// Upper bound on the Ctrl-C ramp-down before tasks are stopped regardless.
const REST_GRACE: Duration = Duration::from_secs(10);

fn main() -> ExitCode {
    let _telemetry = telemetry::init_tracing("shoppy");
    print_banner();

    let path = match parse_args(std::env::args().skip(1)) {
        Ok(path) => path,
        Err(msg) => {
            eprintln!("{}: {msg}", "Usage error".red());
            eprintln!("  usage: shoppy [--config <path>]");
            return ExitCode::from(2);
        }
    };

    let cfg = match config::load_or_init(&path).and_then(|cfg| cfg.validate().map(|()| cfg)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{}: {e}", "Config error".red());
            return ExitCode::FAILURE;
        }
    };
    println!("  Config loaded from {}", path.display().to_string().bold());
    println!(
        "  Driver {}  ·  console on port {}\n",
        cfg.driver.kind.to_string().bold(),
        cfg.server.port.to_string().bold()
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {e}", "Runtime error".red());
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cfg)) {
        Ok(()) => {
            println!("{}", "  ✓ Rover at rest. Exiting Shoppy.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "shoppy stopped with an error");
            ExitCode::FAILURE
        }
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<PathBuf, String> {
    let mut path = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let value = args.next().ok_or("--config needs a path")?;
                path = Some(PathBuf::from(value));
            }
            other => return Err(format!("unexpected argument {other:?}")),
        }
    }
    Ok(path.unwrap_or_else(config::config_path))
}

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
// ─────────────────────────────────────────────────────────────────────────────

async fn run(cfg: Config) -> Result<(), ShoppyError> {
    let (ctx, consumer) = SessionContext::new(cfg.safety_config())?;
    let stop = GradualStopController::new(Arc::clone(&ctx));
    let (trigger, shutdown) = shutdown_pair();

    let driver: Arc<dyn MotorDriver> = match cfg.driver.kind {
        DriverKind::Sim => Arc::new(SimMotorController::new()),
        DriverKind::Odrive => Arc::new(OdriveAsciiDriver::new(
            cfg.driver.device.as_str(),
            cfg.driver.baud_rate,
            cfg.reply_timeout(),
        )),
    };
    let supervisor = DriverSupervisor::new(driver, cfg.supervisor_config(), consumer, stop.clone());

    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));
    let monitor_task = tokio::spawn(run_liveness_monitor(Arc::clone(&ctx), stop.clone(), shutdown.clone()));
    let mut server_task = tokio::spawn(
        CockpitServer::new(Arc::clone(&ctx), stop.clone())
            .with_port(cfg.server.port)
            .run(shutdown.clone()),
    );

    let (interrupt_tx, mut interrupt_rx) = tokio::sync::mpsc::unbounded_channel();
    if let Err(e) = ctrlc::set_handler(move || {
        let _ = interrupt_tx.send(());
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful stop on Ctrl-C unavailable");
    }

    let mut server_done = false;
    let outcome = tokio::select! {
        _ = interrupt_rx.recv() => {
            println!();
            println!("{}", "⚠  Ctrl-C received – bringing the rover to rest …".yellow().bold());
            Ok(())
        }
        joined = &mut server_task => {
            server_done = true;
            match joined {
                Ok(result) => result,
                Err(e) => Err(ShoppyError::Transport(format!("operator console task failed: {e}"))),
            }
        }
    };

    bring_to_rest(&ctx, &stop).await;
    trigger.fire();

    if !server_done {
        if let Err(e) = server_task.await {
            warn!(error = %e, "operator console task failed during shutdown");
        }
    }
    for (name, task) in [("supervisor", supervisor_task), ("liveness monitor", monitor_task)] {
        if let Err(e) = task.await {
            warn!(task = name, error = %e, "task failed during shutdown");
        }
    }
    outcome
}

/// Ramp the rover down and wait until the final zero has left the queue.
async fn bring_to_rest(ctx: &SessionContext, stop: &GradualStopController) {
    stop.trigger(StopReason::Shutdown);
    let mut state = ctx.stop_state().subscribe();
    let settled = tokio::time::timeout(REST_GRACE, async {
        let _ = state.wait_for(Option::is_none).await;
        while !ctx.queue().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;

    match settled {
        Ok(()) => info!("rover at rest"),
        Err(_) => warn!(
            grace_s = REST_GRACE.as_secs(),
            queued = ctx.queue().len(),
            "rover did not settle in time; stopping anyway"
        ),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___ _                            "#.bold().cyan());
    println!("{}", r#"  / __| |_  ___ _ __ _ __ _  _      "#.bold().cyan());
    println!("{}", r#"  \__ \ ' \/ _ \ '_ \ '_ \ || |     "#.bold().cyan());
    println!("{}", r#"  |___/_||_\___/ .__/ .__/\_, |     "#.bold().cyan());
    println!("{}", r#"               |_|  |_|   |__/      "#.bold().cyan());
    println!();
    println!("  {} {}", "Shoppy".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!("  Rover teleop with fail-safe stop");
    println!();
}
