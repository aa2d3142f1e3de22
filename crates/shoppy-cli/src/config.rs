//! Configuration Vault – reads/writes `~/.shoppy/config.toml`.
//!
//! ```toml
//! [server]
//! port = 5000
//!
//! [safety]
//! heartbeat_timeout_ms = 2000
//! monitor_poll_ms = 500
//! queue_capacity = 50
//! dead_zone = 0.1
//! decay_factor = 0.9
//! decay_tick_ms = 100
//! stop_epsilon = 0.01
//!
//! [driver]
//! kind = "sim"            # or "odrive"
//! device = "/dev/ttyS0"
//! baud_rate = 115200
//! reply_timeout_ms = 200
//! connect_backoff_ms = 5000
//! fault_cooldown_ms = 3000
//! hw_watchdog_timeout_ms = 500
//! dequeue_timeout_ms = 50
//! fault_poll_ms = 250
//! ```

use serde::{Deserialize, Serialize};
use shoppy_hal::{DEFAULT_BAUD_RATE, SupervisorConfig};
use shoppy_kernel::SafetyConfig;
use shoppy_types::ShoppyError;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which motor driver binding to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Sim,
    Odrive,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::Sim => write!(f, "sim"),
            DriverKind::Odrive => write!(f, "odrive"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = ShoppyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sim" => Ok(DriverKind::Sim),
            "odrive" => Ok(DriverKind::Odrive),
            other => Err(ShoppyError::Config(format!("unknown driver kind {other:?}"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    /// HTTP + WebSocket port for the operator console.
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetySection {
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_monitor_poll_ms")]
    pub monitor_poll_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_dead_zone")]
    pub dead_zone: f32,
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    #[serde(default = "default_decay_tick_ms")]
    pub decay_tick_ms: u64,
    #[serde(default = "default_stop_epsilon")]
    pub stop_epsilon: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverSection {
    #[serde(default)]
    pub kind: DriverKind,
    /// Serial device of the ODrive board.
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
    #[serde(default = "default_connect_backoff_ms")]
    pub connect_backoff_ms: u64,
    #[serde(default = "default_fault_cooldown_ms")]
    pub fault_cooldown_ms: u64,
    #[serde(default = "default_hw_watchdog_timeout_ms")]
    pub hw_watchdog_timeout_ms: u64,
    #[serde(default = "default_dequeue_timeout_ms")]
    pub dequeue_timeout_ms: u64,
    #[serde(default = "default_fault_poll_ms")]
    pub fault_poll_ms: u64,
}

/// Persisted configuration stored in `~/.shoppy/config.toml`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub driver: DriverSection,
}

fn default_port() -> u16 {
    shoppy_cockpit::DEFAULT_PORT
}
fn default_heartbeat_timeout_ms() -> u64 {
    2000
}
fn default_monitor_poll_ms() -> u64 {
    500
}
fn default_queue_capacity() -> usize {
    50
}
fn default_dead_zone() -> f32 {
    shoppy_types::DEFAULT_DEAD_ZONE
}
fn default_decay_factor() -> f32 {
    shoppy_kernel::config::MAX_DECAY_FACTOR
}
fn default_decay_tick_ms() -> u64 {
    100
}
fn default_stop_epsilon() -> f32 {
    0.01
}
fn default_device() -> String {
    "/dev/ttyS0".to_string()
}
fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}
fn default_reply_timeout_ms() -> u64 {
    200
}
fn default_connect_backoff_ms() -> u64 {
    5000
}
fn default_fault_cooldown_ms() -> u64 {
    3000
}
fn default_hw_watchdog_timeout_ms() -> u64 {
    500
}
fn default_dequeue_timeout_ms() -> u64 {
    50
}
fn default_fault_poll_ms() -> u64 {
    250
}

impl Default for ServerSection {
    fn default() -> Self {
        Self { port: default_port() }
    }
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            monitor_poll_ms: default_monitor_poll_ms(),
            queue_capacity: default_queue_capacity(),
            dead_zone: default_dead_zone(),
            decay_factor: default_decay_factor(),
            decay_tick_ms: default_decay_tick_ms(),
            stop_epsilon: default_stop_epsilon(),
        }
    }
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            kind: DriverKind::default(),
            device: default_device(),
            baud_rate: default_baud_rate(),
            reply_timeout_ms: default_reply_timeout_ms(),
            connect_backoff_ms: default_connect_backoff_ms(),
            fault_cooldown_ms: default_fault_cooldown_ms(),
            hw_watchdog_timeout_ms: default_hw_watchdog_timeout_ms(),
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            fault_poll_ms: default_fault_poll_ms(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Derived runtime configs
// ─────────────────────────────────────────────────────────────────────────────

const MONITOR_POLL_RANGE_MS: RangeInclusive<u64> = 500..=1000;
const CONNECT_BACKOFF_RANGE_MS: RangeInclusive<u64> = 2000..=10_000;
const FAULT_COOLDOWN_RANGE_MS: RangeInclusive<u64> = 2000..=5000;

impl Config {
    pub fn safety_config(&self) -> SafetyConfig {
        let s = &self.safety;
        SafetyConfig {
            heartbeat_timeout: Duration::from_millis(s.heartbeat_timeout_ms),
            monitor_poll_interval: Duration::from_millis(s.monitor_poll_ms),
            queue_capacity: s.queue_capacity,
            dead_zone: s.dead_zone,
            decay_factor: s.decay_factor,
            decay_tick: Duration::from_millis(s.decay_tick_ms),
            stop_epsilon: s.stop_epsilon,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let d = &self.driver;
        SupervisorConfig {
            connect_backoff: Duration::from_millis(d.connect_backoff_ms),
            fault_cooldown: Duration::from_millis(d.fault_cooldown_ms),
            hw_watchdog_timeout: Duration::from_millis(d.hw_watchdog_timeout_ms),
            dequeue_timeout: Duration::from_millis(d.dequeue_timeout_ms),
            fault_poll_interval: Duration::from_millis(d.fault_poll_ms),
        }
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.driver.reply_timeout_ms)
    }

    /// Reject values outside the operating envelope.
    ///
    /// # Errors
    ///
    /// [`ShoppyError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ShoppyError> {
        check_range("safety.monitor_poll_ms", self.safety.monitor_poll_ms, MONITOR_POLL_RANGE_MS)?;
        check_range("driver.connect_backoff_ms", self.driver.connect_backoff_ms, CONNECT_BACKOFF_RANGE_MS)?;
        check_range("driver.fault_cooldown_ms", self.driver.fault_cooldown_ms, FAULT_COOLDOWN_RANGE_MS)?;
        if self.driver.reply_timeout_ms == 0 {
            return Err(ShoppyError::Config("driver.reply_timeout_ms must be non-zero".into()));
        }
        if self.driver.kind == DriverKind::Odrive && self.driver.device.trim().is_empty() {
            return Err(ShoppyError::Config("driver.device is required for the odrive driver".into()));
        }
        if self.driver.baud_rate == 0 {
            return Err(ShoppyError::Config("driver.baud_rate must be non-zero".into()));
        }
        self.safety_config().validate()?;
        self.supervisor_config().validate()
    }
}

fn check_range(name: &str, value: u64, range: RangeInclusive<u64>) -> Result<(), ShoppyError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ShoppyError::Config(format!(
            "{name} = {value} is outside {}..={}",
            range.start(),
            range.end()
        )))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Vault
// ─────────────────────────────────────────────────────────────────────────────

/// Return the path to `~/.shoppy/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".shoppy").join("config.toml")
}

/// Load the config at `path`, writing the defaults there first if it does
/// not exist yet.  Environment overrides are applied on top.
pub fn load_or_init(path: &Path) -> Result<Config, ShoppyError> {
    let mut cfg = match load_from(path)? {
        Some(cfg) => cfg,
        None => {
            let cfg = Config::default();
            save_to(&cfg, path)?;
            cfg
        }
    };
    apply_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Load the config from `path`.  Returns `None` if the file does not exist.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, ShoppyError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| ShoppyError::Config(format!("failed to read {}: {e}", path.display())))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| ShoppyError::Config(format!("failed to parse {}: {e}", path.display())))?;
    Ok(Some(cfg))
}

/// Apply `SHOPPY_*` overrides, reading variables through `lookup`.
///
/// | Variable | Config field |
/// |---|---|
/// | `SHOPPY_PORT` | `server.port` |
/// | `SHOPPY_DRIVER` | `driver.kind` |
/// | `SHOPPY_DEVICE` | `driver.device` |
/// | `SHOPPY_BAUD_RATE` | `driver.baud_rate` |
/// | `SHOPPY_HEARTBEAT_TIMEOUT_MS` | `safety.heartbeat_timeout_ms` |
///
/// Unparsable values are ignored.
pub fn apply_overrides(cfg: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("SHOPPY_PORT").and_then(|v| v.parse().ok()) {
        cfg.server.port = port;
    }
    if let Some(kind) = lookup("SHOPPY_DRIVER").and_then(|v| v.parse().ok()) {
        cfg.driver.kind = kind;
    }
    if let Some(device) = lookup("SHOPPY_DEVICE") {
        cfg.driver.device = device;
    }
    if let Some(baud) = lookup("SHOPPY_BAUD_RATE").and_then(|v| v.parse().ok()) {
        cfg.driver.baud_rate = baud;
    }
    if let Some(ms) = lookup("SHOPPY_HEARTBEAT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        cfg.safety.heartbeat_timeout_ms = ms;
    }
}

/// Save the config to `path`, creating the parent directory if necessary.
pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), ShoppyError> {
    let vault_err = |what: &str, e: std::io::Error| ShoppyError::Config(format!("{what} {}: {e}", path.display()));

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| vault_err("failed to create directory for", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| vault_err("failed to restrict directory of", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg).map_err(|e| ShoppyError::Config(format!("failed to serialize config: {e}")))?;

    #[cfg(unix)]
    {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| f.write_all(raw.as_bytes()))
            .map_err(|e| vault_err("failed to write", e))?;
    }
    #[cfg(not(unix))]
    {
        fs::write(path, raw).map_err(|e| vault_err("failed to write", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_are_valid_and_match_safety_core() {
        let cfg = Config::default();
        cfg.validate().expect("defaults must validate");
        assert_eq!(cfg.safety_config(), SafetyConfig::default());
        assert_eq!(cfg.supervisor_config(), SupervisorConfig::default());
        assert_eq!(cfg.server.port, 5000);
        assert_eq!(cfg.driver.kind, DriverKind::Sim);
        assert_eq!(cfg.driver.device, "/dev/ttyS0");
        assert_eq!(cfg.driver.baud_rate, 115_200);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");
        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[driver]\nkind = \"odrive\"\n\n[safety]\ndecay_factor = 0.8\n").unwrap();

        let cfg = load_from(&path).unwrap().unwrap();
        assert_eq!(cfg.driver.kind, DriverKind::Odrive);
        assert_eq!(cfg.driver.device, "/dev/ttyS0");
        assert_eq!(cfg.driver.baud_rate, 115_200);
        assert!((cfg.safety.decay_factor - 0.8).abs() < f32::EPSILON);
        assert_eq!(cfg.safety.queue_capacity, 50);
        assert_eq!(cfg.server.port, 5000);
    }

    #[test]
    fn load_or_init_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).unwrap().is_none());

        load_or_init(&path).expect("init");
        assert!(path.exists());
    }

    #[test]
    fn broken_toml_is_a_config_error() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[server\nport = ").unwrap();
        assert!(matches!(load_from(&path), Err(ShoppyError::Config(_))));
    }

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn config_path_points_to_shoppy_dir() {
        let p = config_path_for_home("/home/rover");
        assert_eq!(p, PathBuf::from("/home/rover/.shoppy/config.toml"));
    }

    #[test]
    fn overrides_replace_fields() {
        let mut cfg = Config::default();
        apply_overrides(
            &mut cfg,
            env(&[
                ("SHOPPY_PORT", "8081"),
                ("SHOPPY_DRIVER", "ODrive"),
                ("SHOPPY_DEVICE", "/dev/ttyACM0"),
                ("SHOPPY_BAUD_RATE", "921600"),
                ("SHOPPY_HEARTBEAT_TIMEOUT_MS", "1500"),
            ]),
        );
        assert_eq!(cfg.server.port, 8081);
        assert_eq!(cfg.driver.kind, DriverKind::Odrive);
        assert_eq!(cfg.driver.device, "/dev/ttyACM0");
        assert_eq!(cfg.driver.baud_rate, 921_600);
        assert_eq!(cfg.safety.heartbeat_timeout_ms, 1500);
    }

    #[test]
    fn overrides_ignore_unparsable_values() {
        let mut cfg = Config::default();
        apply_overrides(&mut cfg, env(&[("SHOPPY_PORT", "not-a-port"), ("SHOPPY_DRIVER", "can-bus")]));
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn validate_rejects_out_of_envelope_values() {
        let mut cfg = Config::default();
        cfg.driver.connect_backoff_ms = 500;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.safety.monitor_poll_ms = 2000;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.driver.baud_rate = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.safety.decay_factor = 0.95;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.driver.dequeue_timeout_ms = 600;
        assert!(cfg.validate().is_err());
    }
}
