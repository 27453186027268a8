//! # Configuration
//!
//! [`SessionConfig`] holds every bound, interval and settle delay the
//! session core uses. Nothing in the connect/disconnect protocol is an
//! inline magic number, so tests can shrink all waits to milliseconds.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. `MUSE_SESSION_CONFIG` environment variable pointing at a file
//! 4. `./muse-session.toml` in the current directory
//! 5. `~/.config/muse-session/muse-session.toml`
//! 6. Built-in defaults
//!
//! Individual fields can always be overridden by environment variables
//! (`MUSE_SESSION_CONNECT_TIMEOUT_MS`, `MUSE_SESSION_RECONNECT_MAX_ATTEMPTS`,
//! `MUSE_SESSION_HEALTH_INTERVAL_MS`, `MUSE_SESSION_PRESET`), even when
//! loading from a file.

use serde::{Deserialize, Serialize};
#[cfg(feature = "config-toml")]
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SessionError, SessionResult};
use crate::vendor::Preset;

/// Default bound on waiting for the link to come up, in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;

/// Default bound on waiting for disconnect confirmation, in milliseconds.
const DEFAULT_DISCONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default interval between direct vendor state polls, in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default settle delay after a defensive disconnect before reconnecting.
const DEFAULT_TEARDOWN_SETTLE_MS: u64 = 500;

/// Default settle delay after enabling data transmission.
const DEFAULT_TRANSMISSION_SETTLE_MS: u64 = 200;

/// Default interval between device-list reads while scanning.
const DEFAULT_LIST_POLL_INTERVAL_MS: u64 = 100;

/// Default max automatic reconnect attempts.
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 3;

/// Default health check interval in milliseconds.
const DEFAULT_HEALTH_INTERVAL_MS: u64 = 2_000;

/// Default bound on waiting for a stopped health monitor to exit.
const DEFAULT_HEALTH_STOP_TIMEOUT_MS: u64 = 1_000;

/// Deadlines this far out stand in for "never".
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Default number of timestamp diagnostics logged per session.
const DEFAULT_TIMESTAMP_LOG_LIMIT: u32 = 5;

/// Default plausibility window around "now" for vendor timestamps, in days.
const DEFAULT_PLAUSIBLE_WINDOW_DAYS: u32 = 3_650;

/// Default battery level reported when the headband can't be asked.
const DEFAULT_FALLBACK_BATTERY_PERCENT: f64 = 80.0;

/// Default per-subscriber buffer for telemetry streams.
const DEFAULT_STREAM_BUFFER: usize = 256;

/// Configuration for a headband session.
///
/// # Examples
///
/// ## From a TOML file
///
/// ```no_run
/// use muse_session::config::SessionConfig;
///
/// let config = SessionConfig::from_file("muse-session.toml").expect("Bad config");
/// ```
///
/// ## Programmatic
///
/// ```
/// use muse_session::config::SessionConfig;
///
/// let mut config = SessionConfig::default();
/// config.reconnect.max_attempts = 5;
/// assert_eq!(config.timeouts.connect().as_secs(), 30);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Vendor preset applied on every connect.
    #[serde(default)]
    pub preset: Preset,

    /// Timeout and settle-delay configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Automatic recovery configuration.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Link health monitoring configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Telemetry normalization and fan-out configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Bounds for every wait in the connect/disconnect protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Upper bound on waiting for `Connected`, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Upper bound on waiting for `Disconnected` after a vendor disconnect.
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,

    /// Interval between direct vendor state polls.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Pause after a defensive disconnect before connecting again.
    #[serde(default = "default_teardown_settle")]
    pub teardown_settle_ms: u64,

    /// Pause after enabling data transmission.
    #[serde(default = "default_transmission_settle")]
    pub transmission_settle_ms: u64,

    /// Interval between device-list reads while scanning.
    #[serde(default = "default_list_poll_interval")]
    pub list_poll_interval_ms: u64,
}

/// Automatic recovery after silent link loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic recovery.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Ceiling on consecutive automatic attempts. Reset by any successful connect.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,
}

/// Link health monitoring (direct vendor polls while connected).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Enable the periodic health check.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between health checks, in milliseconds.
    #[serde(default = "default_health_interval")]
    pub interval_ms: u64,

    /// How long stopping the monitor waits for its task to exit.
    #[serde(default = "default_health_stop_timeout")]
    pub stop_timeout_ms: u64,
}

/// Telemetry normalization and delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// How many malformed-timestamp diagnostics to log before going quiet.
    #[serde(default = "default_timestamp_log_limit")]
    pub timestamp_log_limit: u32,

    /// Distance from "now" within which an inferred timestamp is plausible.
    #[serde(default = "default_plausible_window_days")]
    pub plausible_window_days: u32,

    /// Battery level reported when neither the vendor nor a packet knows.
    #[serde(default = "default_fallback_battery")]
    pub fallback_battery_percent: f64,

    /// Capacity of each [`TelemetryStream`](crate::stream::TelemetryStream).
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_disconnect_timeout() -> u64 {
    DEFAULT_DISCONNECT_TIMEOUT_MS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_teardown_settle() -> u64 {
    DEFAULT_TEARDOWN_SETTLE_MS
}

fn default_transmission_settle() -> u64 {
    DEFAULT_TRANSMISSION_SETTLE_MS
}

fn default_list_poll_interval() -> u64 {
    DEFAULT_LIST_POLL_INTERVAL_MS
}

fn default_reconnect_max_attempts() -> u32 {
    DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_health_interval() -> u64 {
    DEFAULT_HEALTH_INTERVAL_MS
}

fn default_health_stop_timeout() -> u64 {
    DEFAULT_HEALTH_STOP_TIMEOUT_MS
}

fn default_timestamp_log_limit() -> u32 {
    DEFAULT_TIMESTAMP_LOG_LIMIT
}

fn default_plausible_window_days() -> u32 {
    DEFAULT_PLAUSIBLE_WINDOW_DAYS
}

fn default_fallback_battery() -> f64 {
    DEFAULT_FALLBACK_BATTERY_PERCENT
}

fn default_stream_buffer() -> usize {
    DEFAULT_STREAM_BUFFER
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            disconnect_timeout_ms: DEFAULT_DISCONNECT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            teardown_settle_ms: DEFAULT_TEARDOWN_SETTLE_MS,
            transmission_settle_ms: DEFAULT_TRANSMISSION_SETTLE_MS,
            list_poll_interval_ms: DEFAULT_LIST_POLL_INTERVAL_MS,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_HEALTH_INTERVAL_MS,
            stop_timeout_ms: DEFAULT_HEALTH_STOP_TIMEOUT_MS,
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            timestamp_log_limit: DEFAULT_TIMESTAMP_LOG_LIMIT,
            plausible_window_days: DEFAULT_PLAUSIBLE_WINDOW_DAYS,
            fallback_battery_percent: DEFAULT_FALLBACK_BATTERY_PERCENT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }
}

impl TimeoutConfig {
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }

    /// Poll interval, never zero so polling loops always yield.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    #[must_use]
    pub fn teardown_settle(&self) -> Duration {
        Duration::from_millis(self.teardown_settle_ms)
    }

    #[must_use]
    pub fn transmission_settle(&self) -> Duration {
        Duration::from_millis(self.transmission_settle_ms)
    }

    /// Device-list poll interval, never zero.
    #[must_use]
    pub fn list_poll_interval(&self) -> Duration {
        Duration::from_millis(self.list_poll_interval_ms.max(1))
    }
}

impl HealthConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    #[must_use]
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

impl TelemetryConfig {
    #[must_use]
    pub fn plausible_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.plausible_window_days))
    }
}

// ─── SessionConfig impl ────────────────────────────────────────────────

impl SessionConfig {
    /// Load config from a TOML file, with environment variable overrides.
    ///
    /// # Errors
    /// Returns [`SessionError::ConfigError`] when the file can't be read,
    /// isn't valid TOML, or an override variable holds an invalid value.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> SessionResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| SessionError::ConfigError {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `MUSE_SESSION_CONFIG` environment variable
    /// 3. `./muse-session.toml`
    /// 4. `~/.config/muse-session/muse-session.toml`
    ///
    /// Falls back to defaults (plus environment overrides) if no file is found.
    ///
    /// # Errors
    /// Returns [`SessionError::ConfigError`] if a discovered file is invalid.
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&Path>) -> SessionResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var("MUSE_SESSION_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from("muse-session.toml");
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(config_path) = dirs_config_path() {
            if config_path.exists() {
                return Self::from_file(&config_path);
            }
        }

        Self::from_env()
    }

    /// Defaults with environment variable overrides applied.
    ///
    /// # Errors
    /// Returns [`SessionError::ConfigError`] if an override can't be parsed.
    pub fn from_env() -> SessionResult<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> SessionResult<()> {
        if let Some(ms) = env_parse::<u64>("MUSE_SESSION_CONNECT_TIMEOUT_MS")? {
            self.timeouts.connect_timeout_ms = ms;
        }
        if let Some(attempts) = env_parse::<u32>("MUSE_SESSION_RECONNECT_MAX_ATTEMPTS")? {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = env_parse::<u64>("MUSE_SESSION_HEALTH_INTERVAL_MS")? {
            self.health.interval_ms = ms;
        }
        if let Ok(preset) = std::env::var("MUSE_SESSION_PRESET") {
            self.preset = preset.parse()?;
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

/// `now + timeout`, saturating at a far-future deadline for timeouts too
/// large to represent.
pub(crate) fn deadline_after(timeout: Duration) -> tokio::time::Instant {
    let now = tokio::time::Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> SessionResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SessionError::ConfigError {
                reason: format!("{key}='{raw}': {e}"),
            }),
        Err(_) => Ok(None),
    }
}

/// Platform-appropriate config file path.
#[cfg(feature = "config-toml")]
fn dirs_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("muse-session").join("muse-session.toml"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("muse-session")
                .join("muse-session.toml")
        })
    }
}
