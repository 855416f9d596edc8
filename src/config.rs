//! Configuration loading for FleetMQ.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Default dispatcher poll interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

/// Default drain budget on shutdown in seconds.
pub const DEFAULT_DRAIN_TIMEOUT_SECS: u64 = 30;

/// Default delay between reconnection attempts in seconds.
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;

/// Default exchange name for fleet traffic.
pub const DEFAULT_EXCHANGE: &str = "fleet";

/// Get the FleetMQ home directory (~/.fleetmq).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".fleetmq"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Broker and consumer settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    /// Dispatcher poll interval in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Bounded wait for queues to drain on shutdown, in seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Fixed delay between reconnect attempts, in seconds.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Maximum unacknowledged deliveries in flight per consumer.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Exchange name used for fleet traffic.
    #[serde(default = "default_exchange")]
    pub exchange: String,
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_drain_timeout_secs() -> u64 {
    DEFAULT_DRAIN_TIMEOUT_SECS
}

fn default_reconnect_delay_secs() -> u64 {
    DEFAULT_RECONNECT_DELAY_SECS
}

fn default_prefetch_count() -> u16 {
    1
}

fn default_exchange() -> String {
    DEFAULT_EXCHANGE.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            drain_timeout_secs: DEFAULT_DRAIN_TIMEOUT_SECS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            prefetch_count: 1,
            exchange: DEFAULT_EXCHANGE.to_string(),
        }
    }
}

impl Settings {
    /// Poll interval as a Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Drain budget as a Duration.
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Reconnect delay as a Duration.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Load settings from ~/.fleetmq/settings.json, falling back to defaults
/// when the file does not exist.
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;
    load_settings_from(&path)
}

/// Load settings from an explicit path.
pub fn load_settings_from(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!("No settings file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&content)?;

    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.poll_interval_ms == 0 {
        return Err(Error::Config(
            "poll_interval_ms must be greater than zero".to_string(),
        ));
    }
    if settings.prefetch_count == 0 {
        return Err(Error::Config(
            "prefetch_count must be greater than zero".to_string(),
        ));
    }
    if settings.exchange.is_empty() {
        return Err(Error::Config("exchange must not be empty".to_string()));
    }
    Ok(())
}
