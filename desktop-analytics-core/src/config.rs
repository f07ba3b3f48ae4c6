//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/desktop-analytics/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/desktop-analytics/` (~/.config/desktop-analytics/)
//! - Settings: `$XDG_DATA_HOME/` (~/.local/share/), one folder per vendor
//! - State/Logs: `$XDG_STATE_HOME/desktop-analytics/` (~/.local/state/desktop-analytics/)

use crate::client::BackendKind;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_DIR: &str = "desktop-analytics";

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Analytics session configuration
    #[serde(default)]
    pub analytics: AnalyticsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Analytics session configuration
///
/// Everything a host needs to decide which backend is used, how it batches,
/// and how long shutdown may wait for in-flight events.
#[derive(Debug, Deserialize, Clone)]
pub struct AnalyticsConfig {
    /// Write key / project token for the remote service
    #[serde(default)]
    pub api_secret: Option<String>,

    /// Which backend delivers events
    #[serde(default)]
    pub backend: BackendKind,

    /// Override of the backend's API host (batching backend only)
    #[serde(default)]
    pub host: Option<String>,

    /// Queue length that triggers a flush (batching backend)
    #[serde(default)]
    pub batch_size: Option<usize>,

    /// Max seconds before flushing an incomplete batch (batching backend)
    #[serde(default)]
    pub flush_interval_secs: Option<u64>,

    /// If false, the session never talks to the backend
    #[serde(default = "default_true")]
    pub allow_tracking: bool,

    /// If false, identity traits are sanitized before leaving the process
    #[serde(default)]
    pub retain_pii: bool,

    /// HTTP request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Max retry attempts for transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Service returning geolocation JSON (city, country, region...)
    #[serde(default = "default_geolocation_url")]
    pub geolocation_url: Option<String>,

    /// Service returning the bare external IP address; takes precedence over
    /// `geolocation_url` when set
    #[serde(default)]
    pub external_ip_url: Option<String>,

    /// Upper bound on how long shutdown waits for outstanding events
    #[serde(default = "default_shutdown_max_wait")]
    pub shutdown_max_wait_ms: u64,

    /// Sleep between statistics polls during shutdown
    #[serde(default = "default_shutdown_poll_interval")]
    pub shutdown_poll_interval_ms: u64,

    /// Vendor folder that groups sibling installations
    #[serde(default)]
    pub vendor: Option<String>,

    /// Product name (defaults to the executable name)
    #[serde(default)]
    pub product: Option<String>,

    /// Properties sent with every event
    #[serde(default)]
    pub default_properties: BTreeMap<String, String>,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            api_secret: None,
            backend: BackendKind::default(),
            host: None,
            batch_size: None,
            flush_interval_secs: None,
            allow_tracking: true,
            retain_pii: false,
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            geolocation_url: default_geolocation_url(),
            external_ip_url: None,
            shutdown_max_wait_ms: default_shutdown_max_wait(),
            shutdown_poll_interval_ms: default_shutdown_poll_interval(),
            vendor: None,
            product: None,
            default_properties: BTreeMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    5
}

fn default_max_retries() -> usize {
    3
}

fn default_geolocation_url() -> Option<String> {
    Some("http://ip-api.com/json/".to_string())
}

fn default_shutdown_max_wait() -> u64 {
    7500
}

fn default_shutdown_poll_interval() -> u64 {
    500
}

impl AnalyticsConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            return Err(Error::Config(
                "analytics.batch_size must be at least 1".to_string(),
            ));
        }
        if self.flush_interval_secs == Some(0) {
            return Err(Error::Config(
                "analytics.flush_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.shutdown_poll_interval_ms == 0 {
            return Err(Error::Config(
                "analytics.shutdown_poll_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the configured flush interval
    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_secs.map(Duration::from_secs)
    }

    /// Get the configured request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Longest time shutdown may spend draining outstanding events
    pub fn shutdown_max_wait(&self) -> Duration {
        Duration::from_millis(self.shutdown_max_wait_ms)
    }

    /// Sleep between statistics polls while draining
    pub fn shutdown_poll_interval(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_interval_ms)
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.analytics.validate()?;
        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/desktop-analytics/config.toml`
    pub fn config_path() -> PathBuf {
        xdg_config_home().join(APP_DIR).join("config.toml")
    }

    /// Returns the root under which per-vendor settings folders live
    ///
    /// `$XDG_DATA_HOME/` (~/.local/share/)
    pub fn settings_root() -> PathBuf {
        xdg_data_home()
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/desktop-analytics/`
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join(APP_DIR)
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/desktop-analytics/desktop-analytics.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("desktop-analytics.log")
    }
}
