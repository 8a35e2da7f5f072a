//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/hashrelay/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/hashrelay/` (~/.config/hashrelay/)
//! - Data: `$XDG_DATA_HOME/hashrelay/` (~/.local/share/hashrelay/)
//! - State/Logs: `$XDG_STATE_HOME/hashrelay/` (~/.local/state/hashrelay/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

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
    /// Background sender and collector configuration
    #[serde(default)]
    pub sender: SenderConfig,

    /// Local queue configuration
    #[serde(default)]
    pub queue: QueueConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Collector delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SenderConfig {
    /// Enable/disable the background sender
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Seconds between scheduler cycles, also the backoff after a busy or failed send
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// HTTP request timeout in seconds
    #[serde(default = "default_network_timeout")]
    pub network_timeout_secs: u64,

    /// Seconds to wait between report attempts within one send
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Report attempts per send
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Treat an unparsable body on HTTP 200 as an acknowledgment
    #[serde(default = "default_optimistic_success")]
    pub optimistic_success: bool,

    /// URL of a plain-text document whose first line is the collector base URL
    pub bootstrap_url: Option<String>,

    /// Collector base URL used until (or instead of) bootstrap resolution
    pub server_url: Option<String>,

    /// Path of the availability probe, relative to the base URL
    #[serde(default = "default_check_path")]
    pub check_path: String,

    /// Path of the report endpoint, relative to the base URL
    #[serde(default = "default_report_path")]
    pub report_path: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            poll_interval_secs: default_poll_interval(),
            network_timeout_secs: default_network_timeout(),
            retry_delay_secs: default_retry_delay(),
            max_attempts: default_max_attempts(),
            optimistic_success: default_optimistic_success(),
            bootstrap_url: None,
            server_url: None,
            check_path: default_check_path(),
            report_path: default_report_path(),
        }
    }
}

impl SenderConfig {
    /// Check if there is any way to find a collector
    pub fn is_ready(&self) -> bool {
        self.bootstrap_url.is_some() || self.server_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(Error::Config(
                "sender.poll_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.network_timeout_secs == 0 {
            return Err(Error::Config(
                "sender.network_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config(
                "sender.max_attempts must be at least 1".to_string(),
            ));
        }
        for (key, value) in [
            ("sender.bootstrap_url", &self.bootstrap_url),
            ("sender.server_url", &self.server_url),
        ] {
            if let Some(url) = value {
                if !is_http_url(url) {
                    return Err(Error::Config(format!(
                        "{} must start with http:// or https://, got {:?}",
                        key, url
                    )));
                }
            }
        }
        for (key, path) in [
            ("sender.check_path", &self.check_path),
            ("sender.report_path", &self.report_path),
        ] {
            if !path.starts_with('/') {
                return Err(Error::Config(format!("{} must start with '/'", key)));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

pub(crate) fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

fn default_enabled() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_network_timeout() -> u64 {
    15
}

fn default_retry_delay() -> u64 {
    1
}

fn default_max_attempts() -> u32 {
    3
}

fn default_optimistic_success() -> bool {
    true
}

fn default_check_path() -> String {
    "/check".to_string()
}

fn default_report_path() -> String {
    "/report".to_string()
}

/// Local queue configuration
#[derive(Debug, Deserialize, Default, Clone)]
pub struct QueueConfig {
    /// Override for the pending-record file
    pub path: Option<PathBuf>,
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

        config.sender.validate()?;
        Ok(config)
    }

    /// Path of the pending-record queue, honoring `[queue] path`
    pub fn queue_path(&self) -> PathBuf {
        self.queue
            .path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("pending.json"))
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/hashrelay/config.toml` (~/.config/hashrelay/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("hashrelay").join("config.toml")
    }

    /// Returns the data directory path (for the queue file)
    ///
    /// `$XDG_DATA_HOME/hashrelay/` (~/.local/share/hashrelay/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("hashrelay")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/hashrelay/` (~/.local/state/hashrelay/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("hashrelay")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.sender.enabled);
        assert_eq!(config.sender.poll_interval_secs, 30);
        assert_eq!(config.sender.network_timeout_secs, 15);
        assert_eq!(config.sender.retry_delay_secs, 1);
        assert_eq!(config.sender.max_attempts, 3);
        assert!(config.sender.optimistic_success);
        assert_eq!(config.sender.check_path, "/check");
        assert_eq!(config.sender.report_path, "/report");
        assert!(!config.sender.is_ready());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[sender]
enabled = false
poll_interval_secs = 60
network_timeout_secs = 5
bootstrap_url = "https://example.com/server_address.txt"

[queue]
path = "/tmp/hashrelay/pending.json"

[logging]
level = "debug"
"#;
        let config: Config = toml::from_str(toml).unwrap();

        assert!(!config.sender.enabled);
        assert_eq!(config.sender.poll_interval(), Duration::from_secs(60));
        assert_eq!(config.sender.network_timeout(), Duration::from_secs(5));
        assert_eq!(config.sender.retry_delay(), Duration::from_secs(1));
        assert!(config.sender.is_ready());
        assert_eq!(
            config.queue_path(),
            PathBuf::from("/tmp/hashrelay/pending.json")
        );
        assert_eq!(config.logging.level, "debug");
        assert!(config.sender.validate().is_ok());
    }

    #[test]
    fn test_sender_config_validation() {
        assert!(SenderConfig::default().validate().is_ok());

        let config = SenderConfig {
            poll_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SenderConfig {
            max_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SenderConfig {
            server_url: Some("collector.example.com".to_string()),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SenderConfig {
            report_path: "report".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_rejects_invalid_sender() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[sender]\nnetwork_timeout_secs = 0\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("network_timeout_secs"));
    }
}
