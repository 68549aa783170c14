//! Configuration loading and resolution
//!
//! Config file resolution priority:
//! 1. Command-line argument (highest priority)
//! 2. `SCRIBE_CONFIG` environment variable
//! 3. User config directory (`<config_dir>/scribe/config.toml`)
//! 4. Built-in defaults (fallback)
//!
//! `SCRIBE_API_URL` overrides `api_base_url` from whichever source won.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "SCRIBE_CONFIG";

/// Environment variable overriding the backend base URL
pub const API_URL_ENV_VAR: &str = "SCRIBE_API_URL";

/// Client configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Backend base URL; request paths are joined onto it
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Default hard timeout for a single HTTP call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub poll: PollSettings,

    #[serde(default)]
    pub reconcile: ReconcileSettings,

    #[serde(default)]
    pub channels: ChannelSettings,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Task poller retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    pub interval_ms: u64,
    pub max_attempts: u32,
    pub auth_retry_interval_ms: u64,
    pub auth_max_attempts: u32,
    /// Transient poll errors inside this many final attempts are surfaced
    pub transient_tail: u32,
}

/// Session reconciler timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    /// Delay before the authoritative re-fetch that follows a push insert
    pub insert_refetch_delay_ms: u64,
    /// Upper bound on the "re-processing in progress" flag
    pub reprocess_timeout_ms: u64,
}

/// Channel manager limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub handshake_timeout_ms: u64,
    /// More active channels than this for one owner is logged as misuse
    pub owner_channel_warn_threshold: usize,
}

fn default_api_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_api_base_url(),
            request_timeout_ms: default_request_timeout_ms(),
            logging: LoggingConfig::default(),
            poll: PollSettings::default(),
            reconcile: ReconcileSettings::default(),
            channels: ChannelSettings::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_ms: 3_000,
            max_attempts: 120,
            auth_retry_interval_ms: 1_000,
            auth_max_attempts: 5,
            transient_tail: 3,
        }
    }
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            insert_refetch_delay_ms: 1_000,
            reprocess_timeout_ms: 4_000,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 10_000,
            owner_channel_warn_threshold: 10,
        }
    }
}

impl TomlConfig {
    /// Parse and validate a TOML document
    pub fn parse(content: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Resolve configuration following the documented priority order
    pub fn resolve(cli_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(cli_path) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::load(&path)?
            }
            None => {
                debug!("No config file found, using built-in defaults");
                Self::default()
            }
        };

        if let Ok(url) = std::env::var(API_URL_ENV_VAR) {
            if !url.trim().is_empty() {
                info!("API base URL overridden by {}", API_URL_ENV_VAR);
                config.api_base_url = url;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the client spin or never poll
    pub fn validate(&self) -> Result<()> {
        if self.api_base_url.trim().is_empty() {
            return Err(Error::Config("api_base_url must not be empty".to_string()));
        }
        if self.request_timeout_ms == 0 {
            return Err(Error::Config("request_timeout_ms must be > 0".to_string()));
        }
        if self.poll.interval_ms == 0 || self.poll.max_attempts == 0 {
            return Err(Error::Config(
                "poll.interval_ms and poll.max_attempts must be > 0".to_string(),
            ));
        }
        if self.poll.auth_max_attempts == 0 {
            return Err(Error::Config("poll.auth_max_attempts must be > 0".to_string()));
        }
        if self.channels.handshake_timeout_ms == 0 {
            return Err(Error::Config(
                "channels.handshake_timeout_ms must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Find the config file to load, if any
fn resolve_config_path(cli_path: Option<&Path>) -> Option<PathBuf> {
    // Priority 1: Command-line argument (must exist if given; load() reports it)
    if let Some(path) = cli_path {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    dirs::config_dir()
        .map(|d| d.join("scribe").join("config.toml"))
        .filter(|p| p.exists())
}
