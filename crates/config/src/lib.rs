//! Configuration loading, validation, and management for parley.
//!
//! Loads configuration from `./parley.toml` (or an explicit path) with
//! environment variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "parley.toml";

/// The root configuration structure.
///
/// Maps directly to `parley.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Defaults for the agent answering calls
    #[serde(default)]
    pub agent: AgentDefaults,

    /// Transport harness tuning
    #[serde(default)]
    pub harness: HarnessConfig,

    /// Log output
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    /// `host:port`, ready for a TCP bind.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Used when a call request carries no system prompt
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Greeting used when a call request carries no introduction.
    /// An empty string makes the agent wait for the caller to speak first.
    #[serde(default = "default_introduction")]
    pub introduction: String,

    /// Number of history events visible to reasoning
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Grace period after a transfer before the call is torn down
    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,
}

fn default_system_prompt() -> String {
    "You are a warm, helpful voice assistant. Keep every answer to one or two short sentences, \
     ask one question at a time, and never use emojis or abbreviations."
        .into()
}
fn default_introduction() -> String {
    "Hello! How can I help you today?".into()
}
fn default_max_context_length() -> usize {
    100
}
fn default_transfer_timeout_secs() -> u64 {
    30
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
            introduction: default_introduction(),
            max_context_length: default_max_context_length(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Pause before retrying a failed transport read
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,

    /// Consecutive read failures after which the call is shut down
    #[serde(default = "default_max_consecutive_read_errors")]
    pub max_consecutive_read_errors: u32,
}

fn default_read_retry_delay_ms() -> u64 {
    100
}
fn default_max_consecutive_read_errors() -> u32 {
    50
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            read_retry_delay_ms: default_read_retry_delay_ms(),
            max_consecutive_read_errors: default_max_consecutive_read_errors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `info` or `parley_agent=debug,info`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from `path`, or `./parley.toml` when `None`.
    ///
    /// Environment variables override the file:
    /// - `PORT`
    /// - `PARLEY_HOST`
    /// - `PARLEY_LOG`
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_path);
        let mut config = Self::read(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path, without env overrides.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Get the default configuration file path.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_FILE)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(port) = lookup("PORT") {
            self.server.port = port.trim().parse().map_err(|_| {
                ConfigError::ValidationError(format!("PORT must be a port number, got '{port}'"))
            })?;
        }

        if let Some(host) = lookup("PARLEY_HOST") {
            self.server.host = host;
        }

        if let Some(level) = lookup("PARLEY_LOG") {
            self.log.level = level;
        }

        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::ValidationError(
                "server.port must be non-zero".into(),
            ));
        }

        if self.agent.max_context_length == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_context_length must be at least 1".into(),
            ));
        }

        if self.harness.max_consecutive_read_errors == 0 {
            return Err(ConfigError::ValidationError(
                "harness.max_consecutive_read_errors must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for the `config` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
