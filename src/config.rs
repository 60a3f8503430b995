//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::server::DEFAULT_BROADCAST_PREFIX;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// WebSocket server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_max_events")]
    pub max_events: usize,

    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,

    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_max_reads_per_pass")]
    pub max_reads_per_pass: usize,

    #[serde(default = "default_broadcast_prefix")]
    pub broadcast_prefix: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workers() -> usize {
    4
}

fn default_max_events() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    4096
}

fn default_max_handshake_size() -> usize {
    4096
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024 // 16 MB
}

fn default_max_reads_per_pass() -> usize {
    16
}

fn default_broadcast_prefix() -> String {
    DEFAULT_BROADCAST_PREFIX.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: default_workers(),
            max_events: default_max_events(),
            read_buffer_size: default_read_buffer_size(),
            max_handshake_size: default_max_handshake_size(),
            max_frame_size: default_max_frame_size(),
            max_reads_per_pass: default_max_reads_per_pass(),
            broadcast_prefix: default_broadcast_prefix(),
        }
    }
}

impl ServerConfig {
    /// `host:port` string the listener binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    ///
    /// Nothing is logged here since this runs before logging is configured;
    /// the caller reports the returned [`ConfigLoad`].
    pub fn load_default() -> ConfigLoad {
        let config_paths: Vec<PathBuf> = [
            dirs::config_dir().map(|p| p.join("herald").join("config.toml")),
            Some(PathBuf::from("/etc/herald/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
        .into_iter()
        .flatten()
        .collect();

        Self::load_first(&config_paths)
    }

    /// Load the first existing file in `paths` that parses
    ///
    /// Files that exist but fail to load are recorded and skipped. Falls
    /// back to defaults with environment overrides.
    pub fn load_first(paths: &[PathBuf]) -> ConfigLoad {
        let mut rejected = Vec::new();

        for path in paths.iter().filter(|path| path.exists()) {
            match Self::load_with_env(path) {
                Ok(config) => {
                    return ConfigLoad {
                        config,
                        source: Some(path.clone()),
                        rejected,
                    }
                }
                Err(e) => rejected.push(e),
            }
        }

        ConfigLoad {
            config: Self::from_env(),
            source: None,
            rejected,
        }
    }

    /// Check values the server cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.workers == 0 {
            return Err(ConfigError::Invalid("server.workers must be at least 1".into()));
        }
        if self.server.max_events == 0 {
            return Err(ConfigError::Invalid("server.max_events must be at least 1".into()));
        }
        if self.server.read_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "server.read_buffer_size must be at least 1".into(),
            ));
        }
        if self.server.max_reads_per_pass == 0 {
            return Err(ConfigError::Invalid(
                "server.max_reads_per_pass must be at least 1".into(),
            ));
        }
        if self.server.max_handshake_size < 64 {
            return Err(ConfigError::Invalid(
                "server.max_handshake_size must be at least 64 bytes".into(),
            ));
        }
        if !matches!(self.logging.format.as_str(), "pretty" | "json") {
            return Err(ConfigError::Invalid(format!(
                "logging.format must be 'pretty' or 'json', got '{}'",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(host) = std::env::var("HERALD_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("HERALD_PORT") {
            if let Ok(p) = port.parse() {
                self.server.port = p;
            }
        }
        if let Ok(workers) = std::env::var("HERALD_WORKERS") {
            if let Ok(w) = workers.parse() {
                self.server.workers = w;
            }
        }

        // Logging overrides
        if let Ok(level) = std::env::var("HERALD_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("HERALD_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Result of searching the default config locations
#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    /// File the config came from; `None` means defaults plus environment
    pub source: Option<PathBuf>,
    /// Files that existed but could not be loaded
    pub rejected: Vec<ConfigError>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Herald Configuration
#
# Environment variables override these settings:
# - HERALD_HOST
# - HERALD_PORT
# - HERALD_WORKERS
# - HERALD_LOG_LEVEL
# - HERALD_LOG_FORMAT

[server]
# Address to listen on
host = "0.0.0.0"

# TCP port
port = 8080

# Number of worker threads servicing client messages
workers = 4

# Readiness events handled per poll
max_events = 1024

# Bytes read from a socket per read call
read_buffer_size = 4096

# Largest accepted handshake request (bytes)
max_handshake_size = 4096

# Largest accepted frame payload (bytes)
max_frame_size = 16777216

# Socket reads per connection before a worker moves on to the next one
max_reads_per_pass = 16

# Text prepended to every rebroadcast message
broadcast_prefix = "Broadcast: "

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
