//! Configuration module for the selector-echo server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "selector-echo")]
#[command(author = "selector-echo authors")]
#[command(version = "0.1.0")]
#[command(about = "A single-threaded readiness-based TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9001)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Maximum time in seconds to block waiting for readiness events
    #[arg(short = 't', long)]
    pub poll_timeout: Option<u64>,

    /// Prefix prepended to every echoed message
    #[arg(short = 'p', long)]
    pub prefix: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Poll timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,
    /// Prefix prepended to every echoed message
    #[serde(default = "default_response_prefix")]
    pub response_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            poll_timeout: default_poll_timeout(),
            response_prefix: default_response_prefix(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9001".to_string()
}

fn default_poll_timeout() -> u64 {
    30 // seconds
}

fn default_response_prefix() -> String {
    "响应:".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Poll timeout in seconds, always non-zero.
    pub poll_timeout: u64,
    pub response_prefix: String,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args over TOML config and validate the result.
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen: SocketAddr = listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let poll_timeout = cli.poll_timeout.unwrap_or(toml_config.server.poll_timeout);
        if poll_timeout == 0 {
            return Err(ConfigError::InvalidPollTimeout);
        }

        Ok(Config {
            listen,
            poll_timeout,
            response_prefix: cli.prefix.unwrap_or(toml_config.server.response_prefix),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }

    /// Poll timeout as a `Duration`.
    pub fn poll_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.poll_timeout)
    }
}

impl Default for Config {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9001)),
            poll_timeout: server.poll_timeout,
            response_prefix: server.response_prefix,
            log_level: default_log_level(),
        }
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    InvalidListen(String),
    InvalidPollTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::InvalidListen(addr) => {
                write!(f, "Invalid listen address '{}'", addr)
            }
            ConfigError::InvalidPollTimeout => {
                write!(f, "Poll timeout must be at least 1 second")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
