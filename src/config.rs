//! Configuration module for the bertrpc server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the RPC server
#[derive(Parser, Debug)]
#[command(name = "bertrpc")]
#[command(author = "bertrpc authors")]
#[command(version = "0.1.0")]
#[command(about = "A BERT-RPC server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Number of async worker threads (defaults to number of CPU cores)
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Maximum threads running dispatched functions concurrently
    #[arg(long)]
    pub blocking_threads: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Listen backlog
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Largest accepted request payload in bytes
    #[arg(long)]
    pub max_frame_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stdout
    #[arg(long)]
    pub log_file: Option<PathBuf>,
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
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Number of async worker threads
    pub workers: Option<usize>,
    /// Blocking pool size for dispatched functions
    #[serde(default = "default_blocking_threads")]
    pub blocking_threads: usize,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Largest accepted request payload
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            workers: None,
            blocking_threads: default_blocking_threads(),
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path (stdout when absent)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_blocking_threads() -> usize {
    64
}

fn default_max_connections() -> usize {
    10000
}

fn default_backlog() -> i32 {
    1024
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub workers: Option<usize>,
    pub blocking_threads: usize,
    pub max_connections: usize,
    pub backlog: i32,
    pub max_frame_size: usize,
    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve configuration from already-parsed CLI args.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            workers: cli.workers.or(toml_config.server.workers),
            blocking_threads: cli
                .blocking_threads
                .unwrap_or(toml_config.server.blocking_threads),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_frame_size: cli
                .max_frame_size
                .unwrap_or(toml_config.server.max_frame_size),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_file: cli.log_file.or(toml_config.logging.file),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.blocking_threads == 0 {
            return Err(ConfigError::Invalid(
                "blocking_threads must be at least 1".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size cannot exceed {}",
                u32::MAX
            )));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
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
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
