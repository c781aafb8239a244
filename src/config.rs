//! Configuration module for the echo-relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line arguments for the relay server
#[derive(Parser, Debug)]
#[command(name = "echo-relay")]
#[command(author = "echo-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "Echoes TCP chunks back to clients and relays them downstream", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to accept client connections on (e.g., 0.0.0.0:1200)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Destination every received chunk is relayed to (e.g., 127.0.0.1:1201)
    #[arg(short = 'f', long)]
    pub forward: Option<String>,

    /// Maximum number of chunks waiting to be relayed
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Maximum bytes read from a client in one read
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Seconds between throughput reports
    #[arg(long)]
    pub report_interval: Option<u64>,

    /// Seconds between connection attempts to the destination
    #[arg(long)]
    pub retry_interval: Option<u64>,

    /// Maximum number of concurrent client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub receive: ReceiveConfig,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    pub listen: Option<String>,
    /// Maximum concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: None,
            max_connections: default_max_connections(),
            workers: None,
        }
    }
}

/// Per-connection read configuration
#[derive(Debug, Deserialize)]
pub struct ReceiveConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
        }
    }
}

/// Downstream relay configuration
#[derive(Debug, Deserialize)]
pub struct ForwardConfig {
    /// Destination address
    pub destination: Option<String>,
    /// Relay queue capacity in chunks
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Seconds to wait between connection attempts
    #[serde(default = "default_retry_interval")]
    pub retry_interval: u64,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            destination: None,
            queue_capacity: default_queue_capacity(),
            retry_interval: default_retry_interval(),
        }
    }
}

/// Throughput report configuration
#[derive(Debug, Deserialize)]
pub struct ReportConfig {
    /// Seconds between reports
    #[serde(default = "default_report_interval")]
    pub interval: u64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            interval: default_report_interval(),
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

fn default_max_connections() -> usize {
    10_000
}

fn default_chunk_size() -> usize {
    512
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_retry_interval() -> u64 {
    3
}

fn default_report_interval() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub forward: String,
    pub queue_capacity: usize,
    pub chunk_size: usize,
    pub report_interval: Duration,
    pub retry_interval: Duration,
    pub max_connections: usize,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Resolve already-parsed CLI args against the TOML file they point at.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
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

    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli
            .listen
            .or(toml_config.server.listen)
            .map(|addr| with_default_host(addr, "0.0.0.0"))
            .ok_or(ConfigError::MissingAddress("listen"))?;
        let forward = cli
            .forward
            .or(toml_config.forward.destination)
            .map(|addr| with_default_host(addr, "127.0.0.1"))
            .ok_or(ConfigError::MissingAddress("forward"))?;

        let config = Config {
            listen,
            forward,
            queue_capacity: cli
                .queue_capacity
                .unwrap_or(toml_config.forward.queue_capacity),
            chunk_size: cli.chunk_size.unwrap_or(toml_config.receive.chunk_size),
            report_interval: Duration::from_secs(
                cli.report_interval.unwrap_or(toml_config.report.interval),
            ),
            retry_interval: Duration::from_secs(
                cli.retry_interval
                    .unwrap_or(toml_config.forward.retry_interval),
            ),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            workers: cli.workers.or(toml_config.server.workers),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen.trim().is_empty() {
            return Err(ConfigError::MissingAddress("listen"));
        }
        if self.forward.trim().is_empty() {
            return Err(ConfigError::MissingAddress("forward"));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity", "must be at least 1"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections", "must be at least 1"));
        }
        if self.report_interval.is_zero() {
            return Err(ConfigError::Invalid("report_interval", "must be non-zero"));
        }
        if self.retry_interval.is_zero() {
            return Err(ConfigError::Invalid("retry_interval", "must be non-zero"));
        }
        if self.workers == Some(0) {
            return Err(ConfigError::Invalid("workers", "must be at least 1"));
        }
        Ok(())
    }

    /// Capacity of each report stream, sized to the concurrency level.
    pub fn report_capacity(&self) -> usize {
        self.max_connections
    }
}

/// Expand a bare `:port` into `host:port`.
fn with_default_host(addr: String, host: &str) -> String {
    if addr.starts_with(':') {
        format!("{host}{addr}")
    } else {
        addr
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    MissingAddress(&'static str),
    Invalid(&'static str, &'static str),
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
            ConfigError::MissingAddress(which) => {
                write!(f, "Missing required {which} address")
            }
            ConfigError::Invalid(field, reason) => {
                write!(f, "Invalid value for {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
