//! Configuration module for the proxy.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the proxy
#[derive(Parser, Debug)]
#[command(name = "relay-a-cache")]
#[command(author = "relay-a-cache authors")]
#[command(version = "0.1.0")]
#[command(about = "A memcached-aware TCP proxy with failover", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Front listener port (e.g. 30001)
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Upstream server address (e.g. 127.0.0.1:11211)
    #[arg(short = 't', long)]
    pub target: Option<String>,

    /// Backup upstream server address for failover
    #[arg(short = 'b', long)]
    pub backup: Option<String>,

    /// Number of worker threads
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Event backend hint. mio picks epoll/kqueue for the platform; the knob
/// is accepted for configuration compatibility and reported at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventModel {
    Auto,
    Select,
    Epoll,
    Kqueue,
}

impl EventModel {
    pub fn name(&self) -> &'static str {
        match self {
            EventModel::Auto => "auto",
            EventModel::Select => "select",
            EventModel::Epoll => "epoll",
            EventModel::Kqueue => "kqueue",
        }
    }
}

/// Slow-query record format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlowLogFormat {
    Plain,
    Json,
    Ltsv,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub stat: StatConfig,
    #[serde(default)]
    pub slow_query: SlowQueryConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy listener and capacity configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Environment name used in log output
    pub name: String,
    /// Front TCP port; ignored when `sockpath` is set
    pub port: u16,
    /// Unix-domain listener path ("" = TCP)
    pub sockpath: String,
    /// File mode for the Unix socket, octal string
    pub access_mask: String,
    /// Upstream server address
    pub target_server: String,
    /// Backup upstream for failover ("" = no failover)
    pub backup_server: String,
    pub worker_max: usize,
    pub conn_max: usize,
    pub connpool_max: usize,
    /// Reserved knob kept for config compatibility
    pub connpool_use_max: usize,
    pub client_pool_max: usize,
    /// Per-session readiness bound (0 = unbounded)
    pub loop_max: u64,
    pub event_model: EventModel,
    pub request_bufsize: usize,
    pub response_bufsize: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            port: default_port(),
            sockpath: String::new(),
            access_mask: default_access_mask(),
            target_server: default_target_server(),
            backup_server: String::new(),
            worker_max: default_worker_max(),
            conn_max: default_conn_max(),
            connpool_max: default_connpool_max(),
            connpool_use_max: 0,
            client_pool_max: default_client_pool_max(),
            loop_max: 0,
            event_model: EventModel::Auto,
            request_bufsize: default_bufsize(),
            response_bufsize: default_bufsize(),
        }
    }
}

/// Stats surface configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatConfig {
    pub port: u16,
    pub sockpath: String,
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            port: default_stat_port(),
            sockpath: String::new(),
        }
    }
}

/// Slow-query log configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SlowQueryConfig {
    /// Threshold in seconds (0 = disabled)
    pub sec: f64,
    pub log_path: String,
    pub log_format: SlowLogFormat,
    /// File mode for the log file, octal string
    pub log_access_mask: String,
}

impl Default for SlowQueryConfig {
    fn default() -> Self {
        Self {
            sec: 0.0,
            log_path: String::new(),
            log_format: SlowLogFormat::Json,
            log_access_mask: default_log_access_mask(),
        }
    }
}

/// Health-check configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe transaction repetitions per tick
    pub try_max: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            try_max: default_try_max(),
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

fn default_port() -> u16 {
    30001
}

fn default_stat_port() -> u16 {
    30011
}

fn default_target_server() -> String {
    "127.0.0.1:11211".to_string()
}

fn default_worker_max() -> usize {
    4
}

fn default_conn_max() -> usize {
    1000
}

fn default_connpool_max() -> usize {
    20
}

fn default_client_pool_max() -> usize {
    20
}

fn default_bufsize() -> usize {
    1024
}

fn default_try_max() -> u32 {
    3
}

fn default_access_mask() -> String {
    "0660".to_string()
}

fn default_log_access_mask() -> String {
    "0644".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub port: u16,
    pub sockpath: String,
    pub access_mask: u32,
    pub target_server: String,
    pub backup_server: String,
    pub stat_port: u16,
    pub stat_sockpath: String,
    pub worker_max: usize,
    pub conn_max: usize,
    pub connpool_max: usize,
    pub connpool_use_max: usize,
    pub client_pool_max: usize,
    pub loop_max: u64,
    pub event_model: EventModel,
    pub request_bufsize: usize,
    pub response_bufsize: usize,
    pub slow_query_sec: f64,
    pub slow_query_log_path: String,
    pub slow_query_log_format: SlowLogFormat,
    pub slow_query_log_access_mask: u32,
    pub health_check_try_max: u32,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_parts(TomlConfig::default(), None, None, None, None, None)
    }
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

        let log_level = if cli.log_level != "info" {
            Some(cli.log_level)
        } else {
            None
        };

        Ok(Config::from_parts(
            toml_config,
            cli.port,
            cli.target,
            cli.backup,
            cli.workers,
            log_level,
        ))
    }

    fn from_parts(
        toml: TomlConfig,
        port: Option<u16>,
        target: Option<String>,
        backup: Option<String>,
        workers: Option<usize>,
        log_level: Option<String>,
    ) -> Self {
        Config {
            name: toml.proxy.name,
            port: port.unwrap_or(toml.proxy.port),
            sockpath: toml.proxy.sockpath,
            access_mask: parse_mask(&toml.proxy.access_mask, 0o660),
            target_server: target.unwrap_or(toml.proxy.target_server),
            backup_server: backup.unwrap_or(toml.proxy.backup_server),
            stat_port: toml.stat.port,
            stat_sockpath: toml.stat.sockpath,
            worker_max: workers.unwrap_or(toml.proxy.worker_max).max(1),
            conn_max: toml.proxy.conn_max,
            connpool_max: toml.proxy.connpool_max,
            connpool_use_max: toml.proxy.connpool_use_max,
            client_pool_max: toml.proxy.client_pool_max,
            loop_max: toml.proxy.loop_max,
            event_model: toml.proxy.event_model,
            request_bufsize: toml.proxy.request_bufsize.max(2),
            response_bufsize: toml.proxy.response_bufsize.max(2),
            slow_query_sec: toml.slow_query.sec,
            slow_query_log_path: toml.slow_query.log_path,
            slow_query_log_format: toml.slow_query.log_format,
            slow_query_log_access_mask: parse_mask(&toml.slow_query.log_access_mask, 0o644),
            health_check_try_max: toml.health_check.try_max,
            log_level: log_level.unwrap_or(toml.logging.level),
        }
    }
}

fn parse_mask(mask: &str, fallback: u32) -> u32 {
    u32::from_str_radix(mask.trim_start_matches("0o"), 8).unwrap_or(fallback)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
