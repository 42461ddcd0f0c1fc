//! Server configuration.
//!
//! Configuration is layered:
//! - Built-in defaults
//! - A TOML file (`HERALD_CONFIG`, or the first of the default paths found)
//! - Environment variables (`HERALD__*`, e.g. `HERALD__PORT=6001` or
//!   `HERALD__REPLICATION__MODE=redis`)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tenvis_herald_core::App;

/// Paths searched when `HERALD_CONFIG` is not set.
const CONFIG_PATHS: [&str; 3] = [
    "herald.toml",
    "/etc/herald/herald.toml",
    "~/.config/herald/herald.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Endpoint configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Cross-process replication.
    #[serde(default)]
    pub replication: ReplicationSettings,

    /// Statistics collection.
    #[serde(default)]
    pub statistics: StatisticsConfig,

    /// Registered applications.
    #[serde(default)]
    pub apps: Vec<App>,
}

/// Endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path prefix of the WebSocket endpoint. Clients connect to
    /// `{websocket_path}/{app_key}`.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Serve the REST API.
    #[serde(default = "default_true")]
    pub rest_api: bool,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of channels per process.
    #[serde(default = "default_max_channels")]
    pub max_channels: usize,

    /// Maximum subscriptions per connection.
    #[serde(default = "default_max_subscriptions")]
    pub max_subscriptions_per_connection: usize,

    /// Maximum client frame size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds of inactivity after which clients should ping.
    #[serde(default = "default_activity_timeout")]
    pub activity_timeout_secs: u64,

    /// Connections silent for longer than this are closed.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,

    /// How often silent connections are looked for.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

/// Which channel manager to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Single process, in memory.
    #[default]
    Local,
    /// Replicated over Redis pub/sub.
    Redis,
}

/// Replication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub mode: ReplicationMode,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix of every bus topic. Processes sharing a prefix form a cluster.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// How long aggregate reads wait for peers, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

/// Statistics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between flushes.
    #[serde(default = "default_statistics_interval")]
    pub interval_secs: u64,

    /// Days records are kept.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,

    /// Records kept in memory.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6001
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/app".to_string()
}

fn default_max_channels() -> usize {
    100_000
}

fn default_max_subscriptions() -> usize {
    100
}

fn default_max_message_size() -> usize {
    10 * 1024 // 10 KB, the Pusher limit
}

fn default_activity_timeout() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    120
}

fn default_sweep_interval() -> u64 {
    10
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_prefix() -> String {
    "herald".to_string()
}

fn default_request_timeout() -> u64 {
    3_000
}

fn default_statistics_interval() -> u64 {
    60
}

fn default_retention_days() -> u64 {
    60
}

fn default_max_records() -> usize {
    100_000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            metrics: MetricsConfig::default(),
            replication: ReplicationSettings::default(),
            statistics: StatisticsConfig::default(),
            apps: Vec::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            rest_api: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            max_subscriptions_per_connection: default_max_subscriptions(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            activity_timeout_secs: default_activity_timeout(),
            timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            mode: ReplicationMode::Local,
            redis_url: default_redis_url(),
            prefix: default_prefix(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl Default for StatisticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_statistics_interval(),
            retention_days: default_retention_days(),
            max_records: default_max_records(),
        }
    }
}

impl HeartbeatConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl ReplicationSettings {
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl StatisticsConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_days * 24 * 60 * 60)
    }
}

impl Config {
    /// Load configuration from the first file found, with environment
    /// overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = match std::env::var("HERALD_CONFIG") {
            Ok(path) => Some(PathBuf::from(shellexpand::tilde(&path).as_ref())),
            Err(_) => CONFIG_PATHS
                .iter()
                .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
                .find(|path| path.exists()),
        };

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            tracing::info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path.as_path()).format(::config::FileFormat::Toml));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix("HERALD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file, without overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form an address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}:{}", self.host, self.port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 6001);
        assert_eq!(config.transport.websocket_path, "/app");
        assert_eq!(config.replication.mode, ReplicationMode::Local);
        assert_eq!(config.replication.request_timeout(), Duration::from_secs(3));
        assert!(config.apps.is_empty());
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 6001);

        let invalid = Config {
            host: "not a host".into(),
            ..Config::default()
        };
        assert!(invalid.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [replication]
            mode = "redis"
            redis_url = "redis://cache:6379"

            [heartbeat]
            timeout_secs = 60

            [[apps]]
            id = "1234"
            key = "TestKey"
            secret = "TestSecret"
            capacity = 100
            enable_client_messages = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.replication.mode, ReplicationMode::Redis);
        assert_eq!(config.replication.prefix, "herald");
        assert_eq!(config.heartbeat.timeout(), Duration::from_secs(60));
        assert_eq!(config.heartbeat.activity_timeout_secs, 30);
        assert_eq!(config.apps.len(), 1);
        assert_eq!(config.apps[0].capacity, Some(100));
        assert!(config.apps[0].enable_client_messages);
        assert!(config.apps[0].enable_statistics);
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("herald-test-{}.toml", std::process::id()));
        std::fs::write(&path, "port = 7001\n[statistics]\nretention_days = 1\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.port, 7001);
        assert_eq!(config.statistics.retention(), Duration::from_secs(86_400));
        assert!(Config::from_file(&path).is_err());
    }
}
