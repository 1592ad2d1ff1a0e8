//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER__SERVICE__REPLAY_WORKERS=4`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Rate limit engine configuration
    #[serde(default)]
    pub service: ServiceConfig,

    /// Replay circuit breaker configuration
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Origin counter store configuration
    #[serde(default)]
    pub origin: OriginConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limit engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Capacity of the replay queue; events beyond it are dropped
    #[serde(default = "default_replay_buffer")]
    pub replay_buffer: usize,

    /// Number of background replay workers
    #[serde(default = "default_replay_workers")]
    pub replay_workers: usize,

    /// Interval between eviction sweeps in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Extra time a window survives after it stops being the previous window
    #[serde(default = "default_eviction_grace")]
    pub eviction_grace_ms: u64,

    /// Upper bound for origin reads made while deciding
    #[serde(default = "default_origin_timeout")]
    pub origin_timeout_ms: u64,

    /// Origin keys expire after this many window durations
    #[serde(default = "default_origin_ttl_windows")]
    pub origin_ttl_windows: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            replay_buffer: default_replay_buffer(),
            replay_workers: default_replay_workers(),
            sweep_interval_ms: default_sweep_interval(),
            eviction_grace_ms: default_eviction_grace(),
            origin_timeout_ms: default_origin_timeout(),
            origin_ttl_windows: default_origin_ttl_windows(),
        }
    }
}

impl ServiceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn origin_timeout(&self) -> Duration {
        Duration::from_millis(self.origin_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.replay_buffer == 0 {
            return Err(GatekeeperError::Config("service.replay_buffer must be > 0".into()));
        }
        if self.replay_workers == 0 {
            return Err(GatekeeperError::Config("service.replay_workers must be > 0".into()));
        }
        if self.sweep_interval_ms == 0 {
            return Err(GatekeeperError::Config("service.sweep_interval_ms must be > 0".into()));
        }
        if self.origin_ttl_windows < 2 {
            return Err(GatekeeperError::Config(
                "service.origin_ttl_windows must be >= 2 so previous windows stay readable".into(),
            ));
        }
        Ok(())
    }
}

fn default_replay_buffer() -> usize {
    10_000
}

fn default_replay_workers() -> usize {
    8
}

fn default_sweep_interval() -> u64 {
    10_000
}

fn default_eviction_grace() -> u64 {
    60_000
}

fn default_origin_timeout() -> u64 {
    100
}

fn default_origin_ttl_windows() -> u32 {
    3
}

/// Circuit breaker configuration for replay writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,

    /// Time the breaker stays open before probing, in milliseconds
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_ms: u64,

    /// Concurrent probe calls allowed while half-open
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GatekeeperError::Config("breaker.failure_threshold must be > 0".into()));
        }
        if self.recovery_timeout_ms == 0 {
            return Err(GatekeeperError::Config("breaker.recovery_timeout_ms must be > 0".into()));
        }
        if self.half_open_max_calls == 0 {
            return Err(GatekeeperError::Config("breaker.half_open_max_calls must be > 0".into()));
        }
        Ok(())
    }
}

fn default_failure_threshold() -> usize {
    5
}

fn default_recovery_timeout() -> u64 {
    5_000
}

fn default_half_open_max_calls() -> usize {
    1
}

/// Which origin counter store backs this node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OriginConfig {
    /// Process-local counters; single node only
    #[default]
    Memory,

    /// Redis-backed counters shared by every node
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },

    /// Gossip mesh where every node publishes its own contribution
    Gossip {
        #[serde(default = "default_node_id")]
        node_id: String,
        #[serde(default = "default_gossip_addr")]
        listen_addr: SocketAddr,
        #[serde(default)]
        advertise_addr: Option<SocketAddr>,
        #[serde(default)]
        seed_nodes: Vec<String>,
        #[serde(default = "default_cluster_id")]
        cluster_id: String,
        #[serde(default = "default_gossip_interval")]
        gossip_interval_ms: u64,
    },
}

fn default_key_prefix() -> String {
    "gatekeeper".to_string()
}

fn default_node_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "gatekeeper".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file, with `GATEKEEPER__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(GatekeeperError::Config(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Yaml))
            .add_source(environment())
            .build()?;
        Self::finish(settings)
    }

    /// Load configuration from a YAML string, with `GATEKEEPER__*` environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .add_source(environment())
            .build()?;
        Self::finish(settings)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(environment()).build()?;
        Self::finish(settings)
    }

    /// Render the effective configuration.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| GatekeeperError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.service.validate()?;
        self.breaker.validate()
    }

    fn finish(settings: config::Config) -> Result<Self> {
        let config: GatekeeperConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.service.replay_workers, 8);
        assert_eq!(config.service.replay_buffer, 10_000);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert!(matches!(config.origin, OriginConfig::Memory));
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let yaml = r#"
service:
  replay_workers: 2
  sweep_interval_ms: 500
breaker:
  failure_threshold: 3
origin:
  kind: redis
  url: redis://127.0.0.1:6379
logging:
  format: json
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.service.replay_workers, 2);
        assert_eq!(config.service.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.service.replay_buffer, 10_000);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
        match config.origin {
            OriginConfig::Redis { url, key_prefix } => {
                assert_eq!(url, "redis://127.0.0.1:6379");
                assert_eq!(key_prefix, "gatekeeper");
            }
            other => panic!("unexpected origin {:?}", other),
        }
    }

    #[test]
    fn test_gossip_origin_defaults() {
        let yaml = r#"
origin:
  kind: gossip
  listen_addr: 127.0.0.1:7000
  seed_nodes: ["127.0.0.1:7001"]
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        match config.origin {
            OriginConfig::Gossip { listen_addr, seed_nodes, cluster_id, advertise_addr, .. } => {
                assert_eq!(listen_addr, SocketAddr::from(([127, 0, 0, 1], 7000)));
                assert_eq!(seed_nodes, vec!["127.0.0.1:7001".to_string()]);
                assert_eq!(cluster_id, "gatekeeper");
                assert!(advertise_addr.is_none());
            }
            other => panic!("unexpected origin {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let yaml = "service:\n  replay_workers: 0\n";
        assert!(matches!(
            GatekeeperConfig::from_yaml(yaml),
            Err(GatekeeperError::Config(_))
        ));

        let yaml = "breaker:\n  recovery_timeout_ms: 0\n";
        assert!(GatekeeperConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = GatekeeperConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, GatekeeperError::Config(_)));
    }

    #[test]
    fn test_yaml_round_trip_of_effective_config() {
        let config = GatekeeperConfig::default();
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("replay_workers: 8"));
        assert!(yaml.contains("kind: memory"));
    }
}
