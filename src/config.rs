use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::remote::Compression;

/// Top-level configuration for a collector node.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct Config {
    /// This member's identity and listener.
    #[serde(default)]
    pub node: NodeConfig,

    /// Static cluster membership.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Local aggregation window configuration.
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Persistence window and storage writer configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Remote dispatch transport configuration.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Storage backend configuration.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// This member's identity and listener.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Address peers use to reach this node (e.g., "10.0.0.4:11800").
    #[serde(default)]
    pub address: String,

    /// Listen address for the remote and ingest HTTP server. Default: "0.0.0.0:11800".
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

/// Static cluster membership.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Advertised addresses of every member, this node included.
    #[serde(default)]
    pub members: Vec<String>,
}

/// Local aggregation window configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Aggregation window duration. Default: 1s.
    #[serde(default = "default_aggregation_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

/// Persistence window and storage writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    /// Persistence window duration. Default: 3s.
    #[serde(default = "default_persistence_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Storage write queue capacity. Default: 8192.
    #[serde(default = "default_persistence_max_queue_size")]
    pub max_queue_size: usize,

    /// Concurrent storage upserts. Default: 2.
    #[serde(default = "default_persistence_workers")]
    pub workers: usize,
}

/// Remote dispatch transport configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// Per-request timeout. Default: 5s.
    #[serde(default = "default_remote_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Send queue capacity; sends beyond it fail fast. Default: 4096.
    #[serde(default = "default_remote_max_queue_size")]
    pub max_queue_size: usize,

    /// Maximum concurrent requests. Default: 8.
    #[serde(default = "default_remote_max_in_flight")]
    pub max_in_flight: usize,

    /// Envelopes per request. Default: 256.
    #[serde(default = "default_remote_batch_size")]
    pub batch_size: usize,

    /// Maximum time a partial batch waits. Default: 200ms.
    #[serde(default = "default_remote_batch_timeout", with = "humantime_serde")]
    pub batch_timeout: Duration,

    /// Retries per batch after the first attempt. Default: 2.
    #[serde(default = "default_remote_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff, doubled per attempt. Default: 100ms.
    #[serde(default = "default_remote_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Body compression: none, gzip, zstd, zlib, snappy. Default: gzip.
    #[serde(default)]
    pub compression: Compression,
}

/// Storage backend selector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    ClickHouse,
}

/// Storage backend configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend: memory or clickhouse. Default: memory.
    #[serde(default)]
    pub backend: StorageBackend,

    /// ClickHouse connection configuration.
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,
}

/// ClickHouse connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// Native protocol endpoint (e.g., "localhost:9000").
    #[serde(default)]
    pub endpoint: String,

    /// Database name. Default: "apm".
    #[serde(default = "default_database")]
    pub database: String,

    /// Username.
    #[serde(default)]
    pub username: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Create missing tables at startup. Default: true.
    #[serde(default = "default_true")]
    pub ensure_schema: bool,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_listen_addr() -> String {
    "0.0.0.0:11800".to_string()
}

fn default_aggregation_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_persistence_flush_interval() -> Duration {
    Duration::from_secs(3)
}

fn default_persistence_max_queue_size() -> usize {
    8192
}

fn default_persistence_workers() -> usize {
    2
}

fn default_remote_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_remote_max_queue_size() -> usize {
    4096
}

fn default_remote_max_in_flight() -> usize {
    8
}

fn default_remote_batch_size() -> usize {
    256
}

fn default_remote_batch_timeout() -> Duration {
    Duration::from_millis(200)
}

fn default_remote_max_retries() -> u32 {
    2
}

fn default_remote_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_database() -> String {
    "apm".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            listen_addr: default_listen_addr(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_aggregation_flush_interval(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            flush_interval: default_persistence_flush_interval(),
            max_queue_size: default_persistence_max_queue_size(),
            workers: default_persistence_workers(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            timeout: default_remote_timeout(),
            max_queue_size: default_remote_max_queue_size(),
            max_in_flight: default_remote_max_in_flight(),
            batch_size: default_remote_batch_size(),
            batch_timeout: default_remote_batch_timeout(),
            max_retries: default_remote_max_retries(),
            retry_backoff: default_remote_retry_backoff(),
            compression: Compression::default(),
        }
    }
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            database: default_database(),
            username: String::new(),
            password: String::new(),
            ensure_schema: true,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.node.address.is_empty() {
            bail!("node.address is required");
        }
        if self.node.listen_addr.is_empty() {
            bail!("node.listen_addr is required");
        }

        let mut seen = HashSet::with_capacity(self.cluster.members.len());
        for member in &self.cluster.members {
            if member.is_empty() {
                bail!("cluster.members must not contain empty addresses");
            }
            if !seen.insert(member.as_str()) {
                bail!("cluster.members contains duplicate address {member}");
            }
        }
        if !self.cluster.members.is_empty() && !seen.contains(self.node.address.as_str()) {
            bail!(
                "cluster.members must include node.address ({})",
                self.node.address
            );
        }

        if self.aggregation.flush_interval.is_zero() {
            bail!("aggregation.flush_interval must be positive");
        }

        if self.persistence.flush_interval.is_zero() {
            bail!("persistence.flush_interval must be positive");
        }
        if self.persistence.max_queue_size == 0 {
            bail!("persistence.max_queue_size must be positive");
        }
        if self.persistence.workers == 0 {
            bail!("persistence.workers must be positive");
        }

        if self.remote.timeout.is_zero() {
            bail!("remote.timeout must be positive");
        }
        if self.remote.max_queue_size == 0 {
            bail!("remote.max_queue_size must be positive");
        }
        if self.remote.max_in_flight == 0 {
            bail!("remote.max_in_flight must be positive");
        }
        if self.remote.batch_size == 0 {
            bail!("remote.batch_size must be positive");
        }
        if self.remote.batch_timeout.is_zero() {
            bail!("remote.batch_timeout must be positive");
        }

        if self.storage.backend == StorageBackend::ClickHouse {
            if self.storage.clickhouse.endpoint.is_empty() {
                bail!("storage.clickhouse.endpoint is required when backend is clickhouse");
            }
            if self.storage.clickhouse.database.is_empty() {
                bail!("storage.clickhouse.database is required when backend is clickhouse");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn valid_config() -> Config {
        Config {
            node: NodeConfig {
                address: "10.0.0.1:11800".to_string(),
                ..Default::default()
            },
            cluster: ClusterConfig {
                members: vec!["10.0.0.1:11800".to_string(), "10.0.0.2:11800".to_string()],
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config() {
        valid_config().validate().expect("valid config");
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.node.listen_addr, "0.0.0.0:11800");
        assert_eq!(cfg.aggregation.flush_interval, Duration::from_secs(1));
        assert_eq!(cfg.persistence.flush_interval, Duration::from_secs(3));
        assert_eq!(cfg.persistence.max_queue_size, 8192);
        assert_eq!(cfg.remote.max_in_flight, 8);
        assert_eq!(cfg.remote.compression, Compression::Gzip);
        assert_eq!(cfg.storage.backend, StorageBackend::Memory);
        assert_eq!(cfg.health.addr, ":9090");
    }

    #[test]
    fn test_missing_address() {
        let mut cfg = valid_config();
        cfg.node.address.clear();
        let err = cfg.validate().expect_err("missing address");
        assert!(err.to_string().contains("node.address"));
    }

    #[test]
    fn test_members_must_include_self() {
        let mut cfg = valid_config();
        cfg.cluster.members = vec!["10.0.0.2:11800".to_string()];
        let err = cfg.validate().expect_err("self missing");
        assert!(err.to_string().contains("cluster.members"));
    }

    #[test]
    fn test_duplicate_member() {
        let mut cfg = valid_config();
        cfg.cluster.members.push("10.0.0.2:11800".to_string());
        let err = cfg.validate().expect_err("duplicate");
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_zero_values_rejected() {
        let mut cfg = valid_config();
        cfg.remote.max_in_flight = 0;
        assert!(cfg
            .validate()
            .expect_err("in flight")
            .to_string()
            .contains("remote.max_in_flight"));

        let mut cfg = valid_config();
        cfg.persistence.workers = 0;
        assert!(cfg
            .validate()
            .expect_err("workers")
            .to_string()
            .contains("persistence.workers"));
    }

    #[test]
    fn test_clickhouse_requires_endpoint() {
        let mut cfg = valid_config();
        cfg.storage.backend = StorageBackend::ClickHouse;
        let err = cfg.validate().expect_err("endpoint");
        assert!(err.to_string().contains("storage.clickhouse.endpoint"));
    }

    #[test]
    fn test_load_yaml() {
        let yaml = r#"
node:
  address: "10.0.0.1:11800"
cluster:
  members: ["10.0.0.1:11800", "10.0.0.2:11800", "10.0.0.3:11800"]
aggregation:
  flush_interval: 500ms
remote:
  compression: zstd
  max_retries: 5
  retry_backoff: 50ms
storage:
  backend: clickhouse
  clickhouse:
    endpoint: "localhost:9000"
    ensure_schema: false
"#;
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.cluster.members.len(), 3);
        assert_eq!(cfg.aggregation.flush_interval, Duration::from_millis(500));
        assert_eq!(cfg.remote.compression, Compression::Zstd);
        assert_eq!(cfg.remote.max_retries, 5);
        assert_eq!(cfg.remote.retry_backoff, Duration::from_millis(50));
        assert_eq!(cfg.remote.batch_size, 256);
        assert_eq!(cfg.storage.backend, StorageBackend::ClickHouse);
        assert_eq!(cfg.storage.clickhouse.database, "apm");
        assert!(!cfg.storage.clickhouse.ensure_schema);
    }

    #[test]
    fn test_load_rejects_unknown_compression() {
        let yaml = "node:\n  address: a:1\nremote:\n  compression: brotli\n";
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(yaml.as_bytes()).expect("write");
        assert!(Config::load(file.path()).is_err());
    }
}
