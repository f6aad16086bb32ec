//! Pipeline configuration loaded from TOML

use crate::consumer::DEFAULT_MAX_RETRY;
use crate::error::{AuditError, Result};
use crate::provider::nats::NatsConfig;
use crate::publisher::PublisherConfig;
use crate::query::QueryConfig;
use crate::sink::ElasticsearchConfig;
use crate::store::DatabaseConfig;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "A3S_AUDIT_CONFIG";

/// Which broker backs the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    #[default]
    Nats,
    /// In-process broker; records do not survive a restart
    Memory,
}

/// Consumer worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Concurrent workers on the work queue
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Requeues before a record is dead-lettered
    #[serde(default = "default_max_retry")]
    pub max_retry: u32,

    /// Bound on one index write
    #[serde(default = "default_index_timeout_ms")]
    pub index_timeout_ms: u64,

    /// Quiet period that ends a drain or replay run
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

fn default_workers() -> usize {
    2
}

fn default_max_retry() -> u32 {
    DEFAULT_MAX_RETRY
}

fn default_index_timeout_ms() -> u64 {
    5000
}

fn default_idle_timeout_ms() -> u64 {
    1000
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_retry: default_max_retry(),
            index_timeout_ms: default_index_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default)]
    pub broker: BrokerKind,

    #[serde(default)]
    pub nats: NatsConfig,

    #[serde(default)]
    pub topology: Topology,

    #[serde(default)]
    pub publisher: PublisherConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub elasticsearch: ElasticsearchConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub query: QueryConfig,
}

impl AuditConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Load from `A3S_AUDIT_CONFIG` if set, otherwise use defaults
    pub fn load_default() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AuditConfig =
            toml::from_str(content).map_err(|e| AuditError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        self.topology.validate()?;
        if self.consumer.workers == 0 {
            return Err(AuditError::Config("consumer.workers must be at least 1".to_string()));
        }
        if self.publisher.queue_capacity == 0 {
            return Err(AuditError::Config(
                "publisher.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.query.max_results == 0 {
            return Err(AuditError::Config("query.max_results must be at least 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AuditConfig::default();
        assert_eq!(config.broker, BrokerKind::Nats);
        assert_eq!(config.consumer.max_retry, 3);
        assert_eq!(config.query.max_results, 100);
        assert_eq!(config.elasticsearch.index, "audit_log_search");
        assert_eq!(config.topology.dlq_queue, "audit.event.dlq.queue");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_deserialize_sections() {
        let config = AuditConfig::from_toml(
            r#"
            broker = "memory"

            [consumer]
            workers = 4
            max_retry = 5

            [elasticsearch]
            url = "http://es:9200"
            username = "elastic"
            password = "secret"

            [topology]
            work_queue = "custom.queue"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker, BrokerKind::Memory);
        assert_eq!(config.consumer.workers, 4);
        assert_eq!(config.consumer.max_retry, 5);
        assert_eq!(config.consumer.index_timeout_ms, 5000);
        assert_eq!(config.elasticsearch.username.as_deref(), Some("elastic"));
        assert_eq!(config.topology.work_queue, "custom.queue");
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = AuditConfig::from_toml("[consumer]\nworkers = 0\n");
        assert!(matches!(result, Err(AuditError::Config(_))));

        let result = AuditConfig::from_toml("[topology]\ndlq_queue = \"audit.event.log.queue\"\n");
        assert!(matches!(result, Err(AuditError::Topology(_))));

        let result = AuditConfig::from_toml("broker = \"kafka\"");
        assert!(matches!(result, Err(AuditError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[query]\nmax_results = 25").unwrap();

        let config = AuditConfig::load(file.path()).unwrap();
        assert_eq!(config.query.max_results, 25);
    }

    #[test]
    fn test_load_missing_file() {
        let result = AuditConfig::load("/nonexistent/audit.toml");
        assert!(matches!(result, Err(AuditError::Config(_))));
    }

    #[test]
    fn test_config_serialize_roundtrip() {
        let config = AuditConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed = AuditConfig::from_toml(&serialized).unwrap();
        assert_eq!(parsed.nats.url, config.nats.url);
        assert_eq!(parsed.publisher.queue_capacity, config.publisher.queue_capacity);
    }
}
