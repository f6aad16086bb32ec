//! NATS provider configuration

use serde::{Deserialize, Serialize};

/// JetStream storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Persisted to disk; survives server restart
    #[default]
    File,
    /// Held in memory; for tests
    Memory,
}

/// Connection and consumer settings for the NATS broker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NatsConfig {
    /// Server URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Optional auth token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Storage for the queue streams
    #[serde(default)]
    pub storage: StorageType,

    /// Durable consumer name prefix; one durable per queue
    #[serde(default = "default_consumer_prefix")]
    pub consumer_prefix: String,

    /// How long an unacked delivery stays invisible before redelivery
    #[serde(default = "default_ack_wait_secs")]
    pub ack_wait_secs: u64,
}

fn default_url() -> String {
    "nats://127.0.0.1:4222".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_consumer_prefix() -> String {
    "audit".to_string()
}

fn default_ack_wait_secs() -> u64 {
    30
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            storage: StorageType::default(),
            consumer_prefix: default_consumer_prefix(),
            ack_wait_secs: default_ack_wait_secs(),
        }
    }
}

impl NatsConfig {
    /// JetStream stream backing a queue (`audit.event.log.queue` → `AUDIT_EVENT_LOG_QUEUE`)
    pub fn stream_name(&self, queue: &str) -> String {
        queue
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Subject an exchange publishes to for one routing key
    pub fn subject(&self, exchange: &str, routing_key: &str) -> String {
        format!("{}.{}", exchange, routing_key)
    }

    /// Durable consumer name for a queue
    pub fn consumer_name(&self, queue: &str) -> String {
        format!(
            "{}-{}",
            self.consumer_prefix,
            self.stream_name(queue).to_lowercase().replace('_', "-")
        )
    }
}
