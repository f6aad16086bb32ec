//! Broker topology: exchanges, queues, bindings, and dead-letter routing
//!
//! A `Topology` is a declarative description handed to a
//! [`BrokerProvider`](crate::provider::BrokerProvider). Providers create
//! whatever is missing and fail on incompatible redeclaration.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};

/// A direct exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeSpec {
    pub name: String,

    /// Survives broker restart
    #[serde(default = "default_true")]
    pub durable: bool,

    /// Deleted when the last binding goes away
    #[serde(default)]
    pub auto_delete: bool,
}

impl ExchangeSpec {
    /// Durable, non-auto-deleted exchange
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            auto_delete: false,
        }
    }
}

/// Where rejected messages go
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterTarget {
    pub exchange: String,
    pub routing_key: String,
}

/// A queue, optionally wired to a dead-letter exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSpec {
    pub name: String,

    #[serde(default = "default_true")]
    pub durable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter: Option<DeadLetterTarget>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            dead_letter: None,
        }
    }

    /// Route rejected-without-requeue messages to `exchange` with `routing_key`
    pub fn with_dead_letter(
        mut self,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        });
        self
    }
}

/// Binds a queue to an exchange for one routing key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

/// Full pipeline topology
///
/// The work path is `exchange --routing_key--> work_queue`; the work queue
/// dead-letters to `dlx_exchange --dlq_routing_key--> dlq_queue`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default = "default_exchange")]
    pub exchange: String,

    #[serde(default = "default_routing_key")]
    pub routing_key: String,

    #[serde(default = "default_work_queue")]
    pub work_queue: String,

    #[serde(default = "default_dlx_exchange")]
    pub dlx_exchange: String,

    #[serde(default = "default_dlq_routing_key")]
    pub dlq_routing_key: String,

    #[serde(default = "default_dlq_queue")]
    pub dlq_queue: String,
}

fn default_true() -> bool {
    true
}

fn default_exchange() -> String {
    "audit.event.exchange".to_string()
}

fn default_routing_key() -> String {
    "audit.event.log".to_string()
}

fn default_work_queue() -> String {
    "audit.event.log.queue".to_string()
}

fn default_dlx_exchange() -> String {
    "audit.event.dlx.exchange".to_string()
}

fn default_dlq_routing_key() -> String {
    "audit.event.dlq".to_string()
}

fn default_dlq_queue() -> String {
    "audit.event.dlq.queue".to_string()
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: default_exchange(),
            routing_key: default_routing_key(),
            work_queue: default_work_queue(),
            dlx_exchange: default_dlx_exchange(),
            dlq_routing_key: default_dlq_routing_key(),
            dlq_queue: default_dlq_queue(),
        }
    }
}

impl Topology {
    /// Exchanges to declare, work exchange first
    pub fn exchanges(&self) -> Vec<ExchangeSpec> {
        vec![
            ExchangeSpec::durable(&self.exchange),
            ExchangeSpec::durable(&self.dlx_exchange),
        ]
    }

    /// Queues to declare, work queue first
    pub fn queues(&self) -> Vec<QueueSpec> {
        vec![
            QueueSpec::durable(&self.work_queue)
                .with_dead_letter(&self.dlx_exchange, &self.dlq_routing_key),
            QueueSpec::durable(&self.dlq_queue),
        ]
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        vec![
            BindingSpec {
                exchange: self.exchange.clone(),
                queue: self.work_queue.clone(),
                routing_key: self.routing_key.clone(),
            },
            BindingSpec {
                exchange: self.dlx_exchange.clone(),
                queue: self.dlq_queue.clone(),
                routing_key: self.dlq_routing_key.clone(),
            },
        ]
    }

    /// Check internal consistency before touching a broker
    pub fn validate(&self) -> Result<()> {
        let named = [
            ("exchange", &self.exchange),
            ("routing_key", &self.routing_key),
            ("work_queue", &self.work_queue),
            ("dlx_exchange", &self.dlx_exchange),
            ("dlq_routing_key", &self.dlq_routing_key),
            ("dlq_queue", &self.dlq_queue),
        ];
        for (field, value) in named {
            if value.trim().is_empty() {
                return Err(AuditError::Topology(format!("'{}' must not be empty", field)));
            }
        }

        if self.exchange == self.dlx_exchange {
            return Err(AuditError::Topology(format!(
                "dead-letter exchange must differ from work exchange '{}'",
                self.exchange
            )));
        }
        if self.work_queue == self.dlq_queue {
            return Err(AuditError::Topology(format!(
                "dead-letter queue must differ from work queue '{}'",
                self.work_queue
            )));
        }

        validate_declarations(&self.exchanges(), &self.queues(), &self.bindings())
    }
}

/// Check that bindings and dead-letter targets only reference declared
/// objects, and that every dead-letter target actually reaches a queue
pub fn validate_declarations(
    exchanges: &[ExchangeSpec],
    queues: &[QueueSpec],
    bindings: &[BindingSpec],
) -> Result<()> {
    let has_exchange = |name: &str| exchanges.iter().any(|e| e.name == name);
    let has_queue = |name: &str| queues.iter().any(|q| q.name == name);

    for binding in bindings {
        if !has_exchange(&binding.exchange) {
            return Err(AuditError::Topology(format!(
                "binding references undeclared exchange '{}'",
                binding.exchange
            )));
        }
        if !has_queue(&binding.queue) {
            return Err(AuditError::Topology(format!(
                "binding references undeclared queue '{}'",
                binding.queue
            )));
        }
    }

    for queue in queues {
        let Some(ref target) = queue.dead_letter else {
            continue;
        };
        if !has_exchange(&target.exchange) {
            return Err(AuditError::Topology(format!(
                "queue '{}' dead-letters to undeclared exchange '{}'",
                queue.name, target.exchange
            )));
        }
        let routed = bindings
            .iter()
            .any(|b| b.exchange == target.exchange && b.routing_key == target.routing_key);
        if !routed {
            return Err(AuditError::Topology(format!(
                "dead-letter key '{}' on exchange '{}' is not bound to any queue",
                target.routing_key, target.exchange
            )));
        }
    }

    Ok(())
}
