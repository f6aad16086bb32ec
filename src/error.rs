//! Error types for a3s-audit

use thiserror::Error;

/// Errors that can occur in the audit pipeline
#[derive(Debug, Error)]
pub enum AuditError {
    /// Broker or sink connection failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Publish failure before the broker accepted the message
    #[error("Failed to publish to exchange '{exchange}' with key '{routing_key}': {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    /// Consumer creation or delivery failure
    #[error("Failed to consume from queue '{queue}': {reason}")]
    Consume { queue: String, reason: String },

    /// Acknowledgement (ack, requeue, reject) failure
    #[error("Failed to acknowledge message: {0}")]
    Ack(String),

    /// Broker topology is invalid or conflicts with what is already declared
    #[error("Topology error: {0}")]
    Topology(String),

    /// Relational store failure
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Search sink failure on the read path
    #[error("Search error: {0}")]
    Search(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Indexing failure surfaced outside the consumer
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Failure signal from the indexer
///
/// The consumer relies on this to choose between retry and dead-letter,
/// so every sink-level error must map to one of these variants.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The write did not finish within the configured timeout
    #[error("Index write timed out after {0}ms")]
    Timeout(u64),

    /// The sink could not be reached
    #[error("Search sink unavailable: {0}")]
    Unavailable(String),

    /// The sink answered with an error (mapping conflict, bad request, ...)
    #[error("Search sink rejected document '{doc_id}' with status {status}: {reason}")]
    Rejected {
        doc_id: String,
        status: u16,
        reason: String,
    },

    /// The document could not be encoded
    #[error("Failed to encode document: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for audit pipeline operations
pub type Result<T> = std::result::Result<T, AuditError>;
