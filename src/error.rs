//! Error types for the relay.

use std::time::Duration;

use crate::transport::ChatId;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Rule cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Ingestion error: {0}")]
    Ingest(#[from] IngestError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Database connection is closed")]
    Closed,
}

/// Which side of a rule the transport refused to let us touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    /// We can no longer write to the destination chat.
    Destination,
    /// We can no longer read from the source chat.
    Source,
}

/// Failure taxonomy of the external messaging transport.
///
/// Every failed send is mapped onto exactly one of these classes; the worker
/// pool decides between retry, rule disablement and drop from the variant
/// alone.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Rate limited by {transport}, retry after {retry_after:?}")]
    RateLimited {
        transport: String,
        retry_after: Duration,
    },

    #[error("Permission denied on {scope:?} chat {chat}: {reason}")]
    PermissionDenied {
        scope: PermissionScope,
        chat: ChatId,
        reason: String,
    },

    #[error("Transport {transport} unavailable: {reason}")]
    Down { transport: String, reason: String },

    #[error("Unclassified transport failure: {0}")]
    Unknown(String),
}

impl TransportError {
    /// Whether the same send may succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Down { .. })
    }

    /// Server-mandated cooldown, if the failure carries one.
    pub fn flood_wait(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Task cache errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Task store unavailable: {0}")]
    StoreUnavailable(#[source] DatabaseError),

    #[error("Forwarding rule {0} not found")]
    RuleNotFound(i64),
}

/// Forwarding queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Forwarding queue full ({capacity} items)")]
    Full { capacity: usize },

    #[error("Forwarding queue closed")]
    Closed,
}

/// Ingestion errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("Ingestion paused")]
    Paused,

    #[error("Ingestion stopped")]
    Stopped,
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
