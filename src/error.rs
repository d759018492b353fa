//! Error types and categorisation
//!
//! Every fallible seam in the crate returns one of the typed errors below.
//! Most of them never reach an application: transport and persistence
//! failures are absorbed where they happen and only logged. The one error a
//! caller is expected to handle is [`BusError::Timeout`].

use std::time::Duration;

use thiserror::Error;

/// Coarse classification used for logging and retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Relay or primitive failures such as a closed port
    Transport,

    /// Malformed payloads or envelopes
    Decode,

    /// A request went unanswered
    Timeout,

    /// Durable key-value store failures
    Storage,

    /// Invalid or unreadable configuration
    Configuration,
}

impl ErrorCategory {
    /// Check if an operation failing with this category may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transport | ErrorCategory::Timeout | ErrorCategory::Storage
        )
    }
}

/// Failures raised by a cross-context primitive
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broadcast port `{0}` is closed")]
    PortClosed(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("envelope encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TransportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            TransportError::Encode(_) => ErrorCategory::Decode,
            TransportError::Storage(_) => ErrorCategory::Storage,
            _ => ErrorCategory::Transport,
        }
    }
}

/// Failures surfaced by the message bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("request `{message_type}` to `{target}` timed out after {}ms", after.as_millis())]
    Timeout {
        message_type: String,
        target: String,
        after: Duration,
    },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("bus channel closed before a response arrived")]
    Closed,
}

impl BusError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            BusError::Timeout { .. } => ErrorCategory::Timeout,
            BusError::Encode(_) | BusError::Decode(_) => ErrorCategory::Decode,
            BusError::Closed => ErrorCategory::Transport,
        }
    }
}

/// Failures raised by a durable key-value store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("snapshot serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("storage quota exceeded: {used} of {limit} bytes")]
    Quota { used: usize, limit: usize },
}

impl StorageError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            StorageError::Serialize(_) => ErrorCategory::Decode,
            _ => ErrorCategory::Storage,
        }
    }
}

/// Failures while loading a configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
}

impl ConfigError {
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}
