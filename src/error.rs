//! Error types for Source Pulse.

use std::time::Duration;

use crate::protocol::{SourceId, StepCode};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Task apply error: {0}")]
    TaskApply(#[from] TaskApplyError),

    #[error("History error: {0}")]
    History(#[from] HistoryFetchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Push-channel connection errors.
///
/// `Unauthenticated` is fatal and never retried; the other variants are
/// candidates for the reconnection loop.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("Missing channel credential")]
    Unauthenticated,

    #[error("Channel unreachable: {reason}")]
    Unreachable { reason: String },

    #[error("Channel open timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Channel handshake failed: {reason}")]
    Protocol { reason: String },
}

impl ConnError {
    /// Whether a reconnection attempt makes sense for this failure.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Unauthenticated)
    }
}

/// Per-frame decode errors. Dropped frames are never fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Empty frame")]
    EmptyFrame,

    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Rejected task-state mutations.
#[derive(Debug, thiserror::Error)]
pub enum TaskApplyError {
    #[error("Source {source_id} is already terminal ({step}); update ignored")]
    TerminalRecord { source_id: SourceId, step: StepCode },
}

/// History read failures. Recoverable; never affects live task state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryFetchError {
    #[error("History request failed: {reason}")]
    Request { reason: String },

    #[error("History endpoint returned HTTP {status}")]
    Status { status: u16 },

    #[error("Invalid history payload: {reason}")]
    Payload { reason: String },

    #[error("History fetch cancelled")]
    Cancelled,
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
