//! Error types for the telemetry pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::realtime::TransportError;
use crate::retry::RetryableError;

/// Errors that can occur in the telemetry pipeline.
///
/// Only construction and startup errors are ever returned to producers.
/// Everything raised while a sink handles an event is downgraded to a
/// diagnostic by the channel that owns the sink.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A required field was not provided.
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    /// Configuration was rejected at construction time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A background task was started outside of a tokio runtime.
    #[error("no tokio runtime available to start {0}")]
    RuntimeUnavailable(String),

    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The size-budget serializer could not fit the payload.
    #[error("constrain failed: {0}")]
    ConstrainFailed(String),

    /// The real-time transport rejected a record.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The streaming client failed to deliver a batch.
    #[error("stream error: {0}")]
    Stream(String),

    /// A flush did not complete within its deadline.
    #[error("flush timed out after {0:?}")]
    Timeout(Duration),
}

impl RetryableError for TelemetryError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}

/// Result type alias for telemetry operations.
pub type Result<T> = std::result::Result<T, TelemetryError>;
