//! Error types for telemetry recording.
//!
//! None of these ever reach application code: backend errors stop at the
//! fan-out boundary in [`crate::service`], where they are logged and dropped.

use std::time::Duration;

use thiserror::Error;

use crate::model::Status;

/// Errors raised by a [`crate::store::TelemetryStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    #[error("Span not found: {0}")]
    SpanNotFound(String),

    #[error("Duplicate {entity} id: {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("{entity} {id} already in terminal state {status}")]
    TerminalState {
        entity: &'static str,
        id: String,
        status: Status,
    },
}

/// Errors raised by an external ingestion client or its transport.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("Client not configured: {0}")]
    NotConfigured(String),

    #[error("Client rejected event: {0}")]
    Rejected(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error surfaced by a backend operation to the fan-out boundary.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("External sync error: {0}")]
    External(#[from] ExternalError),

    #[error("Flush timed out after {0:?}")]
    FlushTimeout(Duration),

    #[error("Backend disabled: {0}")]
    Disabled(String),

    #[error("Background task failed: {0}")]
    Join(String),
}

impl TelemetryError {
    /// Returns true if this error is expected during a remote outage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::FlushTimeout(_)
                | Self::External(ExternalError::Transport(_))
                | Self::External(ExternalError::Io(_))
        )
    }
}
