//! The capability contract every recording backend implements.

use async_trait::async_trait;

use crate::error::TelemetryError;
use crate::ids::SpanId;
use crate::model::{EventLog, ModelCall, SpanEnd, SpanStart, TraceEnd, TraceStart};

/// A destination for trace and span lifecycle events.
///
/// Implementations may fail freely: the orchestrator guards every call
/// individually, so an `Err` (or a panic) from one backend never reaches the
/// caller or the sibling backends. Backends that talk to a remote system own
/// their own bounded-wait policy.
#[async_trait]
pub trait TelemetryBackend: Send + Sync {
    /// Stable identifier used in logs and sync-status rows.
    fn name(&self) -> &str;

    /// Whether this backend takes part in fan-out at all.
    ///
    /// Read once when the orchestrator is built.
    fn enabled(&self) -> bool;

    /// Record the start of a trace. May return the row id it was stored under.
    async fn start_trace(&self, trace: &TraceStart) -> Result<Option<String>, TelemetryError>;

    async fn end_trace(&self, trace: &TraceEnd) -> Result<(), TelemetryError>;

    async fn start_span(&self, span: &SpanStart) -> Result<(), TelemetryError>;

    async fn end_span(&self, span: &SpanEnd) -> Result<(), TelemetryError>;

    /// Record a completed model call.
    ///
    /// Implementations return `call.span_id` even when their own recording
    /// failed, because callers correlate against it regardless.
    async fn log_model_call(&self, call: &ModelCall) -> Result<SpanId, TelemetryError>;

    async fn log_event(&self, event: &EventLog) -> Result<(), TelemetryError>;

    /// Push out anything buffered. Called at shutdown.
    async fn flush(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}
