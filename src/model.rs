//! Telemetry data model: lifecycle payloads sent to backends and the
//! records backends persist.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{SpanId, TraceId};

/// Free-form key/value attributes attached to traces, spans and calls.
pub type Metadata = serde_json::Map<String, Value>;

/// Lifecycle status shared by traces and spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    InProgress,
    Completed,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a span measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanType {
    ModelCall,
    Retrieval,
    Parse,
    Chunk,
    Embed,
    Index,
    Generation,
    Tool,
    Other,
}

impl SpanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ModelCall => "model_call",
            Self::Retrieval => "retrieval",
            Self::Parse => "parse",
            Self::Chunk => "chunk",
            Self::Embed => "embed",
            Self::Index => "index",
            Self::Generation => "generation",
            Self::Tool => "tool",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for SpanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type-specific measurements recorded when a span ends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpanMetrics {
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    /// Documents retrieved, chunks produced, vectors indexed, ...
    pub item_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub extra: Metadata,
}

impl SpanMetrics {
    pub fn is_empty(&self) -> bool {
        self.model.is_none()
            && self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.item_count.is_none()
            && self.extra.is_empty()
    }
}

// =============================================================================
// Backend lifecycle payloads
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStart {
    pub trace_id: TraceId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kb_id: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEnd {
    pub trace_id: TraceId,
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanStart {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub name: String,
    pub span_type: SpanType,
    pub parent_span_id: Option<SpanId>,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<Metadata>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEnd {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub timestamp: DateTime<Utc>,
    pub status: Status,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub metrics: SpanMetrics,
}

/// A completed model invocation, recorded in one shot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCall {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub model: String,
    pub timestamp: DateTime<Utc>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub duration_ms: Option<u64>,
    pub status: Status,
    pub error_message: Option<String>,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub metadata: Option<Metadata>,
}

/// A generic domain event (chat message, ingestion step, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    pub trace_id: TraceId,
    pub span_id: Option<SpanId>,
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Persisted records
// =============================================================================

/// Aggregated per-trace counters maintained as children are recorded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceCounters {
    pub span_count: u64,
    pub model_call_count: u64,
    pub event_count: u64,
    pub error_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
}

impl TraceCounters {
    pub fn add(&mut self, delta: &TraceCounters) {
        self.span_count += delta.span_count;
        self.model_call_count += delta.model_call_count;
        self.event_count += delta.event_count;
        self.error_count += delta.error_count;
        self.total_input_tokens += delta.total_input_tokens;
        self.total_output_tokens += delta.total_output_tokens;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub row_id: String,
    pub trace_id: TraceId,
    pub name: String,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kb_id: Option<String>,
    pub error_message: Option<String>,
    pub metadata: Metadata,
    pub counters: TraceCounters,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub parent_span_id: Option<SpanId>,
    pub name: String,
    pub span_type: SpanType,
    pub status: Status,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_message: Option<String>,
    pub metrics: SpanMetrics,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub trace_id: TraceId,
    pub span_id: Option<SpanId>,
    pub kind: String,
    pub payload: Value,
    pub content_preview: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Terminal update applied to a trace or span row by primary key.
#[derive(Debug, Clone)]
pub struct Completion {
    pub status: Status,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

// =============================================================================
// External sync diagnostics
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Trace,
    Span,
    Generation,
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Span => "span",
            Self::Generation => "generation",
            Self::Event => "event",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

/// Outcome of forwarding one entity to an external backend.
///
/// Observational only: nothing resends based on these rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSyncStatus {
    pub backend_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub sync_status: SyncState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Requested change to a sync-status row.
#[derive(Debug, Clone)]
pub struct SyncStatusUpdate {
    pub backend_name: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub sync_status: SyncState,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(Status::InProgress.as_str(), "in_progress");
        assert_eq!(Status::Completed.to_string(), "completed");
        assert_eq!(serde_json::to_string(&Status::Failed).unwrap(), "\"failed\"");
        assert!(!Status::InProgress.is_terminal());
        assert!(Status::Failed.is_terminal());
    }

    #[test]
    fn test_counters_add() {
        let mut total = TraceCounters::default();
        total.add(&TraceCounters {
            model_call_count: 1,
            total_input_tokens: 100,
            total_output_tokens: 50,
            ..Default::default()
        });
        total.add(&TraceCounters {
            span_count: 1,
            error_count: 1,
            ..Default::default()
        });
        assert_eq!(total.model_call_count, 1);
        assert_eq!(total.span_count, 1);
        assert_eq!(total.error_count, 1);
        assert_eq!(total.total_input_tokens, 100);
    }

    #[test]
    fn test_empty_metrics_skip_extra() {
        let metrics = SpanMetrics::default();
        assert!(metrics.is_empty());
        let json = serde_json::to_string(&metrics).unwrap();
        assert!(!json.contains("extra"));
    }
}
