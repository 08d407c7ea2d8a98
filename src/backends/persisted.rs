//! Backend that writes traces and spans to a [`TelemetryStore`].
//!
//! Always enabled. Rows are inserted `in_progress` on start and updated by
//! primary key on end. Long text is truncated before it reaches the store.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use super::truncate_chars;
use crate::backend::TelemetryBackend;
use crate::error::TelemetryError;
use crate::ids::{SpanId, TraceId};
use crate::model::{
    Completion, EventLog, EventRecord, Metadata, ModelCall, SpanEnd, SpanMetrics, SpanRecord,
    SpanStart, SpanType, Status, TraceCounters, TraceEnd, TraceRecord, TraceStart,
};
use crate::store::TelemetryStore;

pub const STORE_BACKEND_NAME: &str = "store";

/// Caps applied to free text before storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationLimits {
    pub max_error_chars: usize,
    pub max_preview_chars: usize,
}

impl Default for TruncationLimits {
    fn default() -> Self {
        Self {
            max_error_chars: 2000,
            max_preview_chars: 500,
        }
    }
}

pub struct PersistedStoreBackend {
    store: Arc<dyn TelemetryStore>,
    limits: TruncationLimits,
}

impl PersistedStoreBackend {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self::with_limits(store, TruncationLimits::default())
    }

    pub fn with_limits(store: Arc<dyn TelemetryStore>, limits: TruncationLimits) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    fn error_text(&self, error: &Option<String>) -> Option<String> {
        error
            .as_deref()
            .map(|e| truncate_chars(e, self.limits.max_error_chars))
    }

    fn preview(&self, text: &str) -> String {
        truncate_chars(text, self.limits.max_preview_chars)
    }

    /// Counter updates are secondary to the row write; failures are only logged.
    async fn bump(&self, trace_id: &TraceId, delta: TraceCounters) {
        if let Err(e) = self.store.add_trace_counters(trace_id, &delta).await {
            debug!(trace_id = %trace_id, error = %e, "Trace counter update skipped");
        }
    }

    async fn insert_model_call(&self, call: &ModelCall) -> Result<(), TelemetryError> {
        let duration_ms = call.duration_ms.unwrap_or(0);
        let started_at = started_before(call.timestamp, duration_ms);

        let mut metadata = call.metadata.clone().unwrap_or_default();
        if let Some(input) = &call.input_preview {
            metadata.insert("input_preview".into(), Value::String(self.preview(input)));
        }
        if let Some(output) = &call.output_preview {
            metadata.insert("output_preview".into(), Value::String(self.preview(output)));
        }

        self.store
            .insert_span(SpanRecord {
                span_id: call.span_id.clone(),
                trace_id: call.trace_id.clone(),
                parent_span_id: call.parent_span_id.clone(),
                name: call.name.clone(),
                span_type: SpanType::ModelCall,
                status: call.status,
                started_at,
                ended_at: Some(call.timestamp),
                duration_ms: Some(duration_ms),
                error_message: self.error_text(&call.error_message),
                metrics: SpanMetrics {
                    model: Some(call.model.clone()),
                    input_tokens: call.input_tokens,
                    output_tokens: call.output_tokens,
                    ..Default::default()
                },
                metadata,
            })
            .await?;

        self.bump(
            &call.trace_id,
            TraceCounters {
                model_call_count: 1,
                error_count: u64::from(call.status == Status::Failed),
                total_input_tokens: u64::from(call.input_tokens.unwrap_or(0)),
                total_output_tokens: u64::from(call.output_tokens.unwrap_or(0)),
                ..Default::default()
            },
        )
        .await;
        Ok(())
    }
}

/// Start of a call that ended at `ended_at` after `duration_ms`. Durations
/// too large to represent fall back to `ended_at`.
fn started_before(ended_at: DateTime<Utc>, duration_ms: u64) -> DateTime<Utc> {
    i64::try_from(duration_ms)
        .ok()
        .and_then(TimeDelta::try_milliseconds)
        .and_then(|elapsed| ended_at.checked_sub_signed(elapsed))
        .unwrap_or(ended_at)
}

/// Text shown in event listings: the payload's `content` field, or the
/// payload itself when it is a bare string.
fn event_content(payload: &Value) -> Option<&str> {
    match payload {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("content").and_then(Value::as_str),
        _ => None,
    }
}

#[async_trait]
impl TelemetryBackend for PersistedStoreBackend {
    fn name(&self) -> &str {
        STORE_BACKEND_NAME
    }

    fn enabled(&self) -> bool {
        true
    }

    async fn start_trace(&self, trace: &TraceStart) -> Result<Option<String>, TelemetryError> {
        let row_id = uuid::Uuid::new_v4().to_string();
        self.store
            .insert_trace(TraceRecord {
                row_id: row_id.clone(),
                trace_id: trace.trace_id.clone(),
                name: trace.name.clone(),
                status: Status::InProgress,
                started_at: trace.timestamp,
                ended_at: None,
                duration_ms: None,
                user_id: trace.user_id.clone(),
                session_id: trace.session_id.clone(),
                kb_id: trace.kb_id.clone(),
                error_message: None,
                metadata: trace.metadata.clone().unwrap_or_default(),
                counters: TraceCounters::default(),
            })
            .await?;
        Ok(Some(row_id))
    }

    async fn end_trace(&self, trace: &TraceEnd) -> Result<(), TelemetryError> {
        self.store
            .complete_trace(
                &trace.trace_id,
                Completion {
                    status: trace.status,
                    ended_at: trace.timestamp,
                    duration_ms: trace.duration_ms,
                    error_message: self.error_text(&trace.error_message),
                },
                trace.metadata.clone(),
            )
            .await?;
        Ok(())
    }

    async fn start_span(&self, span: &SpanStart) -> Result<(), TelemetryError> {
        self.store
            .insert_span(SpanRecord {
                span_id: span.span_id.clone(),
                trace_id: span.trace_id.clone(),
                parent_span_id: span.parent_span_id.clone(),
                name: span.name.clone(),
                span_type: span.span_type,
                status: Status::InProgress,
                started_at: span.timestamp,
                ended_at: None,
                duration_ms: None,
                error_message: None,
                metrics: SpanMetrics::default(),
                metadata: span.metadata.clone().unwrap_or_else(Metadata::new),
            })
            .await?;

        self.bump(
            &span.trace_id,
            TraceCounters {
                span_count: 1,
                ..Default::default()
            },
        )
        .await;
        Ok(())
    }

    async fn end_span(&self, span: &SpanEnd) -> Result<(), TelemetryError> {
        self.store
            .complete_span(
                &span.span_id,
                Completion {
                    status: span.status,
                    ended_at: span.timestamp,
                    duration_ms: span.duration_ms,
                    error_message: self.error_text(&span.error_message),
                },
                span.metrics.clone(),
            )
            .await?;

        let delta = TraceCounters {
            error_count: u64::from(span.status == Status::Failed),
            total_input_tokens: u64::from(span.metrics.input_tokens.unwrap_or(0)),
            total_output_tokens: u64::from(span.metrics.output_tokens.unwrap_or(0)),
            ..Default::default()
        };
        if delta != TraceCounters::default() {
            self.bump(&span.trace_id, delta).await;
        }
        Ok(())
    }

    async fn log_model_call(&self, call: &ModelCall) -> Result<SpanId, TelemetryError> {
        if let Err(e) = self.insert_model_call(call).await {
            warn!(
                backend = STORE_BACKEND_NAME,
                trace_id = %call.trace_id,
                span_id = %call.span_id,
                error = %e,
                "Model call not persisted"
            );
        }
        Ok(call.span_id.clone())
    }

    async fn log_event(&self, event: &EventLog) -> Result<(), TelemetryError> {
        let content_preview = event_content(&event.payload).map(|c| self.preview(c));
        self.store
            .insert_event(EventRecord {
                event_id: uuid::Uuid::new_v4().to_string(),
                trace_id: event.trace_id.clone(),
                span_id: event.span_id.clone(),
                kind: event.kind.clone(),
                payload: event.payload.clone(),
                content_preview,
                timestamp: event.timestamp,
            })
            .await?;

        self.bump(
            &event.trace_id,
            TraceCounters {
                event_count: 1,
                ..Default::default()
            },
        )
        .await;
        Ok(())
    }
}
