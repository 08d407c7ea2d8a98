//! In-process telemetry store.
//!
//! Keeps rows in `tokio::sync::RwLock` maps. Suitable for tests, the demo
//! binary, and embedding where rows are exported via [`MemoryStore::export_json`].

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;

use super::TelemetryStore;
use crate::error::StoreError;
use crate::ids::{SpanId, TraceId};
use crate::model::{
    BackendSyncStatus, Completion, EntityType, EventRecord, Metadata, SpanMetrics, SpanRecord,
    SyncState, SyncStatusUpdate, TraceCounters, TraceRecord,
};

type SyncKey = (String, EntityType, String);

/// Telemetry store backed by in-memory maps.
#[derive(Default)]
pub struct MemoryStore {
    traces: RwLock<HashMap<TraceId, TraceRecord>>,
    spans: RwLock<HashMap<SpanId, SpanRecord>>,
    events: RwLock<Vec<EventRecord>>,
    sync: RwLock<HashMap<SyncKey, BackendSyncStatus>>,
}

#[derive(Serialize)]
struct Export<'a> {
    traces: Vec<&'a TraceRecord>,
    spans: Vec<&'a SpanRecord>,
    events: &'a [EventRecord],
    sync_status: Vec<&'a BackendSyncStatus>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn trace_count(&self) -> usize {
        self.traces.read().await.len()
    }

    pub async fn span_count(&self) -> usize {
        self.spans.read().await.len()
    }

    /// All sync-status rows, in no particular order.
    pub async fn all_sync_status(&self) -> Vec<BackendSyncStatus> {
        self.sync.read().await.values().cloned().collect()
    }

    /// Clear all rows.
    pub async fn clear(&self) {
        self.traces.write().await.clear();
        self.spans.write().await.clear();
        self.events.write().await.clear();
        self.sync.write().await.clear();
    }

    /// Export every row as pretty JSON.
    pub async fn export_json(&self) -> Result<String, serde_json::Error> {
        let traces = self.traces.read().await;
        let spans = self.spans.read().await;
        let events = self.events.read().await;
        let sync = self.sync.read().await;

        let mut trace_rows: Vec<_> = traces.values().collect();
        trace_rows.sort_by_key(|t| t.started_at);
        let mut span_rows: Vec<_> = spans.values().collect();
        span_rows.sort_by_key(|s| s.started_at);

        serde_json::to_string_pretty(&Export {
            traces: trace_rows,
            spans: span_rows,
            events: &events,
            sync_status: sync.values().collect(),
        })
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn insert_trace(&self, trace: TraceRecord) -> Result<(), StoreError> {
        let mut traces = self.traces.write().await;
        if traces.contains_key(&trace.trace_id) {
            return Err(StoreError::Duplicate {
                entity: "trace",
                id: trace.trace_id.to_string(),
            });
        }
        traces.insert(trace.trace_id.clone(), trace);
        Ok(())
    }

    async fn complete_trace(
        &self,
        trace_id: &TraceId,
        completion: Completion,
        metadata: Option<Metadata>,
    ) -> Result<(), StoreError> {
        let mut traces = self.traces.write().await;
        let trace = traces
            .get_mut(trace_id)
            .ok_or_else(|| StoreError::TraceNotFound(trace_id.to_string()))?;

        if trace.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "trace",
                id: trace_id.to_string(),
                status: trace.status,
            });
        }

        trace.status = completion.status;
        trace.ended_at = Some(completion.ended_at);
        trace.duration_ms = Some(completion.duration_ms);
        trace.error_message = completion.error_message;
        if let Some(metadata) = metadata {
            trace.metadata.extend(metadata);
        }
        Ok(())
    }

    async fn add_trace_counters(
        &self,
        trace_id: &TraceId,
        delta: &TraceCounters,
    ) -> Result<(), StoreError> {
        let mut traces = self.traces.write().await;
        let trace = traces
            .get_mut(trace_id)
            .ok_or_else(|| StoreError::TraceNotFound(trace_id.to_string()))?;
        trace.counters.add(delta);
        Ok(())
    }

    async fn insert_span(&self, span: SpanRecord) -> Result<(), StoreError> {
        let mut spans = self.spans.write().await;
        if spans.contains_key(&span.span_id) {
            return Err(StoreError::Duplicate {
                entity: "span",
                id: span.span_id.to_string(),
            });
        }
        spans.insert(span.span_id.clone(), span);
        Ok(())
    }

    async fn complete_span(
        &self,
        span_id: &SpanId,
        completion: Completion,
        metrics: SpanMetrics,
    ) -> Result<(), StoreError> {
        let mut spans = self.spans.write().await;
        let span = spans
            .get_mut(span_id)
            .ok_or_else(|| StoreError::SpanNotFound(span_id.to_string()))?;

        if span.status.is_terminal() {
            return Err(StoreError::TerminalState {
                entity: "span",
                id: span_id.to_string(),
                status: span.status,
            });
        }

        span.status = completion.status;
        span.ended_at = Some(completion.ended_at);
        span.duration_ms = Some(completion.duration_ms);
        span.error_message = completion.error_message;
        if !metrics.is_empty() {
            span.metrics = metrics;
        }
        Ok(())
    }

    async fn insert_event(&self, event: EventRecord) -> Result<(), StoreError> {
        self.events.write().await.push(event);
        Ok(())
    }

    async fn upsert_sync_status(
        &self,
        update: SyncStatusUpdate,
    ) -> Result<BackendSyncStatus, StoreError> {
        let key = (
            update.backend_name.clone(),
            update.entity_type,
            update.entity_id.clone(),
        );
        let failed = update.sync_status == SyncState::Failed;

        let mut sync = self.sync.write().await;
        let row = sync.entry(key).or_insert_with(|| BackendSyncStatus {
            backend_name: update.backend_name,
            entity_type: update.entity_type,
            entity_id: update.entity_id,
            sync_status: SyncState::Pending,
            retry_count: 0,
            last_error: None,
            updated_at: Utc::now(),
        });

        row.sync_status = update.sync_status;
        row.updated_at = Utc::now();
        if failed {
            row.retry_count += 1;
            row.last_error = update.error;
        }
        Ok(row.clone())
    }

    async fn get_trace(&self, trace_id: &TraceId) -> Result<Option<TraceRecord>, StoreError> {
        Ok(self.traces.read().await.get(trace_id).cloned())
    }

    async fn get_span(&self, span_id: &SpanId) -> Result<Option<SpanRecord>, StoreError> {
        Ok(self.spans.read().await.get(span_id).cloned())
    }

    async fn spans_for_trace(&self, trace_id: &TraceId) -> Result<Vec<SpanRecord>, StoreError> {
        let mut spans: Vec<_> = self
            .spans
            .read()
            .await
            .values()
            .filter(|s| &s.trace_id == trace_id)
            .cloned()
            .collect();
        spans.sort_by_key(|s| s.started_at);
        Ok(spans)
    }

    async fn events_for_trace(&self, trace_id: &TraceId) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .events
            .read()
            .await
            .iter()
            .filter(|e| &e.trace_id == trace_id)
            .cloned()
            .collect())
    }

    async fn sync_status(
        &self,
        backend_name: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<BackendSyncStatus>, StoreError> {
        let key = (backend_name.to_string(), entity_type, entity_id.to_string());
        Ok(self.sync.read().await.get(&key).cloned())
    }
}
