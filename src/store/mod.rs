//! Persisted telemetry store boundary.
//!
//! The store holds two primary tables (traces, spans) written in two phases:
//! an `in_progress` insert at start and a single terminal update by primary
//! key at end. Events and external sync diagnostics live alongside them.
//! Schema, migrations and retention belong to the concrete store.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ids::{SpanId, TraceId};
use crate::model::{
    BackendSyncStatus, Completion, EntityType, EventRecord, Metadata, SpanMetrics, SpanRecord,
    SyncStatusUpdate, TraceCounters, TraceRecord,
};

/// Durable storage for traces, spans, events and sync diagnostics.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    async fn insert_trace(&self, trace: TraceRecord) -> Result<(), StoreError>;

    /// Move a trace from `in_progress` to a terminal state.
    ///
    /// Fails with [`StoreError::TerminalState`] if it already left `in_progress`.
    async fn complete_trace(
        &self,
        trace_id: &TraceId,
        completion: Completion,
        metadata: Option<Metadata>,
    ) -> Result<(), StoreError>;

    async fn add_trace_counters(
        &self,
        trace_id: &TraceId,
        delta: &TraceCounters,
    ) -> Result<(), StoreError>;

    async fn insert_span(&self, span: SpanRecord) -> Result<(), StoreError>;

    /// Move a span from `in_progress` to a terminal state.
    async fn complete_span(
        &self,
        span_id: &SpanId,
        completion: Completion,
        metrics: SpanMetrics,
    ) -> Result<(), StoreError>;

    async fn insert_event(&self, event: EventRecord) -> Result<(), StoreError>;

    /// Insert or update the sync-status row for one entity.
    ///
    /// A `Failed` update increments `retry_count`.
    async fn upsert_sync_status(
        &self,
        update: SyncStatusUpdate,
    ) -> Result<BackendSyncStatus, StoreError>;

    async fn get_trace(&self, trace_id: &TraceId) -> Result<Option<TraceRecord>, StoreError>;

    async fn get_span(&self, span_id: &SpanId) -> Result<Option<SpanRecord>, StoreError>;

    async fn spans_for_trace(&self, trace_id: &TraceId) -> Result<Vec<SpanRecord>, StoreError>;

    async fn events_for_trace(&self, trace_id: &TraceId) -> Result<Vec<EventRecord>, StoreError>;

    async fn sync_status(
        &self,
        backend_name: &str,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Option<BackendSyncStatus>, StoreError>;
}
