//! Backend forwarding telemetry to the external vendor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::client::{
    BatchingClient, ExternalClient, ExternalCredentials, RemoteSpanHandle, RemoteTraceHandle,
    SpoolTransport,
};
use crate::backend::TelemetryBackend;
use crate::backends::truncate_chars;
use crate::config::ExternalConfig;
use crate::error::{ExternalError, TelemetryError};
use crate::ids::{SpanId, TraceId};
use crate::model::{
    EntityType, EventLog, ModelCall, SpanEnd, SpanStart, SyncState, SyncStatusUpdate, TraceEnd,
    TraceStart,
};
use crate::shutdown::{DrainResult, FlushTracker};
use crate::store::TelemetryStore;

pub const EXTERNAL_BACKEND_NAME: &str = "external";

/// Sync-status rows keep at most this much of an error message.
const MAX_SYNC_ERROR_CHARS: usize = 500;

/// What an offloaded flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushOutcome {
    /// The client sent this many events.
    Flushed(usize),
    /// Another flush held the slot; nothing was sent.
    Skipped,
}

/// Tunables for the external backend.
#[derive(Debug, Clone)]
pub struct ExternalSettings {
    /// Upper bound on one offloaded flush.
    pub flush_timeout: Duration,
    /// Flushes allowed on the blocking pool at once.
    pub max_in_flight_flushes: u32,
}

impl Default for ExternalSettings {
    fn default() -> Self {
        Self {
            flush_timeout: Duration::from_secs(5),
            max_in_flight_flushes: 1,
        }
    }
}

/// Forwards lifecycle events to an [`ExternalClient`].
///
/// Disabled for the life of the process when no client could be built.
/// Remote handles are cached per trace so spans, generations and events
/// under one trace reuse the same remote object.
pub struct ExternalSyncBackend {
    client: Option<Arc<dyn ExternalClient>>,
    traces: DashMap<TraceId, RemoteTraceHandle>,
    spans: DashMap<SpanId, RemoteSpanHandle>,
    status_store: Option<Arc<dyn TelemetryStore>>,
    settings: ExternalSettings,
    flushes: FlushTracker,
}

impl ExternalSyncBackend {
    pub fn new(client: Arc<dyn ExternalClient>, settings: ExternalSettings) -> Self {
        Self::build(Some(client), settings)
    }

    /// A backend that never takes part in fan-out.
    pub fn disabled() -> Self {
        Self::build(None, ExternalSettings::default())
    }

    fn build(client: Option<Arc<dyn ExternalClient>>, settings: ExternalSettings) -> Self {
        let flushes = FlushTracker::new(settings.max_in_flight_flushes);
        Self {
            client,
            traces: DashMap::new(),
            spans: DashMap::new(),
            status_store: None,
            settings,
            flushes,
        }
    }

    /// Build from configuration. Missing credentials or a client that fails
    /// to initialize yield a disabled backend.
    pub fn from_config(config: &ExternalConfig) -> Self {
        let (Some(host), Some(public_key), Some(secret_key)) = (
            config.host.clone(),
            config.public_key.clone(),
            config.secret_key.clone(),
        ) else {
            info!(
                backend = EXTERNAL_BACKEND_NAME,
                "External telemetry not configured; backend disabled"
            );
            return Self::disabled();
        };

        let credentials = ExternalCredentials {
            host,
            public_key,
            secret_key,
        };
        let client = SpoolTransport::new(&config.spool_dir)
            .and_then(|transport| BatchingClient::new(credentials, Box::new(transport)));

        match client {
            Ok(client) => {
                info!(
                    backend = EXTERNAL_BACKEND_NAME,
                    spool_dir = %config.spool_dir.display(),
                    "External telemetry enabled"
                );
                Self::new(
                    Arc::new(client),
                    ExternalSettings {
                        flush_timeout: config.flush_timeout,
                        ..Default::default()
                    },
                )
            }
            Err(e) => {
                warn!(
                    backend = EXTERNAL_BACKEND_NAME,
                    error = %e,
                    "External telemetry client failed to initialize; backend disabled"
                );
                Self::disabled()
            }
        }
    }

    /// Record per-entity sync outcomes into `store`.
    pub fn with_status_store(mut self, store: Arc<dyn TelemetryStore>) -> Self {
        self.status_store = Some(store);
        self
    }

    pub fn cached_trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn has_cached_trace(&self, trace_id: &TraceId) -> bool {
        self.traces.contains_key(trace_id)
    }

    pub fn in_flight_flushes(&self) -> u32 {
        self.flushes.in_flight_count()
    }

    fn client(&self) -> Result<&Arc<dyn ExternalClient>, TelemetryError> {
        self.client
            .as_ref()
            .ok_or_else(|| TelemetryError::Disabled(EXTERNAL_BACKEND_NAME.into()))
    }

    /// Cached handle for `trace_id`, creating the remote trace on a miss.
    fn trace_handle(&self, trace_id: &TraceId) -> Result<RemoteTraceHandle, TelemetryError> {
        if let Some(handle) = self.traces.get(trace_id) {
            return Ok(handle.clone());
        }

        let client = self.client()?;
        let handle = self
            .traces
            .entry(trace_id.clone())
            .or_try_insert_with(|| {
                debug!(trace_id = %trace_id, "Remote trace missing from cache; creating");
                client.create_trace(&TraceStart {
                    trace_id: trace_id.clone(),
                    name: "trace".into(),
                    timestamp: chrono::Utc::now(),
                    user_id: None,
                    session_id: None,
                    kb_id: None,
                    metadata: None,
                })
            })?;
        Ok(handle.clone())
    }

    /// Write a sync-status row. Failures here are logged and go no further.
    async fn record_status(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        state: SyncState,
        error: Option<&TelemetryError>,
    ) {
        let Some(store) = &self.status_store else {
            return;
        };
        let update = SyncStatusUpdate {
            backend_name: EXTERNAL_BACKEND_NAME.into(),
            entity_type,
            entity_id: entity_id.to_string(),
            sync_status: state,
            error: error.map(|e| truncate_chars(&e.to_string(), MAX_SYNC_ERROR_CHARS)),
        };
        if let Err(e) = store.upsert_sync_status(update).await {
            warn!(
                backend = EXTERNAL_BACKEND_NAME,
                entity_type = entity_type.as_str(),
                entity_id,
                error = %e,
                "Sync status write failed"
            );
        }
    }

    async fn record_outcome<T>(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        success: SyncState,
        result: &Result<T, TelemetryError>,
    ) {
        match result {
            Ok(_) => self.record_status(entity_type, entity_id, success, None).await,
            Err(e) => {
                self.record_status(entity_type, entity_id, SyncState::Failed, Some(e))
                    .await
            }
        }
    }

    /// Run the client's blocking flush on the blocking pool, bounded by the
    /// configured timeout. A flush that overruns is abandoned, not retried.
    async fn offloaded_flush(&self) -> Result<FlushOutcome, TelemetryError> {
        let client = self.client()?.clone();
        let Some(slot) = self.flushes.try_track() else {
            debug!(
                backend = EXTERNAL_BACKEND_NAME,
                "Flush already in flight; skipping"
            );
            return Ok(FlushOutcome::Skipped);
        };

        // Only the client moves into the closure; the handle cache stays here.
        let task = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            client.flush()
        });

        let timeout = self.settings.flush_timeout;
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(sent))) => {
                debug!(backend = EXTERNAL_BACKEND_NAME, events = sent, "External flush complete");
                Ok(FlushOutcome::Flushed(sent))
            }
            Ok(Ok(Err(e))) => Err(e.into()),
            Ok(Err(join_error)) => Err(TelemetryError::Join(join_error.to_string())),
            Err(_) => {
                metrics::counter!("telemetry_external_flush_abandoned_total").increment(1);
                warn!(
                    backend = EXTERNAL_BACKEND_NAME,
                    timeout_ms = timeout.as_millis() as u64,
                    "External flush exceeded timeout; abandoned"
                );
                Err(TelemetryError::FlushTimeout(timeout))
            }
        }
    }
}

#[async_trait]
impl TelemetryBackend for ExternalSyncBackend {
    fn name(&self) -> &str {
        EXTERNAL_BACKEND_NAME
    }

    fn enabled(&self) -> bool {
        self.client.is_some()
    }

    async fn start_trace(&self, trace: &TraceStart) -> Result<Option<String>, TelemetryError> {
        let result = self
            .client()
            .and_then(|client| client.create_trace(trace).map_err(TelemetryError::from));
        let result = result.map(|handle| {
            self.traces.insert(trace.trace_id.clone(), handle);
        });

        self.record_outcome(
            EntityType::Trace,
            trace.trace_id.as_str(),
            SyncState::Pending,
            &result,
        )
        .await;
        result.map(|_| None)
    }

    async fn end_trace(&self, trace: &TraceEnd) -> Result<(), TelemetryError> {
        let update = self.trace_handle(&trace.trace_id).and_then(|handle| {
            self.client()?
                .update_trace(&handle, trace)
                .map_err(TelemetryError::from)
        });

        self.traces.remove(&trace.trace_id);
        self.spans.retain(|_, span| span.trace_id != trace.trace_id);

        if let Err(e) = update {
            self.record_status(EntityType::Trace, trace.trace_id.as_str(), SyncState::Failed, Some(&e))
                .await;
            return Err(e);
        }

        // Flush problems are recorded and logged; the trace update itself succeeded.
        let flushed = self.offloaded_flush().await;
        if let Err(e) = &flushed {
            warn!(
                backend = EXTERNAL_BACKEND_NAME,
                trace_id = %trace.trace_id,
                error = %e,
                "External flush failed"
            );
        }
        // A skipped flush leaves the trace buffered, so it stays pending.
        let success = match flushed {
            Ok(FlushOutcome::Skipped) => SyncState::Pending,
            _ => SyncState::Synced,
        };
        self.record_outcome(EntityType::Trace, trace.trace_id.as_str(), success, &flushed)
            .await;
        Ok(())
    }

    async fn start_span(&self, span: &SpanStart) -> Result<(), TelemetryError> {
        let result = self.trace_handle(&span.trace_id).and_then(|trace| {
            self.client()?
                .create_span(&trace, span)
                .map_err(TelemetryError::from)
        });
        let result = result.map(|handle| {
            self.spans.insert(span.span_id.clone(), handle);
        });

        self.record_outcome(EntityType::Span, span.span_id.as_str(), SyncState::Pending, &result)
            .await;
        result
    }

    async fn end_span(&self, span: &SpanEnd) -> Result<(), TelemetryError> {
        let result = match self.spans.remove(&span.span_id) {
            Some((_, handle)) => self
                .client()
                .and_then(|client| client.update_span(&handle, span).map_err(TelemetryError::from)),
            None => Err(TelemetryError::External(ExternalError::Rejected(format!(
                "unknown span {}",
                span.span_id
            )))),
        };

        self.record_outcome(EntityType::Span, span.span_id.as_str(), SyncState::Synced, &result)
            .await;
        result
    }

    async fn log_model_call(&self, call: &ModelCall) -> Result<SpanId, TelemetryError> {
        let result = self.trace_handle(&call.trace_id).and_then(|trace| {
            self.client()?
                .create_generation(&trace, call)
                .map_err(TelemetryError::from)
        });

        if let Err(e) = &result {
            warn!(
                backend = EXTERNAL_BACKEND_NAME,
                trace_id = %call.trace_id,
                span_id = %call.span_id,
                error = %e,
                "Generation not forwarded"
            );
        }
        self.record_outcome(
            EntityType::Generation,
            call.span_id.as_str(),
            SyncState::Synced,
            &result,
        )
        .await;
        Ok(call.span_id.clone())
    }

    async fn log_event(&self, event: &EventLog) -> Result<(), TelemetryError> {
        let result = self.trace_handle(&event.trace_id).and_then(|trace| {
            self.client()?
                .create_event(&trace, event)
                .map_err(TelemetryError::from)
        });

        match &result {
            Ok(event_id) => {
                self.record_status(EntityType::Event, event_id, SyncState::Synced, None)
                    .await
            }
            Err(e) => {
                let entity_id = format!("{}:{}", event.trace_id, event.kind);
                self.record_status(EntityType::Event, &entity_id, SyncState::Failed, Some(e))
                    .await
            }
        }
        result.map(|_| ())
    }

    async fn flush(&self) -> Result<(), TelemetryError> {
        if let DrainResult::Timeout { remaining } =
            self.flushes.wait_for_drain(self.settings.flush_timeout).await
        {
            warn!(
                backend = EXTERNAL_BACKEND_NAME,
                remaining, "Previous flushes still running at shutdown"
            );
        }
        self.offloaded_flush().await.map(|_| ())
    }
}
