//! Tests for the external sync backend.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use pipeline_telemetry::backend::TelemetryBackend;
use pipeline_telemetry::backends::PersistedStoreBackend;
use pipeline_telemetry::config::ExternalConfig;
use pipeline_telemetry::error::ExternalError;
use pipeline_telemetry::external::{
    ExternalClient, ExternalSettings, ExternalSyncBackend, IngestionBatch, IngestionEvent,
    RemoteSpanHandle, RemoteTraceHandle, SpoolTransport,
};
use pipeline_telemetry::model::{
    EntityType, EventLog, ModelCall, SpanEnd, SpanStart, SyncState, TraceEnd, TraceStart,
};
use pipeline_telemetry::store::{MemoryStore, TelemetryStore};
use pipeline_telemetry::{ModelCallParams, SpanType, Status, TelemetryService, TraceOptions};

/// Vendor client double with scripted latency and failures.
#[derive(Default)]
struct ScriptedClient {
    trace_creates: AtomicUsize,
    span_creates: AtomicUsize,
    generations: AtomicUsize,
    events: AtomicUsize,
    flushes: AtomicUsize,
    flush_delay: Option<Duration>,
    fail_flush: bool,
    fail_events: AtomicBool,
}

impl ScriptedClient {
    fn slow_flush(delay: Duration) -> Self {
        Self {
            flush_delay: Some(delay),
            ..Default::default()
        }
    }

    fn failing_flush() -> Self {
        Self {
            fail_flush: true,
            ..Default::default()
        }
    }
}

impl ExternalClient for ScriptedClient {
    fn create_trace(&self, trace: &TraceStart) -> Result<RemoteTraceHandle, ExternalError> {
        self.trace_creates.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteTraceHandle {
            trace_id: trace.trace_id.clone(),
            remote_id: format!("remote-{}", trace.trace_id),
        })
    }

    fn update_trace(&self, _: &RemoteTraceHandle, _: &TraceEnd) -> Result<(), ExternalError> {
        Ok(())
    }

    fn create_span(
        &self,
        trace: &RemoteTraceHandle,
        span: &SpanStart,
    ) -> Result<RemoteSpanHandle, ExternalError> {
        self.span_creates.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteSpanHandle {
            span_id: span.span_id.clone(),
            trace_id: trace.trace_id.clone(),
            remote_id: format!("remote-{}", span.span_id),
        })
    }

    fn update_span(&self, _: &RemoteSpanHandle, _: &SpanEnd) -> Result<(), ExternalError> {
        Ok(())
    }

    fn create_generation(
        &self,
        trace: &RemoteTraceHandle,
        call: &ModelCall,
    ) -> Result<RemoteSpanHandle, ExternalError> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteSpanHandle {
            span_id: call.span_id.clone(),
            trace_id: trace.trace_id.clone(),
            remote_id: format!("remote-{}", call.span_id),
        })
    }

    fn create_event(&self, _: &RemoteTraceHandle, _: &EventLog) -> Result<String, ExternalError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(ExternalError::Rejected("event schema mismatch".into()));
        }
        let n = self.events.fetch_add(1, Ordering::SeqCst);
        Ok(format!("event-{}", n))
    }

    fn flush(&self) -> Result<usize, ExternalError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.flush_delay {
            std::thread::sleep(delay);
        }
        if self.fail_flush {
            return Err(ExternalError::Transport("connection refused".into()));
        }
        Ok(0)
    }
}

fn settings(flush_timeout: Duration) -> ExternalSettings {
    ExternalSettings {
        flush_timeout,
        ..Default::default()
    }
}

fn build(
    client: ScriptedClient,
    flush_timeout: Duration,
) -> (Arc<ScriptedClient>, Arc<ExternalSyncBackend>, Arc<MemoryStore>) {
    let client = Arc::new(client);
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(
        ExternalSyncBackend::new(client.clone(), settings(flush_timeout))
            .with_status_store(store.clone()),
    );
    (client, backend, store)
}

fn service_for(backend: &Arc<ExternalSyncBackend>) -> TelemetryService {
    TelemetryService::new(vec![backend.clone() as Arc<dyn TelemetryBackend>])
}

fn config_with(dir: PathBuf, host: Option<&str>, key: Option<&str>) -> ExternalConfig {
    ExternalConfig {
        host: host.map(str::to_string),
        public_key: key.map(str::to_string),
        secret_key: key.map(|k| format!("{}-secret", k)),
        spool_dir: dir,
        flush_timeout: Duration::from_secs(2),
    }
}

// ============================================================================
// Enablement
// ============================================================================

#[tokio::test]
async fn test_missing_credentials_disable_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ExternalSyncBackend::from_config(&config_with(dir.path().into(), None, None));
    assert!(!backend.enabled());

    let store = Arc::new(MemoryStore::new());
    let backends: Vec<Arc<dyn TelemetryBackend>> = vec![
        Arc::new(PersistedStoreBackend::new(store.clone())),
        Arc::new(backend),
    ];
    let service = TelemetryService::new(backends);
    assert_eq!(service.backend_names(), vec!["store"]);
}

#[tokio::test]
async fn test_invalid_host_disables_backend() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ExternalSyncBackend::from_config(&config_with(
        dir.path().into(),
        Some("ftp://ingest.example.com"),
        Some("pk"),
    ));
    assert!(!backend.enabled());
}

#[tokio::test]
async fn test_disabled_backend_reports_disabled() {
    let backend = ExternalSyncBackend::disabled();
    let ctx = pipeline_telemetry::TraceContext::new_root(None, None, None);
    let result = backend
        .start_trace(&TraceStart {
            trace_id: ctx.trace_id.clone(),
            name: "chat".into(),
            timestamp: ctx.timestamp,
            user_id: None,
            session_id: None,
            kb_id: None,
            metadata: None,
        })
        .await;
    assert!(result.is_err());
}

// ============================================================================
// Handle cache
// ============================================================================

#[tokio::test]
async fn test_handles_reused_within_trace_and_cleared_on_end() {
    let (client, backend, _store) = build(ScriptedClient::default(), Duration::from_secs(1));
    let service = service_for(&backend);

    let ctx = service.start_trace("chat", TraceOptions::default()).await;
    assert!(backend.has_cached_trace(&ctx.trace_id));

    let outer = service.enter_span(&ctx, "answer", SpanType::Generation).await;
    let _: Result<(), std::io::Error> = service
        .span(outer.context(), "retrieve", SpanType::Retrieval, |_| async { Ok(()) })
        .await;
    service
        .log_model_call(outer.context(), ModelCallParams::new("llm", "gpt-4"))
        .await;
    service
        .log_event(outer.context(), "chat_message", json!({"content": "hi"}))
        .await;
    outer.complete().await;

    assert_eq!(client.trace_creates.load(Ordering::SeqCst), 1);
    assert_eq!(client.span_creates.load(Ordering::SeqCst), 2);
    assert_eq!(client.generations.load(Ordering::SeqCst), 1);
    assert_eq!(client.events.load(Ordering::SeqCst), 1);

    service.end_trace(&ctx, Status::Completed, None, None).await;
    assert!(!backend.has_cached_trace(&ctx.trace_id));
    assert_eq!(backend.cached_trace_count(), 0);
    assert_eq!(client.flushes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cache_miss_creates_remote_trace_once() {
    let (client, backend, _store) = build(ScriptedClient::default(), Duration::from_secs(1));
    let ctx = pipeline_telemetry::TraceContext::new_root(None, None, None);

    for n in 0..3 {
        backend
            .log_event(&EventLog {
                trace_id: ctx.trace_id.clone(),
                span_id: None,
                kind: format!("step-{}", n),
                payload: json!({}),
                timestamp: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    assert_eq!(client.trace_creates.load(Ordering::SeqCst), 1);
    assert_eq!(backend.cached_trace_count(), 1);
}

#[tokio::test]
async fn test_concurrent_traces_do_not_share_handles() {
    let (client, backend, _store) = build(ScriptedClient::default(), Duration::from_secs(1));
    let service = Arc::new(service_for(&backend));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            tokio::spawn(async move {
                let ctx = service.start_trace("chat", TraceOptions::default()).await;
                let _: Result<(), std::io::Error> = service
                    .span(&ctx, "retrieve", SpanType::Retrieval, |_| async { Ok(()) })
                    .await;
                service.end_trace(&ctx, Status::Completed, None, None).await;
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(client.trace_creates.load(Ordering::SeqCst), 8);
    assert_eq!(backend.cached_trace_count(), 0);
}

// ============================================================================
// Flush
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_flush_is_abandoned_and_recorded() {
    let (client, backend, store) = build(
        ScriptedClient::slow_flush(Duration::from_millis(400)),
        Duration::from_millis(50),
    );
    let service = service_for(&backend);
    let ctx = service.start_trace("chat", TraceOptions::default()).await;

    let started = Instant::now();
    service.end_trace(&ctx, Status::Completed, None, None).await;
    assert!(
        started.elapsed() < Duration::from_millis(350),
        "end_trace waited {:?}",
        started.elapsed()
    );
    assert_eq!(client.flushes.load(Ordering::SeqCst), 1);

    let status = store
        .sync_status("external", EntityType::Trace, ctx.trace_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.sync_status, SyncState::Failed);
    assert_eq!(status.retry_count, 1);
    assert!(status.last_error.unwrap().contains("timed out"));
    assert!(!backend.has_cached_trace(&ctx.trace_id));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_busy_flusher_skips_second_flush() {
    let (client, backend, store) = build(
        ScriptedClient::slow_flush(Duration::from_millis(300)),
        Duration::from_millis(50),
    );
    let service = service_for(&backend);

    let first = service.start_trace("a", TraceOptions::default()).await;
    let second = service.start_trace("b", TraceOptions::default()).await;
    service.end_trace(&first, Status::Completed, None, None).await;
    assert_eq!(backend.in_flight_flushes(), 1);
    service.end_trace(&second, Status::Completed, None, None).await;

    assert_eq!(client.flushes.load(Ordering::SeqCst), 1);

    // Nothing was sent for the second trace, so it must not read as synced.
    let status = store
        .sync_status("external", EntityType::Trace, second.trace_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.sync_status, SyncState::Pending);
    assert_eq!(status.retry_count, 0);
    assert!(status.last_error.is_none());
}

#[tokio::test]
async fn test_failed_flush_recorded_without_raising() {
    let (_client, backend, store) = build(ScriptedClient::failing_flush(), Duration::from_secs(1));
    let ctx = pipeline_telemetry::TraceContext::new_root(None, None, None);

    backend
        .start_trace(&TraceStart {
            trace_id: ctx.trace_id.clone(),
            name: "chat".into(),
            timestamp: ctx.timestamp,
            user_id: None,
            session_id: None,
            kb_id: None,
            metadata: None,
        })
        .await
        .unwrap();
    let pending = store
        .sync_status("external", EntityType::Trace, ctx.trace_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.sync_status, SyncState::Pending);

    let end = backend
        .end_trace(&TraceEnd {
            trace_id: ctx.trace_id.clone(),
            timestamp: chrono::Utc::now(),
            status: Status::Completed,
            duration_ms: 5,
            error_message: None,
            metadata: None,
        })
        .await;
    assert!(end.is_ok());

    let status = store
        .sync_status("external", EntityType::Trace, ctx.trace_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.sync_status, SyncState::Failed);
    assert!(status.last_error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_shutdown_flush_drains_then_flushes() {
    let (client, backend, _store) = build(ScriptedClient::default(), Duration::from_secs(1));
    let service = service_for(&backend);

    service.flush().await;
    assert_eq!(client.flushes.load(Ordering::SeqCst), 1);
    assert_eq!(backend.in_flight_flushes(), 0);
}

// ============================================================================
// Sync status
// ============================================================================

#[tokio::test]
async fn test_repeated_failures_increment_retry_count() {
    let (client, backend, store) = build(ScriptedClient::default(), Duration::from_secs(1));
    client.fail_events.store(true, Ordering::SeqCst);
    let service = service_for(&backend);
    let ctx = service.start_trace("chat", TraceOptions::default()).await;

    for _ in 0..3 {
        service
            .log_event(&ctx, "chat_message", json!({"content": "hi"}))
            .await;
    }

    let entity_id = format!("{}:chat_message", ctx.trace_id);
    let status = store
        .sync_status("external", EntityType::Event, &entity_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.sync_status, SyncState::Failed);
    assert_eq!(status.retry_count, 3);
    assert!(status.last_error.unwrap().contains("event schema mismatch"));
}

#[tokio::test]
async fn test_span_and_generation_status_rows() {
    let (_client, backend, store) = build(ScriptedClient::default(), Duration::from_secs(1));
    let service = service_for(&backend);
    let ctx = service.start_trace("chat", TraceOptions::default()).await;

    let span = service.enter_span(&ctx, "retrieve", SpanType::Retrieval).await;
    let span_id = span.span_id().clone();
    let pending = store
        .sync_status("external", EntityType::Span, span_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pending.sync_status, SyncState::Pending);
    span.complete().await;

    let synced = store
        .sync_status("external", EntityType::Span, span_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(synced.sync_status, SyncState::Synced);
    assert_eq!(synced.retry_count, 0);

    let generation_id = service
        .log_model_call(&ctx, ModelCallParams::new("llm", "gpt-4"))
        .await;
    let generation = store
        .sync_status("external", EntityType::Generation, generation_id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(generation.sync_status, SyncState::Synced);
}

// ============================================================================
// Spool
// ============================================================================

#[tokio::test]
async fn test_configured_backend_spools_batches() {
    let dir = tempfile::tempdir().unwrap();
    let backend = ExternalSyncBackend::from_config(&config_with(
        dir.path().into(),
        Some("https://ingest.example.com"),
        Some("pk-test"),
    ));
    assert!(backend.enabled());
    let service = TelemetryService::new(vec![Arc::new(backend)]);

    let ctx = service
        .start_trace("chat", TraceOptions::default().user_id("u1"))
        .await;
    let _: Result<(), std::io::Error> = service
        .span(&ctx, "retrieve", SpanType::Retrieval, |_| async { Ok(()) })
        .await;
    service
        .log_model_call(&ctx, ModelCallParams::new("llm", "gpt-4").tokens(12, 3))
        .await;
    service.end_trace(&ctx, Status::Completed, None, None).await;

    let content =
        std::fs::read_to_string(dir.path().join(SpoolTransport::FILE_NAME)).unwrap();
    let batches: Vec<IngestionBatch> = content
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].host, "https://ingest.example.com");
    assert_eq!(batches[0].public_key, "pk-test");
    assert!(!content.contains("pk-test-secret"));
    assert!(!content.contains("secret_key"));

    let kinds: Vec<&str> = batches[0]
        .events
        .iter()
        .map(|e| match e {
            IngestionEvent::TraceCreate { .. } => "trace-create",
            IngestionEvent::TraceUpdate { .. } => "trace-update",
            IngestionEvent::SpanCreate { .. } => "span-create",
            IngestionEvent::SpanUpdate { .. } => "span-update",
            IngestionEvent::GenerationCreate { .. } => "generation-create",
            IngestionEvent::EventCreate { .. } => "event-create",
        })
        .collect();
    assert_eq!(
        kinds,
        vec![
            "trace-create",
            "span-create",
            "span-update",
            "generation-create",
            "trace-update"
        ]
    );
}
