//! Telemetry orchestrator.
//!
//! [`TelemetryService`] fans every lifecycle event out to all enabled
//! backends. Each backend call is guarded on its own: an `Err` or a panic is
//! logged with the backend name and operation, then dropped, so neither the
//! caller nor the sibling backends ever observe it.

mod global;
mod span;

pub use global::{default_backends, init_from_config, init_telemetry, reset_telemetry, telemetry};
pub use span::ActiveSpan;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::backend::TelemetryBackend;
use crate::context::TraceContext;
use crate::error::TelemetryError;
use crate::ids::{generate_span_id, SpanId};
use crate::model::{EventLog, Metadata, ModelCall, SpanEnd, Status, TraceEnd, TraceStart};

pub(crate) type Backends = Arc<[Arc<dyn TelemetryBackend>]>;

/// Optional correlation attributes for a new trace.
#[derive(Debug, Clone, Default)]
pub struct TraceOptions {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kb_id: Option<String>,
    pub metadata: Option<Metadata>,
}

impl TraceOptions {
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn kb_id(mut self, kb_id: impl Into<String>) -> Self {
        self.kb_id = Some(kb_id.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Parameters of a completed model call.
#[derive(Debug, Clone)]
pub struct ModelCallParams {
    pub name: String,
    pub model: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub duration_ms: Option<u64>,
    pub status: Status,
    pub error_message: Option<String>,
    pub input_preview: Option<String>,
    pub output_preview: Option<String>,
    pub metadata: Option<Metadata>,
}

impl ModelCallParams {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            input_tokens: None,
            output_tokens: None,
            duration_ms: None,
            status: Status::Completed,
            error_message: None,
            input_preview: None,
            output_preview: None,
            metadata: None,
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = Some(input);
        self.output_tokens = Some(output);
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn failed(mut self, error_message: impl Into<String>) -> Self {
        self.status = Status::Failed;
        self.error_message = Some(error_message.into());
        self
    }

    pub fn input_preview(mut self, text: impl Into<String>) -> Self {
        self.input_preview = Some(text.into());
        self
    }

    pub fn output_preview(mut self, text: impl Into<String>) -> Self {
        self.output_preview = Some(text.into());
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Fans lifecycle events out to the enabled backends.
pub struct TelemetryService {
    backends: Backends,
}

impl TelemetryService {
    /// Build from an ordered backend list. Disabled backends are dropped here
    /// and never consulted again.
    pub fn new(backends: Vec<Arc<dyn TelemetryBackend>>) -> Self {
        let (enabled, disabled): (Vec<_>, Vec<_>) =
            backends.into_iter().partition(|b| b.enabled());

        for backend in &disabled {
            debug!(backend = backend.name(), "Telemetry backend disabled; excluded from fan-out");
        }
        info!(
            backends = ?enabled.iter().map(|b| b.name()).collect::<Vec<_>>(),
            "Telemetry service initialized"
        );

        Self {
            backends: enabled.into(),
        }
    }

    pub fn backend_names(&self) -> Vec<&str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Begin a new trace and return its root context.
    ///
    /// The context carries the row id of the first backend that reported one.
    pub async fn start_trace(&self, name: &str, options: TraceOptions) -> TraceContext {
        let ctx = TraceContext::new_root(options.user_id, options.session_id, options.kb_id);
        let payload = TraceStart {
            trace_id: ctx.trace_id.clone(),
            name: name.to_string(),
            timestamp: ctx.timestamp,
            user_id: ctx.user_id.clone(),
            session_id: ctx.session_id.clone(),
            kb_id: ctx.kb_id.clone(),
            metadata: options.metadata,
        };

        let results = join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "start_trace", b.start_trace(&payload))),
        )
        .await;

        debug!(trace_id = %ctx.trace_id, name, "Trace started");
        match results.into_iter().flatten().flatten().next() {
            Some(row_id) => ctx.with_backend_row_id(row_id),
            None => ctx,
        }
    }

    /// Finish a trace. `InProgress` is not a valid end state and is recorded
    /// as `Completed`.
    pub async fn end_trace(
        &self,
        ctx: &TraceContext,
        status: Status,
        error_message: Option<String>,
        metadata: Option<Metadata>,
    ) {
        let status = if status.is_terminal() {
            status
        } else {
            warn!(trace_id = %ctx.trace_id, "end_trace called with in_progress; recording completed");
            Status::Completed
        };
        let payload = TraceEnd {
            trace_id: ctx.trace_id.clone(),
            timestamp: Utc::now(),
            status,
            duration_ms: ctx.elapsed_ms(),
            error_message,
            metadata,
        };

        join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "end_trace", b.end_trace(&payload))),
        )
        .await;

        debug!(
            trace_id = %ctx.trace_id,
            status = %status,
            duration_ms = payload.duration_ms,
            "Trace ended"
        );
    }

    /// Record a completed model call under `ctx`.
    ///
    /// The returned id is generated here, so it is valid even when every
    /// backend fails.
    pub async fn log_model_call(&self, ctx: &TraceContext, params: ModelCallParams) -> SpanId {
        let span_id = generate_span_id();
        let payload = ModelCall {
            span_id: span_id.clone(),
            trace_id: ctx.trace_id.clone(),
            parent_span_id: ctx.parent_span_id.clone(),
            name: params.name,
            model: params.model,
            timestamp: Utc::now(),
            input_tokens: params.input_tokens,
            output_tokens: params.output_tokens,
            duration_ms: params.duration_ms,
            status: params.status,
            error_message: params.error_message,
            input_preview: params.input_preview,
            output_preview: params.output_preview,
            metadata: params.metadata,
        };

        join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "log_model_call", b.log_model_call(&payload))),
        )
        .await;

        span_id
    }

    /// Record a domain event (chat message, ingestion step, ...) under `ctx`.
    pub async fn log_event(&self, ctx: &TraceContext, kind: &str, payload: Value) {
        let event = EventLog {
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.parent_span_id.clone(),
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };

        join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "log_event", b.log_event(&event))),
        )
        .await;
    }

    /// Ask every backend to push out buffered telemetry.
    pub async fn flush(&self) {
        join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "flush", b.flush())),
        )
        .await;
    }
}

pub(crate) async fn fan_out_end_span(backends: &[Arc<dyn TelemetryBackend>], end: &SpanEnd) {
    join_all(
        backends
            .iter()
            .map(|b| guarded(b.name(), "end_span", b.end_span(end))),
    )
    .await;
}

/// Await one backend call, absorbing its error or panic.
async fn guarded<T, F>(backend: &str, operation: &'static str, call: F) -> Option<T>
where
    F: Future<Output = Result<T, TelemetryError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            metrics::counter!(
                "telemetry_backend_failures_total",
                "backend" => backend.to_string(),
                "operation" => operation
            )
            .increment(1);
            warn!(
                backend,
                operation,
                transient = e.is_transient(),
                error = %e,
                "Telemetry backend call failed"
            );
            None
        }
        Err(panic) => {
            metrics::counter!(
                "telemetry_backend_failures_total",
                "backend" => backend.to_string(),
                "operation" => operation
            )
            .increment(1);
            error!(
                backend,
                operation,
                panic = %panic_message(panic.as_ref()),
                "Telemetry backend panicked"
            );
            None
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic");
    }

    #[test]
    fn test_model_call_params_builder() {
        let params = ModelCallParams::new("answer", "gpt-4")
            .tokens(100, 50)
            .duration_ms(1200)
            .failed("rate limited");
        assert_eq!(params.input_tokens, Some(100));
        assert_eq!(params.output_tokens, Some(50));
        assert_eq!(params.status, Status::Failed);
        assert_eq!(params.error_message.as_deref(), Some("rate limited"));
    }

    #[tokio::test]
    async fn test_guarded_absorbs_error_and_panic() {
        let ok = guarded("mock", "op", async { Ok::<_, TelemetryError>(5) }).await;
        assert_eq!(ok, Some(5));

        let err = guarded("mock", "op", async {
            Err::<u8, _>(TelemetryError::Disabled("mock".into()))
        })
        .await;
        assert_eq!(err, None);

        let panicked = guarded("mock", "op", async {
            if true {
                panic!("backend exploded");
            }
            Ok::<u8, TelemetryError>(1)
        })
        .await;
        assert_eq!(panicked, None);
    }

    #[tokio::test]
    async fn test_empty_service_is_inert() {
        let service = TelemetryService::new(Vec::new());
        let ctx = service.start_trace("noop", TraceOptions::default()).await;
        assert!(ctx.backend_row_id.is_none());
        let id = service
            .log_model_call(&ctx, ModelCallParams::new("call", "m"))
            .await;
        assert_eq!(id.as_str().len(), 16);
        service.end_trace(&ctx, Status::Completed, None, None).await;
    }
}
