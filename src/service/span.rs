//! Timed span scopes.
//!
//! [`TelemetryService::span`] wraps a future: the span is ended exactly once,
//! as `completed` on `Ok` or `failed` on `Err`/panic, and the wrapped
//! outcome is handed back to the caller untouched. [`ActiveSpan`] is the
//! guard form for code that cannot be expressed as one closure.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Instant;

use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{fan_out_end_span, guarded, panic_message, Backends, TelemetryService};
use crate::context::TraceContext;
use crate::ids::{generate_span_id, SpanId, TraceId};
use crate::model::{SpanEnd, SpanMetrics, SpanStart, SpanType, Status};

const DROPPED_MESSAGE: &str = "span dropped before completion";

impl TelemetryService {
    /// Run `body` inside a span named `name`.
    ///
    /// `body` receives the new span id. An `Err` is recorded as
    /// `"{ErrorType}: {message}"` and returned unchanged; a panic is recorded
    /// and then resumed.
    pub async fn span<T, E, F, Fut>(
        &self,
        ctx: &TraceContext,
        name: &str,
        span_type: SpanType,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(SpanId) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let active = self.enter_span(ctx, name, span_type).await;
        let span_id = active.span_id().clone();

        match AssertUnwindSafe(body(span_id)).catch_unwind().await {
            Ok(Ok(value)) => {
                active.complete().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                active.fail(&e).await;
                Err(e)
            }
            Err(panic) => {
                active
                    .fail_with(format!("panic: {}", panic_message(panic.as_ref())))
                    .await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Open a span and return its guard.
    pub async fn enter_span(
        &self,
        ctx: &TraceContext,
        name: &str,
        span_type: SpanType,
    ) -> ActiveSpan {
        let span_id = generate_span_id();
        let start = SpanStart {
            span_id: span_id.clone(),
            trace_id: ctx.trace_id.clone(),
            name: name.to_string(),
            span_type,
            parent_span_id: ctx.parent_span_id.clone(),
            timestamp: Utc::now(),
            metadata: None,
        };

        join_all(
            self.backends
                .iter()
                .map(|b| guarded(b.name(), "start_span", b.start_span(&start))),
        )
        .await;

        debug!(
            trace_id = %ctx.trace_id,
            span_id = %span_id,
            span_type = %span_type,
            name,
            "Span started"
        );

        ActiveSpan {
            backends: self.backends.clone(),
            child: ctx.child_context(&span_id),
            trace_id: ctx.trace_id.clone(),
            span_id,
            started_at: Instant::now(),
            metrics: SpanMetrics::default(),
            finished: false,
        }
    }
}

/// An open span. End it with [`complete`](Self::complete) or
/// [`fail`](Self::fail); dropping it unfinished records a failure.
pub struct ActiveSpan {
    backends: Backends,
    child: TraceContext,
    trace_id: TraceId,
    span_id: SpanId,
    started_at: Instant,
    metrics: SpanMetrics,
    finished: bool,
}

impl ActiveSpan {
    pub fn span_id(&self) -> &SpanId {
        &self.span_id
    }

    /// Context for work nested under this span.
    pub fn context(&self) -> &TraceContext {
        &self.child
    }

    pub fn record_metrics(&mut self, metrics: SpanMetrics) {
        self.metrics = metrics;
    }

    pub async fn complete(mut self) {
        self.finish(Status::Completed, None).await;
    }

    /// End as failed, describing `error` as `"{ErrorType}: {message}"`.
    pub async fn fail<E: fmt::Display>(self, error: &E) {
        self.fail_with(describe_error(error)).await;
    }

    pub async fn fail_with(mut self, message: String) {
        self.finish(Status::Failed, Some(message)).await;
    }

    fn end_payload(&mut self, status: Status, error_message: Option<String>) -> SpanEnd {
        self.finished = true;
        SpanEnd {
            span_id: self.span_id.clone(),
            trace_id: self.trace_id.clone(),
            timestamp: Utc::now(),
            status,
            duration_ms: self.started_at.elapsed().as_millis() as u64,
            error_message,
            metrics: std::mem::take(&mut self.metrics),
        }
    }

    async fn finish(&mut self, status: Status, error_message: Option<String>) {
        let end = self.end_payload(status, error_message);
        fan_out_end_span(&self.backends, &end).await;
        debug!(
            span_id = %end.span_id,
            status = %end.status,
            duration_ms = end.duration_ms,
            "Span ended"
        );
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let end = self.end_payload(Status::Failed, Some(DROPPED_MESSAGE.to_string()));
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backends = self.backends.clone();
                handle.spawn(async move {
                    fan_out_end_span(&backends, &end).await;
                });
            }
            Err(_) => {
                warn!(span_id = %end.span_id, "Span dropped outside a runtime; end not recorded");
            }
        }
    }
}

/// `"{ErrorType}: {message}"`, using the unqualified type name.
pub(crate) fn describe_error<E: fmt::Display>(error: &E) -> String {
    format!("{}: {}", short_type_name::<E>(), error)
}

fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
