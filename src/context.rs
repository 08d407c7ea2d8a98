//! Correlation context threaded explicitly through traced call chains.
//!
//! A [`TraceContext`] is an immutable value. Hierarchy is built by deriving
//! child contexts and passing them down as parameters; nothing is stored in
//! thread-local or global state.

use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::ids::{generate_span_id, generate_trace_id, IdError, SpanId, TraceId};

/// Correlation identifiers and attributes for one node of a trace tree.
#[derive(Debug, Clone)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub kb_id: Option<String>,
    /// Row id assigned by the first backend that persisted the trace.
    pub backend_row_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    started_at: Instant,
}

impl TraceContext {
    /// Create a root context for a new trace.
    pub fn new_root(
        user_id: Option<String>,
        session_id: Option<String>,
        kb_id: Option<String>,
    ) -> Self {
        Self {
            trace_id: generate_trace_id(),
            span_id: generate_span_id(),
            parent_span_id: None,
            user_id,
            session_id,
            kb_id,
            backend_row_id: None,
            timestamp: Utc::now(),
            started_at: Instant::now(),
        }
    }

    /// Derive a child context under `parent_span_id`.
    ///
    /// The trace id and correlation attributes are inherited; the child gets
    /// a fresh span id and its own start time.
    pub fn child_context(&self, parent_span_id: &SpanId) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: generate_span_id(),
            parent_span_id: Some(parent_span_id.clone()),
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            kb_id: self.kb_id.clone(),
            backend_row_id: self.backend_row_id.clone(),
            timestamp: Utc::now(),
            started_at: Instant::now(),
        }
    }

    /// Derive a child whose parent is this context's own span.
    pub fn child(&self) -> Self {
        self.child_context(&self.span_id)
    }

    /// Copy of this context carrying the given backend row id.
    pub fn with_backend_row_id(mut self, row_id: impl Into<String>) -> Self {
        self.backend_row_id = Some(row_id.into());
        self
    }

    /// Milliseconds elapsed since this context was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.started_at.elapsed().as_millis() as u64
    }

    /// Render as a W3C `traceparent` header value (sampled flag set).
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-01", self.trace_id, self.span_id)
    }

    /// Continue a trace received from another service.
    ///
    /// The remote span becomes the parent; a fresh local span id is assigned.
    pub fn from_traceparent(header: &str) -> Result<Self, IdError> {
        let parts: Vec<&str> = header.trim().split('-').collect();
        if parts.len() != 4 {
            return Err(IdError::Traceparent(format!(
                "expected 4 fields, got {}",
                parts.len()
            )));
        }
        if parts[0] != "00" {
            return Err(IdError::Traceparent(format!(
                "unsupported version {}",
                parts[0]
            )));
        }
        if parts[3].len() != 2 || !parts[3].bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(IdError::Traceparent(format!("invalid flags {}", parts[3])));
        }

        let trace_id = TraceId::parse(parts[1])?;
        let remote_span = SpanId::parse(parts[2])?;

        Ok(Self {
            trace_id,
            span_id: generate_span_id(),
            parent_span_id: Some(remote_span),
            user_id: None,
            session_id: None,
            kb_id: None,
            backend_row_id: None,
            timestamp: Utc::now(),
            started_at: Instant::now(),
        })
    }
}
