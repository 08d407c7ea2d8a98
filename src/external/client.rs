//! Client side of the external telemetry vendor.
//!
//! [`ExternalClient`] mirrors a vendor SDK: synchronous calls that buffer
//! observations locally, plus a blocking `flush`. [`BatchingClient`] is the
//! bundled implementation; it hands each flushed batch to an
//! [`IngestionTransport`]. [`SpoolTransport`] appends batches as NDJSON to a
//! spool file that a shipper forwards to the ingestion endpoint.
//!
//! The secret key never leaves the process. It gates whether a client can be
//! built at all; the shipper authenticates with its own copy of the key pair
//! and matches batches to it by `public_key`.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExternalError;
use crate::ids::{SpanId, TraceId};
use crate::model::{
    EventLog, Metadata, ModelCall, SpanEnd, SpanMetrics, SpanStart, SpanType, Status, TraceEnd,
    TraceStart,
};

/// Remote object created for one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTraceHandle {
    pub trace_id: TraceId,
    pub remote_id: String,
}

/// Remote object created for one span or generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSpanHandle {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub remote_id: String,
}

/// Vendor SDK surface used by [`super::ExternalSyncBackend`].
///
/// Every method except `flush` is expected to be cheap (local buffering).
/// `flush` may block on I/O and is only ever called from the blocking pool.
pub trait ExternalClient: Send + Sync {
    fn create_trace(&self, trace: &TraceStart) -> Result<RemoteTraceHandle, ExternalError>;

    fn update_trace(&self, handle: &RemoteTraceHandle, end: &TraceEnd)
        -> Result<(), ExternalError>;

    fn create_span(
        &self,
        trace: &RemoteTraceHandle,
        span: &SpanStart,
    ) -> Result<RemoteSpanHandle, ExternalError>;

    fn update_span(&self, handle: &RemoteSpanHandle, end: &SpanEnd) -> Result<(), ExternalError>;

    fn create_generation(
        &self,
        trace: &RemoteTraceHandle,
        call: &ModelCall,
    ) -> Result<RemoteSpanHandle, ExternalError>;

    /// Returns the remote event id.
    fn create_event(
        &self,
        trace: &RemoteTraceHandle,
        event: &EventLog,
    ) -> Result<String, ExternalError>;

    /// Send everything buffered. Returns the number of events sent.
    fn flush(&self) -> Result<usize, ExternalError>;
}

/// Credentials for the ingestion endpoint.
#[derive(Clone)]
pub struct ExternalCredentials {
    pub host: String,
    /// Written into every batch so the shipper can pick the matching key pair.
    pub public_key: String,
    /// Required to enable the client. Never serialized or spooled.
    pub secret_key: String,
}

impl fmt::Debug for ExternalCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCredentials")
            .field("host", &self.host)
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

impl ExternalCredentials {
    fn validate(&self) -> Result<(), ExternalError> {
        if self.public_key.trim().is_empty() || self.secret_key.trim().is_empty() {
            return Err(ExternalError::NotConfigured("missing API keys".into()));
        }
        if !(self.host.starts_with("http://") || self.host.starts_with("https://")) {
            return Err(ExternalError::NotConfigured(format!(
                "host must be an http(s) URL: {}",
                self.host
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Ingestion wire format
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input: Option<u32>,
    pub output: Option<u32>,
}

/// One buffered observation, tagged by kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum IngestionEvent {
    TraceCreate {
        id: String,
        name: String,
        timestamp: DateTime<Utc>,
        user_id: Option<String>,
        session_id: Option<String>,
        metadata: Option<Metadata>,
    },
    TraceUpdate {
        id: String,
        status: Status,
        duration_ms: u64,
        status_message: Option<String>,
        metadata: Option<Metadata>,
    },
    SpanCreate {
        id: String,
        trace_id: String,
        parent_observation_id: Option<String>,
        name: String,
        span_type: SpanType,
        start_time: DateTime<Utc>,
        metadata: Option<Metadata>,
    },
    SpanUpdate {
        id: String,
        trace_id: String,
        end_time: DateTime<Utc>,
        status: Status,
        duration_ms: u64,
        status_message: Option<String>,
        metrics: SpanMetrics,
    },
    GenerationCreate {
        id: String,
        trace_id: String,
        parent_observation_id: Option<String>,
        name: String,
        model: String,
        end_time: DateTime<Utc>,
        duration_ms: Option<u64>,
        usage: Usage,
        status: Status,
        status_message: Option<String>,
        metadata: Option<Metadata>,
    },
    EventCreate {
        id: String,
        trace_id: String,
        parent_observation_id: Option<String>,
        name: String,
        timestamp: DateTime<Utc>,
        payload: Value,
    },
}

/// A flushed group of events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionBatch {
    pub batch_id: String,
    pub host: String,
    pub public_key: String,
    pub sent_at: DateTime<Utc>,
    pub events: Vec<IngestionEvent>,
}

/// Delivers a batch toward the ingestion endpoint.
pub trait IngestionTransport: Send + Sync {
    fn send(&self, batch: &IngestionBatch) -> Result<(), ExternalError>;
}

/// Appends each batch as one JSON line to a spool file.
///
/// Batches carry `host` and `public_key` only; the file holds no secret.
pub struct SpoolTransport {
    path: PathBuf,
    lock: Mutex<()>,
}

impl SpoolTransport {
    pub const FILE_NAME: &'static str = "ingestion.ndjson";

    /// Spool into `dir`, creating it if needed.
    pub fn new(dir: &Path) -> Result<Self, ExternalError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            path: dir.join(Self::FILE_NAME),
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IngestionTransport for SpoolTransport {
    fn send(&self, batch: &IngestionBatch) -> Result<(), ExternalError> {
        let mut line = serde_json::to_vec(batch)?;
        line.push(b'\n');

        let _lock = self.lock.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

// =============================================================================
// Batching client
// =============================================================================

/// Buffers ingestion events in memory until flushed.
pub struct BatchingClient {
    credentials: ExternalCredentials,
    transport: Box<dyn IngestionTransport>,
    buffer: Mutex<Vec<IngestionEvent>>,
    max_buffer: usize,
}

impl BatchingClient {
    /// Upper bound on buffered events; the oldest are dropped beyond it.
    pub const DEFAULT_MAX_BUFFER: usize = 10_000;

    pub fn new(
        credentials: ExternalCredentials,
        transport: Box<dyn IngestionTransport>,
    ) -> Result<Self, ExternalError> {
        credentials.validate()?;
        Ok(Self {
            credentials,
            transport,
            buffer: Mutex::new(Vec::new()),
            max_buffer: Self::DEFAULT_MAX_BUFFER,
        })
    }

    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer.max(1);
        self
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().len()
    }

    fn push(&self, event: IngestionEvent) {
        let mut buffer = self.buffer.lock();
        buffer.push(event);
        if buffer.len() > self.max_buffer {
            let excess = buffer.len() - self.max_buffer;
            buffer.drain(0..excess);
            tracing::warn!(dropped = excess, "Ingestion buffer full, oldest events dropped");
        }
    }
}

impl ExternalClient for BatchingClient {
    fn create_trace(&self, trace: &TraceStart) -> Result<RemoteTraceHandle, ExternalError> {
        let remote_id = trace.trace_id.to_string();
        self.push(IngestionEvent::TraceCreate {
            id: remote_id.clone(),
            name: trace.name.clone(),
            timestamp: trace.timestamp,
            user_id: trace.user_id.clone(),
            session_id: trace.session_id.clone(),
            metadata: trace.metadata.clone(),
        });
        Ok(RemoteTraceHandle {
            trace_id: trace.trace_id.clone(),
            remote_id,
        })
    }

    fn update_trace(
        &self,
        handle: &RemoteTraceHandle,
        end: &TraceEnd,
    ) -> Result<(), ExternalError> {
        self.push(IngestionEvent::TraceUpdate {
            id: handle.remote_id.clone(),
            status: end.status,
            duration_ms: end.duration_ms,
            status_message: end.error_message.clone(),
            metadata: end.metadata.clone(),
        });
        Ok(())
    }

    fn create_span(
        &self,
        trace: &RemoteTraceHandle,
        span: &SpanStart,
    ) -> Result<RemoteSpanHandle, ExternalError> {
        let remote_id = span.span_id.to_string();
        self.push(IngestionEvent::SpanCreate {
            id: remote_id.clone(),
            trace_id: trace.remote_id.clone(),
            parent_observation_id: span.parent_span_id.as_ref().map(|p| p.to_string()),
            name: span.name.clone(),
            span_type: span.span_type,
            start_time: span.timestamp,
            metadata: span.metadata.clone(),
        });
        Ok(RemoteSpanHandle {
            span_id: span.span_id.clone(),
            trace_id: trace.trace_id.clone(),
            remote_id,
        })
    }

    fn update_span(&self, handle: &RemoteSpanHandle, end: &SpanEnd) -> Result<(), ExternalError> {
        self.push(IngestionEvent::SpanUpdate {
            id: handle.remote_id.clone(),
            trace_id: handle.trace_id.to_string(),
            end_time: end.timestamp,
            status: end.status,
            duration_ms: end.duration_ms,
            status_message: end.error_message.clone(),
            metrics: end.metrics.clone(),
        });
        Ok(())
    }

    fn create_generation(
        &self,
        trace: &RemoteTraceHandle,
        call: &ModelCall,
    ) -> Result<RemoteSpanHandle, ExternalError> {
        let remote_id = call.span_id.to_string();
        self.push(IngestionEvent::GenerationCreate {
            id: remote_id.clone(),
            trace_id: trace.remote_id.clone(),
            parent_observation_id: call.parent_span_id.as_ref().map(|p| p.to_string()),
            name: call.name.clone(),
            model: call.model.clone(),
            end_time: call.timestamp,
            duration_ms: call.duration_ms,
            usage: Usage {
                input: call.input_tokens,
                output: call.output_tokens,
            },
            status: call.status,
            status_message: call.error_message.clone(),
            metadata: call.metadata.clone(),
        });
        Ok(RemoteSpanHandle {
            span_id: call.span_id.clone(),
            trace_id: trace.trace_id.clone(),
            remote_id,
        })
    }

    fn create_event(
        &self,
        trace: &RemoteTraceHandle,
        event: &EventLog,
    ) -> Result<String, ExternalError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.push(IngestionEvent::EventCreate {
            id: id.clone(),
            trace_id: trace.remote_id.clone(),
            parent_observation_id: event.span_id.as_ref().map(|s| s.to_string()),
            name: event.kind.clone(),
            timestamp: event.timestamp,
            payload: event.payload.clone(),
        });
        Ok(id)
    }

    fn flush(&self) -> Result<usize, ExternalError> {
        let events = std::mem::take(&mut *self.buffer.lock());
        if events.is_empty() {
            return Ok(0);
        }

        let count = events.len();
        let batch = IngestionBatch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            host: self.credentials.host.clone(),
            public_key: self.credentials.public_key.clone(),
            sent_at: Utc::now(),
            events,
        };
        // A failed batch is dropped, not re-buffered.
        self.transport.send(&batch)?;
        Ok(count)
    }
}
