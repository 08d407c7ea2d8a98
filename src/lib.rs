//! Pipeline Telemetry
//!
//! Hierarchical tracing for document-ingestion and chat pipelines. A
//! [`TelemetryService`] turns trace, span, model-call and event lifecycle
//! calls into payloads and fans each one out to every enabled
//! [`TelemetryBackend`].
//!
//! # Guarantees
//!
//! - **Fire-and-forget**: backend errors and panics are logged and absorbed;
//!   instrumented code never sees them.
//! - **Isolation**: one failing backend never stops the others.
//! - **Correlation**: every trace and span carries W3C-sized hex ids that
//!   are valid even when every backend fails.
//!
//! # Backends
//!
//! - [`backends::PersistedStoreBackend`]: two-phase rows in a
//!   [`store::TelemetryStore`] (always enabled).
//! - [`external::ExternalSyncBackend`]: forwards to an external
//!   observability vendor through an [`external::ExternalClient`], enabled
//!   only when credentials are configured.

pub mod backend;
pub mod backends;
pub mod config;
pub mod context;
pub mod error;
pub mod external;
pub mod ids;
pub mod logging;
pub mod model;
pub mod service;
pub mod shutdown;
pub mod store;

pub use backend::TelemetryBackend;
pub use config::TelemetryConfig;
pub use context::TraceContext;
pub use error::{ExternalError, StoreError, TelemetryError};
pub use ids::{generate_span_id, generate_trace_id, SpanId, TraceId};
pub use model::{Metadata, SpanMetrics, SpanType, Status};
pub use service::{
    init_from_config, init_telemetry, reset_telemetry, telemetry, ActiveSpan, ModelCallParams,
    TelemetryService, TraceOptions,
};
