//! External vendor sync: the client boundary and the backend built on it.

mod backend;
mod client;

pub use backend::{ExternalSettings, ExternalSyncBackend, EXTERNAL_BACKEND_NAME};
pub use client::{
    BatchingClient, ExternalClient, ExternalCredentials, IngestionBatch, IngestionEvent,
    IngestionTransport, RemoteSpanHandle, RemoteTraceHandle, SpoolTransport, Usage,
};
