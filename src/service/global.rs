//! Process-wide telemetry service.
//!
//! Construction is idempotent: the first successful init wins and later
//! calls return the existing instance. [`reset_telemetry`] tears the
//! instance down so tests can rebuild a clean one.

use std::sync::Arc;

use parking_lot::RwLock;

use super::TelemetryService;
use crate::backend::TelemetryBackend;
use crate::backends::{PersistedStoreBackend, TruncationLimits};
use crate::config::TelemetryConfig;
use crate::external::ExternalSyncBackend;
use crate::store::TelemetryStore;

static SERVICE: RwLock<Option<Arc<TelemetryService>>> = parking_lot::const_rwlock(None);

/// Initialize the global service with `backends`, or return the existing one.
pub fn init_telemetry(backends: Vec<Arc<dyn TelemetryBackend>>) -> Arc<TelemetryService> {
    let mut slot = SERVICE.write();
    if let Some(existing) = slot.as_ref() {
        return existing.clone();
    }
    let service = Arc::new(TelemetryService::new(backends));
    *slot = Some(service.clone());
    service
}

/// The global service, if initialized.
pub fn telemetry() -> Option<Arc<TelemetryService>> {
    SERVICE.read().clone()
}

/// Remove the global service and return it. Intended for tests and shutdown.
pub fn reset_telemetry() -> Option<Arc<TelemetryService>> {
    SERVICE.write().take()
}

/// The standard backend set: the persisted store, then the external sync
/// backend (which disables itself without credentials).
pub fn default_backends(
    config: &TelemetryConfig,
    store: Arc<dyn TelemetryStore>,
) -> Vec<Arc<dyn TelemetryBackend>> {
    let persisted = PersistedStoreBackend::with_limits(
        store.clone(),
        TruncationLimits {
            max_error_chars: config.max_error_chars,
            max_preview_chars: config.max_preview_chars,
        },
    );
    let external = ExternalSyncBackend::from_config(&config.external).with_status_store(store);

    vec![Arc::new(persisted), Arc::new(external)]
}

/// Initialize the global service from configuration.
pub fn init_from_config(
    config: &TelemetryConfig,
    store: Arc<dyn TelemetryStore>,
) -> Arc<TelemetryService> {
    if let Some(existing) = telemetry() {
        return existing;
    }
    init_telemetry(default_backends(config, store))
}
