//! Tracking for flushes offloaded to the blocking pool.
//!
//! Bounds how many flushes may run at once and lets shutdown wait for the
//! in-flight ones to drain before issuing a final flush.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Result of waiting for in-flight flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Complete,
    Timeout { remaining: u32 },
}

/// Counts offloaded flushes and caps their concurrency.
pub struct FlushTracker {
    in_flight: Arc<AtomicU32>,
    notify: Arc<Notify>,
    max_in_flight: u32,
}

impl FlushTracker {
    pub fn new(max_in_flight: u32) -> Self {
        Self {
            in_flight: Arc::new(AtomicU32::new(0)),
            notify: Arc::new(Notify::new()),
            max_in_flight: max_in_flight.max(1),
        }
    }

    /// Reserve a flush slot. Returns None if the limit is reached.
    pub fn try_track(&self) -> Option<FlushGuard> {
        let mut current = self.in_flight.load(Ordering::SeqCst);
        loop {
            if current >= self.max_in_flight {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(FlushGuard {
            counter: self.in_flight.clone(),
            notify: self.notify.clone(),
        })
    }

    /// Current in-flight flush count.
    pub fn in_flight_count(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no flush is in flight, or `timeout` elapses.
    pub async fn wait_for_drain(&self, timeout: Duration) -> DrainResult {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let count = self.in_flight_count();
            if count == 0 {
                return DrainResult::Complete;
            }

            let remaining_time = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining_time.is_zero() {
                return DrainResult::Timeout { remaining: count };
            }

            tokio::select! {
                _ = self.notify.notified() => continue,
                _ = tokio::time::sleep(remaining_time) => {
                    let final_count = self.in_flight_count();
                    if final_count == 0 {
                        return DrainResult::Complete;
                    }
                    return DrainResult::Timeout { remaining: final_count };
                }
            }
        }
    }
}

impl Default for FlushTracker {
    fn default() -> Self {
        Self::new(1)
    }
}

/// RAII slot for one offloaded flush. Moved into the blocking closure.
pub struct FlushGuard {
    counter: Arc<AtomicU32>,
    notify: Arc<Notify>,
}

impl Drop for FlushGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_one();
    }
}
