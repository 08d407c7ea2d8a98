//! Built-in recording backends.
//!
//! The external vendor backend lives in [`crate::external`].

mod persisted;

pub use persisted::{PersistedStoreBackend, TruncationLimits, STORE_BACKEND_NAME};

/// Truncate to at most `max_chars` characters, on a char boundary.
pub(crate) fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => value[..byte_idx].to_string(),
        None => value.to_string(),
    }
}
