//! Trace and span identifier generation.
//!
//! Identifiers follow the W3C trace-context wire format: a trace id is 16
//! random bytes rendered as 32 lowercase hex characters, a span id is 8
//! random bytes rendered as 16. The all-zero value is invalid in both cases.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hex length of a trace id.
pub const TRACE_ID_LEN: usize = 32;
/// Hex length of a span id.
pub const SPAN_ID_LEN: usize = 16;

/// Errors produced when parsing an identifier from external input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IdError {
    #[error("Invalid {kind} length: expected {expected}, got {actual}")]
    Length {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {kind}: must be lowercase hex")]
    NotLowerHex { kind: &'static str },

    #[error("Invalid {kind}: all-zero value")]
    AllZero { kind: &'static str },

    #[error("Invalid traceparent header: {0}")]
    Traceparent(String),
}

/// Generate a new trace id: 32 lowercase hex characters, never all-zero.
pub fn generate_trace_id() -> TraceId {
    TraceId(random_hex::<16>())
}

/// Generate a new span id: 16 lowercase hex characters, never all-zero.
pub fn generate_span_id() -> SpanId {
    SpanId(random_hex::<8>())
}

fn random_hex<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    loop {
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        if bytes.iter().any(|b| *b != 0) {
            return hex::encode(bytes);
        }
    }
}

fn validate(kind: &'static str, value: &str, expected: usize) -> Result<(), IdError> {
    if value.len() != expected {
        return Err(IdError::Length {
            kind,
            expected,
            actual: value.len(),
        });
    }
    if !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(IdError::NotLowerHex { kind });
    }
    if value.bytes().all(|b| b == b'0') {
        return Err(IdError::AllZero { kind });
    }
    Ok(())
}

macro_rules! hex_id {
    ($name:ident, $kind:literal, $len:expr) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Parse and validate an identifier received from outside the process.
            pub fn parse(value: &str) -> Result<Self, IdError> {
                validate($kind, value, $len)?;
                Ok(Self(value.to_string()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse(s)
            }
        }
    };
}

hex_id!(TraceId, "trace id", TRACE_ID_LEN);
hex_id!(SpanId, "span id", SPAN_ID_LEN);
