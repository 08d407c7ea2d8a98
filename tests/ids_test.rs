//! Tests for trace and span identifier generation and parsing.

use std::collections::HashSet;

use pipeline_telemetry::ids::{
    generate_span_id, generate_trace_id, IdError, SpanId, TraceId, SPAN_ID_LEN, TRACE_ID_LEN,
};

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

// ============================================================================
// Generation
// ============================================================================

#[test]
fn test_trace_ids_are_32_lower_hex() {
    for _ in 0..1000 {
        let id = generate_trace_id();
        assert_eq!(id.as_str().len(), TRACE_ID_LEN);
        assert!(is_lower_hex(id.as_str()), "bad trace id {}", id);
        assert_ne!(id.as_str(), "0".repeat(TRACE_ID_LEN));
    }
}

#[test]
fn test_span_ids_are_16_lower_hex() {
    for _ in 0..1000 {
        let id = generate_span_id();
        assert_eq!(id.as_str().len(), SPAN_ID_LEN);
        assert!(is_lower_hex(id.as_str()), "bad span id {}", id);
        assert_ne!(id.as_str(), "0".repeat(SPAN_ID_LEN));
    }
}

#[test]
fn test_no_collisions_in_large_sample() {
    let traces: HashSet<String> = (0..10_000).map(|_| generate_trace_id().into_string()).collect();
    assert_eq!(traces.len(), 10_000);

    let spans: HashSet<String> = (0..10_000).map(|_| generate_span_id().into_string()).collect();
    assert_eq!(spans.len(), 10_000);
}

#[test]
fn test_generation_is_thread_safe() {
    let handles: Vec<_> = (0..8)
        .map(|_| std::thread::spawn(|| (0..500).map(|_| generate_span_id()).collect::<Vec<_>>()))
        .collect();

    let mut all = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(all.insert(id));
        }
    }
    assert_eq!(all.len(), 4000);
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_parse_accepts_generated_ids() {
    let trace = generate_trace_id();
    assert_eq!(TraceId::parse(trace.as_str()).unwrap(), trace);
    let span = generate_span_id();
    assert_eq!(span.as_str().parse::<SpanId>().unwrap(), span);
}

#[test]
fn test_parse_rejects_uppercase_and_zero() {
    assert!(matches!(
        TraceId::parse("4BF92F3577B34DA6A3CE929D0E0E4736"),
        Err(IdError::NotLowerHex { .. })
    ));
    assert!(matches!(
        SpanId::parse("0000000000000000"),
        Err(IdError::AllZero { .. })
    ));
    assert!(matches!(
        SpanId::parse("abc"),
        Err(IdError::Length { expected: 16, actual: 3, .. })
    ));
}
