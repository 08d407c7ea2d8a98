//! Shared test backends.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;

use pipeline_telemetry::backend::TelemetryBackend;
use pipeline_telemetry::error::TelemetryError;
use pipeline_telemetry::ids::SpanId;
use pipeline_telemetry::model::{EventLog, ModelCall, SpanEnd, SpanStart, TraceEnd, TraceStart};

/// How a [`RecordingBackend`] reacts to every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    Fail,
    Panic,
}

/// Backend that records every payload it receives.
pub struct RecordingBackend {
    name: String,
    enabled: bool,
    behavior: Behavior,
    row_id: Option<String>,
    pub calls: Mutex<Vec<&'static str>>,
    pub trace_starts: Mutex<Vec<TraceStart>>,
    pub trace_ends: Mutex<Vec<TraceEnd>>,
    pub span_starts: Mutex<Vec<SpanStart>>,
    pub span_ends: Mutex<Vec<SpanEnd>>,
    pub model_calls: Mutex<Vec<ModelCall>>,
    pub events: Mutex<Vec<EventLog>>,
}

impl RecordingBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            enabled: true,
            behavior: Behavior::Succeed,
            row_id: None,
            calls: Mutex::new(Vec::new()),
            trace_starts: Mutex::new(Vec::new()),
            trace_ends: Mutex::new(Vec::new()),
            span_starts: Mutex::new(Vec::new()),
            span_ends: Mutex::new(Vec::new()),
            model_calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn row_id(mut self, row_id: &str) -> Self {
        self.row_id = Some(row_id.to_string());
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    fn react(&self, operation: &'static str) -> Result<(), TelemetryError> {
        self.calls.lock().push(operation);
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail => Err(TelemetryError::Disabled(format!("{} refused {}", self.name, operation))),
            Behavior::Panic => panic!("{} exploded during {}", self.name, operation),
        }
    }
}

#[async_trait]
impl TelemetryBackend for RecordingBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    async fn start_trace(&self, trace: &TraceStart) -> Result<Option<String>, TelemetryError> {
        self.trace_starts.lock().push(trace.clone());
        self.react("start_trace")?;
        Ok(self.row_id.clone())
    }

    async fn end_trace(&self, trace: &TraceEnd) -> Result<(), TelemetryError> {
        self.trace_ends.lock().push(trace.clone());
        self.react("end_trace")
    }

    async fn start_span(&self, span: &SpanStart) -> Result<(), TelemetryError> {
        self.span_starts.lock().push(span.clone());
        self.react("start_span")
    }

    async fn end_span(&self, span: &SpanEnd) -> Result<(), TelemetryError> {
        self.span_ends.lock().push(span.clone());
        self.react("end_span")
    }

    async fn log_model_call(&self, call: &ModelCall) -> Result<SpanId, TelemetryError> {
        self.model_calls.lock().push(call.clone());
        self.react("log_model_call")?;
        Ok(call.span_id.clone())
    }

    async fn log_event(&self, event: &EventLog) -> Result<(), TelemetryError> {
        self.events.lock().push(event.clone());
        self.react("log_event")
    }
}
