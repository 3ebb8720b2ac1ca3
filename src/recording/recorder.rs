// src/recording/recorder.rs
//! In-worker span recorder
//!
//! Captures the span tree produced while one job runs. Spans are pushed to
//! the finished list when they end, so children precede their parents and
//! the root comes last.

use crate::recording::span::{attr, Span, SpanEvent, SpanStatus};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::trace;
use ulid::Ulid;

/// Token usage accumulated across the calls of one line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub total: u64,
}

impl TokenUsage {
    /// Read an OpenAI-style `usage` object from a call response
    pub fn from_response(response: &Value) -> Option<Self> {
        let usage = response.get("usage")?.as_object()?;
        let field = |name: &str| usage.get(name).and_then(Value::as_u64).unwrap_or(0);

        let prompt = field("prompt_tokens");
        let completion = field("completion_tokens");
        let total = usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(prompt + completion);

        Some(Self {
            prompt,
            completion,
            total,
        })
    }

    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0 && self.prompt == 0 && self.completion == 0
    }

    /// Write the cumulative counters onto a span's attributes
    pub fn apply_to(&self, attributes: &mut Map<String, Value>) {
        attributes.insert(attr::PROMPT_TOKEN_COUNT.to_string(), Value::from(self.prompt));
        attributes.insert(
            attr::COMPLETION_TOKEN_COUNT.to_string(),
            Value::from(self.completion),
        );
        attributes.insert(attr::TOTAL_TOKEN_COUNT.to_string(), Value::from(self.total));
    }
}

struct RecorderInner {
    trace_id: String,
    resource: Map<String, Value>,
    finished: Mutex<Vec<Span>>,
    tokens: Mutex<TokenUsage>,
}

/// Collects the spans of one trace
#[derive(Clone)]
pub struct SpanRecorder {
    inner: Arc<RecorderInner>,
}

impl SpanRecorder {
    /// Start a new trace carrying `resource` on every span
    pub fn new(resource: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(RecorderInner {
                trace_id: format!("{:032x}", Ulid::new().0),
                resource,
                finished: Mutex::new(Vec::new()),
                tokens: Mutex::new(TokenUsage::default()),
            }),
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.inner.trace_id
    }

    /// Open a span; `parent_id = None` opens the root
    pub fn start_span(
        &self,
        name: impl Into<String>,
        parent_id: Option<&str>,
        span_type: &str,
    ) -> ActiveSpan {
        let now = Utc::now();
        let mut attributes = Map::new();
        attributes.insert(attr::SPAN_TYPE.to_string(), Value::from(span_type));

        let span = Span {
            trace_id: self.inner.trace_id.clone(),
            span_id: format!("{:016x}", Ulid::new().0 as u64),
            parent_id: parent_id.map(str::to_string),
            name: name.into(),
            kind: if parent_id.is_none() { "server" } else { "internal" }.to_string(),
            start_time: now,
            end_time: now,
            status: SpanStatus::unset(),
            attributes,
            events: Vec::new(),
            resource: self.inner.resource.clone(),
        };

        trace!(span_id = %span.span_id, name = %span.name, "span started");

        ActiveSpan {
            recorder: self.clone(),
            span: Some(span),
        }
    }

    pub fn add_token_usage(&self, usage: TokenUsage) {
        self.inner.tokens.lock().add(usage);
    }

    pub fn token_usage(&self) -> TokenUsage {
        *self.inner.tokens.lock()
    }

    /// Drain the finished spans in end order
    pub fn take_finished(&self) -> Vec<Span> {
        std::mem::take(&mut *self.inner.finished.lock())
    }

    fn finish(&self, span: Span) {
        trace!(span_id = %span.span_id, status = span.status.code.as_str(), "span ended");
        self.inner.finished.lock().push(span);
    }
}

/// A span that has started and not yet ended
///
/// Dropping it without calling [`ActiveSpan::end`] ends it with an unset status.
pub struct ActiveSpan {
    recorder: SpanRecorder,
    span: Option<Span>,
}

impl ActiveSpan {
    pub fn span_id(&self) -> &str {
        self.span
            .as_ref()
            .map(|span| span.span_id.as_str())
            .unwrap_or_default()
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        if let Some(span) = self.span.as_mut() {
            span.attributes.insert(key.into(), value.into());
        }
    }

    pub fn add_event(&mut self, name: impl Into<String>, attributes: Map<String, Value>) {
        if let Some(span) = self.span.as_mut() {
            span.events.push(SpanEvent::new(name, attributes));
        }
    }

    /// Record `payload` as a JSON string under the event's `payload` attribute
    pub fn record_payload(&mut self, event_name: &str, payload: &Value) {
        let mut attributes = Map::new();
        attributes.insert(attr::PAYLOAD.to_string(), Value::from(payload.to_string()));
        self.add_event(event_name, attributes);
    }

    /// Open a child of this span
    pub fn child(&self, name: impl Into<String>, span_type: &str) -> ActiveSpan {
        self.recorder
            .start_span(name, Some(self.span_id()), span_type)
    }

    pub fn end(mut self, status: SpanStatus) {
        self.close(status);
    }

    fn close(&mut self, status: SpanStatus) {
        if let Some(mut span) = self.span.take() {
            span.end_time = Utc::now();
            span.status = status;
            self.recorder.finish(span);
        }
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.close(SpanStatus::unset());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::span::{events, span_types, validate_tree, StatusCode};
    use serde_json::json;

    #[test]
    fn test_root_is_last_and_tree_is_valid() {
        let recorder = SpanRecorder::new(Map::new());
        let root = recorder.start_span("flow", None, span_types::FLOW);
        let child = root.child("llm", span_types::LLM);
        let grandchild = child.child("tool", span_types::FUNCTION);
        grandchild.end(SpanStatus::ok());
        child.end(SpanStatus::ok());
        root.end(SpanStatus::ok());

        let spans = recorder.take_finished();
        assert_eq!(spans.len(), 3);
        assert!(spans.last().unwrap().is_root());
        assert_eq!(validate_tree(&spans).unwrap().name, "flow");
        assert!(spans.iter().all(|s| s.trace_id == recorder.trace_id()));
    }

    #[test]
    fn test_payload_event() {
        let recorder = SpanRecorder::new(Map::new());
        let mut root = recorder.start_span("flow", None, span_types::FLOW);
        root.record_payload(events::INPUTS, &json!({"text": "hi"}));
        root.end(SpanStatus::ok());

        let spans = recorder.take_finished();
        let event = &spans[0].events[0];
        assert_eq!(event.name, events::INPUTS);
        let payload: Value = serde_json::from_str(event.payload().unwrap()).unwrap();
        assert_eq!(payload, json!({"text": "hi"}));
    }

    #[test]
    fn test_dropped_span_is_recorded_unset() {
        let recorder = SpanRecorder::new(Map::new());
        {
            let _span = recorder.start_span("abandoned", None, span_types::FLOW);
        }
        let spans = recorder.take_finished();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].status.code, StatusCode::Unset);
    }

    #[test]
    fn test_token_usage() {
        let response = json!({"usage": {"prompt_tokens": 5, "completion_tokens": 10}});
        let usage = TokenUsage::from_response(&response).unwrap();
        assert_eq!(usage.total, 15);
        assert!(TokenUsage::from_response(&json!({"content": "x"})).is_none());

        let recorder = SpanRecorder::new(Map::new());
        recorder.add_token_usage(usage);
        recorder.add_token_usage(usage);
        assert_eq!(recorder.token_usage().completion, 20);

        let mut attributes = Map::new();
        recorder.token_usage().apply_to(&mut attributes);
        assert_eq!(attributes[attr::TOTAL_TOKEN_COUNT], json!(30));
    }
}
