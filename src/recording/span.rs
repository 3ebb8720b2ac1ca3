// src/recording/span.rs
//! Span/trace data model
//!
//! One job produces one span tree: exactly one root (no parent) and every
//! other span reachable from it through `parent_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Span attribute names
pub mod attr {
    pub const LINE_RUN_ID: &str = "line_run_id";
    pub const BATCH_RUN_ID: &str = "batch_run_id";
    pub const LINE_NUMBER: &str = "line_number";
    pub const REFERENCED_LINE_RUN_ID: &str = "referenced.line_run_id";
    pub const REFERENCED_BATCH_RUN_ID: &str = "referenced.batch_run_id";
    pub const SPAN_TYPE: &str = "span_type";
    pub const COMPLETION_TOKEN_COUNT: &str = "__computed__.cumulative_token_count.completion";
    pub const PROMPT_TOKEN_COUNT: &str = "__computed__.cumulative_token_count.prompt";
    pub const TOTAL_TOKEN_COUNT: &str = "__computed__.cumulative_token_count.total";
    pub const PAYLOAD: &str = "payload";
    pub const EXCEPTION_MESSAGE: &str = "exception.message";
    pub const EXCEPTION_TYPE: &str = "exception.type";
}

/// Span event names
pub mod events {
    pub const INPUTS: &str = "promptflow.function.inputs";
    pub const OUTPUT: &str = "promptflow.function.output";
    pub const EXCEPTION: &str = "exception";
}

/// Span types recorded under `attr::SPAN_TYPE`
pub mod span_types {
    pub const FLOW: &str = "Flow";
    pub const LLM: &str = "LLM";
    pub const FUNCTION: &str = "Function";
}

/// Resource key holding the collection (session) a trace belongs to
pub const RESOURCE_COLLECTION: &str = "collection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    Unset,
    Ok,
    Error,
}

impl StatusCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusCode::Unset => "Unset",
            StatusCode::Ok => "Ok",
            StatusCode::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            description: None,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            description: Some(description.into()),
        }
    }

    pub fn unset() -> Self {
        Self {
            code: StatusCode::Unset,
            description: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub time: DateTime<Utc>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>, attributes: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            attributes,
            time: Utc::now(),
        }
    }

    /// The JSON-encoded `payload` attribute, if present
    pub fn payload(&self) -> Option<&str> {
        self.attributes.get(attr::PAYLOAD).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,

    /// `None` marks the root span of a trace
    #[serde(default)]
    pub parent_id: Option<String>,

    pub name: String,

    #[serde(default)]
    pub kind: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: SpanStatus,

    #[serde(default)]
    pub attributes: Map<String, Value>,

    #[serde(default)]
    pub events: Vec<SpanEvent>,

    #[serde(default)]
    pub resource: Map<String, Value>,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// String attribute; non-string scalars are not coerced
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// Collection the trace was produced under
    pub fn session_id(&self) -> Option<&str> {
        self.resource.get(RESOURCE_COLLECTION).and_then(Value::as_str)
    }

    pub fn latency_seconds(&self) -> f64 {
        (self.end_time - self.start_time).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SpanTreeError {
    #[error("span tree is empty")]
    Empty,

    #[error("span tree has no root span")]
    NoRoot,

    #[error("span tree has {0} root spans")]
    MultipleRoots(usize),

    #[error("span {span_id} belongs to trace {found}, expected {expected}")]
    MixedTraces {
        span_id: String,
        expected: String,
        found: String,
    },

    #[error("span {span_id} does not trace back to the root")]
    Detached { span_id: String },
}

/// First span without a parent
pub fn find_root(spans: &[Span]) -> Option<&Span> {
    spans.iter().find(|span| span.is_root())
}

/// Check the single-root invariant and return the root
pub fn validate_tree(spans: &[Span]) -> Result<&Span, SpanTreeError> {
    if spans.is_empty() {
        return Err(SpanTreeError::Empty);
    }

    let roots: Vec<&Span> = spans.iter().filter(|span| span.is_root()).collect();
    let root = match roots.as_slice() {
        [] => return Err(SpanTreeError::NoRoot),
        [root] => *root,
        many => return Err(SpanTreeError::MultipleRoots(many.len())),
    };

    let parents: HashMap<&str, Option<&str>> = spans
        .iter()
        .map(|span| (span.span_id.as_str(), span.parent_id.as_deref()))
        .collect();

    for span in spans {
        if span.trace_id != root.trace_id {
            return Err(SpanTreeError::MixedTraces {
                span_id: span.span_id.clone(),
                expected: root.trace_id.clone(),
                found: span.trace_id.clone(),
            });
        }

        // Walk up at most `len` steps; anything longer is a cycle
        let mut current = span.span_id.as_str();
        let mut reached_root = false;
        for _ in 0..=spans.len() {
            if current == root.span_id {
                reached_root = true;
                break;
            }
            match parents.get(current) {
                Some(Some(parent)) => current = parent,
                _ => break,
            }
        }

        if !reached_root {
            return Err(SpanTreeError::Detached {
                span_id: span.span_id.clone(),
            });
        }
    }

    Ok(root)
}
