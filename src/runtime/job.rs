// src/runtime/job.rs
//! Jobs and their result envelopes
//!
//! A [`Job`] is one input row of a batch. It is immutable once enqueued and
//! yields exactly one [`ResultEnvelope`] when it reaches a terminal state.

use crate::recording::span::{attr, Span};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Registered flow plus the arguments for its one-time init
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowReference {
    pub name: String,

    /// Init arguments for class-style flows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init: Option<Value>,
}

impl FlowReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            init: None,
        }
    }

    pub fn with_init(mut self, init: Value) -> Self {
        self.init = Some(init);
        self
    }
}

/// Prior run an evaluation line refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RunReference {
    /// The line with the same line number in another batch
    Batch(String),

    /// A single line run
    Line(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub run_id: String,
    pub line_index: usize,
    pub line_run_id: String,
    pub flow: FlowReference,

    /// Flow input name to connection name
    #[serde(default)]
    pub connection_bindings: BTreeMap<String, String>,

    pub inputs: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<RunReference>,
}

impl Job {
    pub fn new(run_id: &str, line_index: usize, flow: FlowReference, inputs: Map<String, Value>) -> Self {
        Self {
            run_id: run_id.to_string(),
            line_index,
            line_run_id: format!("{}_{}", run_id, line_index),
            flow,
            connection_bindings: BTreeMap::new(),
            inputs,
            reference: None,
        }
    }

    /// Attributes identifying this line on its root span
    pub fn root_attributes(&self) -> Map<String, Value> {
        let mut attributes = Map::new();
        attributes.insert(attr::BATCH_RUN_ID.to_string(), Value::from(self.run_id.clone()));
        attributes.insert(attr::LINE_NUMBER.to_string(), Value::from(self.line_index as u64));
        match &self.reference {
            Some(RunReference::Batch(batch_run_id)) => {
                attributes.insert(
                    attr::REFERENCED_BATCH_RUN_ID.to_string(),
                    Value::from(batch_run_id.clone()),
                );
            }
            Some(RunReference::Line(line_run_id)) => {
                attributes.insert(attr::LINE_RUN_ID.to_string(), Value::from(self.line_run_id.clone()));
                attributes.insert(
                    attr::REFERENCED_LINE_RUN_ID.to_string(),
                    Value::from(line_run_id.clone()),
                );
            }
            None => {}
        }
        attributes
    }
}

/// Terminal status of one line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LineStatus {
    Success,
    UserError,
    SystemError,
    Cancelled,
    Timeout,
}

impl LineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineStatus::Success => "Success",
            LineStatus::UserError => "UserError",
            LineStatus::SystemError => "SystemError",
            LineStatus::Cancelled => "Cancelled",
            LineStatus::Timeout => "Timeout",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, LineStatus::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Error class, e.g. `ValueError`, `WorkerCrashed`
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub run_id: String,
    pub line_index: usize,
    pub line_run_id: String,
    pub status: LineStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,

    /// Span tree in end order, root last
    #[serde(default)]
    pub spans: Vec<Span>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<usize>,

    pub duration_ms: u64,

    /// Dispatch attempts, 0 when the job never reached a worker
    #[serde(default)]
    pub attempts: u32,
}

impl ResultEnvelope {
    /// Envelope with no output or spans, produced by the pool itself
    pub fn terminal(job: &Job, status: LineStatus, error: Option<ErrorDetail>) -> Self {
        Self {
            run_id: job.run_id.clone(),
            line_index: job.line_index,
            line_run_id: job.line_run_id.clone(),
            status,
            output: None,
            error,
            spans: Vec::new(),
            worker_id: None,
            duration_ms: 0,
            attempts: 0,
        }
    }
}
