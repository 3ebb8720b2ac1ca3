// src/persistence/summary.rs
//! Line-run summaries
//!
//! Every span the pool delivers goes through [`Summary::persist`]:
//!
//! - a child span writes a `Running` placeholder for its trace, unless one
//!   (or the full record) already exists
//! - a root span is flattened into a [`LineRunRecord`] and upserted
//! - a root span that references an earlier run is additionally folded into
//!   that run's record as a [`LineEvaluation`], retrying while the
//!   referenced record is missing or unfinished

use crate::observability::names;
use crate::persistence::sanitize::truncate_and_replace;
use crate::persistence::store::{
    pointer_segment, DocumentStore, PatchOperation, SqlQuery, StoreError,
};
use crate::recording::span::{attr, events, Span};
use chrono::SecondsFormat;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const RUNNING_STATUS: &str = "Running";

/// Statuses of a line run that can take evaluations
pub const FINISHED_STATUSES: [&str; 2] = ["Ok", "Error"];

#[derive(Debug, Error)]
pub enum PersistError {
    /// The referenced run may not be persisted yet
    #[error("referenced run not ready: {0}")]
    Retriable(String),

    #[error("evaluation target still unavailable after {attempts} attempts: {reason}")]
    EvaluationTargetUnavailable { attempts: u32, reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Bounded fixed-backoff retry for folding evaluations
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationRetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for EvaluationRetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenCount {
    pub completion: u64,
    pub prompt: u64,
    pub total: u64,
}

/// Durable record of one line run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRunRecord {
    pub id: String,
    pub partition_key: String,
    pub collection_id: String,
    pub session_id: Option<String>,
    pub line_run_id: Option<String>,
    pub batch_run_id: Option<String>,
    pub line_number: Option<u64>,
    pub trace_id: String,
    pub root_span_id: Option<String>,
    pub inputs: Option<Value>,
    pub outputs: Option<Value>,
    pub start_time: String,
    pub end_time: Option<String>,
    pub status: String,
    pub latency: Option<f64>,
    pub name: String,
    pub kind: Option<String>,
    pub created_by: Map<String, Value>,
    pub cumulative_token_count: Option<TokenCount>,
    #[serde(default)]
    pub evaluations: Map<String, Value>,
}

/// Evaluation payload folded into the referenced run's `evaluations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineEvaluation {
    pub line_run_id: Option<String>,
    pub batch_run_id: Option<String>,
    pub line_number: Option<u64>,
    pub collection_id: String,
    pub trace_id: String,
    pub root_span_id: String,
    pub outputs: Option<Value>,
    pub name: String,
    pub created_by: Map<String, Value>,
}

/// Record key taken from span attributes
///
/// `line_run_id` wins; otherwise both `batch_run_id` and `line_number`
/// must be present.
#[derive(Debug, Clone, Default, PartialEq)]
struct RunKey {
    line_run_id: Option<String>,
    batch_run_id: Option<String>,
    line_number: Option<u64>,
}

impl RunKey {
    fn of(span: &Span) -> Self {
        if let Some(line_run_id) = span.attribute_str(attr::LINE_RUN_ID) {
            return Self {
                line_run_id: Some(line_run_id.to_string()),
                ..Self::default()
            };
        }
        match (span.attribute_str(attr::BATCH_RUN_ID), line_number(span)) {
            (Some(batch_run_id), Some(line_number)) => Self {
                batch_run_id: Some(batch_run_id.to_string()),
                line_number: Some(line_number),
                ..Self::default()
            },
            _ => Self::default(),
        }
    }
}

/// Line number attribute, accepting numeric strings
fn line_number(span: &Span) -> Option<u64> {
    match span.attribute(attr::LINE_NUMBER)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn timestamp(time: &chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Which earlier run an evaluation root points at
#[derive(Debug, Clone, PartialEq)]
enum EvaluationTarget {
    Line { line_run_id: String },
    Batch { batch_run_id: String, line_number: Option<u64> },
}

/// Persistence view of one delivered span
pub struct Summary {
    span: Span,
    collection_id: String,
    created_by: Map<String, Value>,
    retry: EvaluationRetryPolicy,
    inputs: Option<Value>,
    outputs: Option<Value>,
}

impl Summary {
    pub fn new(span: Span, collection_id: impl Into<String>, created_by: Map<String, Value>) -> Self {
        Self {
            span,
            collection_id: collection_id.into(),
            created_by,
            retry: EvaluationRetryPolicy::default(),
            inputs: None,
            outputs: None,
        }
    }

    pub fn with_retry(mut self, retry: EvaluationRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub async fn persist(&mut self, store: &dyn DocumentStore) -> Result<(), PersistError> {
        if !self.span.is_root() {
            return self.persist_running_item(store).await;
        }

        self.parse_inputs_outputs_from_events();
        self.persist_line_run(store).await?;
        if self.evaluation_target().is_some() {
            self.insert_evaluation_with_retry(store).await?;
        }
        Ok(())
    }

    /// Latch the first input and first output payloads
    pub fn parse_inputs_outputs_from_events(&mut self) {
        for event in &self.span.events {
            let Some(payload) = event.payload() else {
                continue;
            };
            let slot = match event.name.as_str() {
                events::INPUTS => &mut self.inputs,
                events::OUTPUT => &mut self.outputs,
                _ => continue,
            };
            if slot.is_none() {
                let value = serde_json::from_str(payload)
                    .unwrap_or_else(|_| Value::String(payload.to_string()));
                *slot = Some(value);
            }
        }
    }

    pub fn inputs(&self) -> Option<&Value> {
        self.inputs.as_ref()
    }

    pub fn outputs(&self) -> Option<&Value> {
        self.outputs.as_ref()
    }

    fn token_count(&self) -> Option<TokenCount> {
        let read = |key: &str| self.span.attribute(key).and_then(Value::as_u64);
        let completion = read(attr::COMPLETION_TOKEN_COUNT);
        let prompt = read(attr::PROMPT_TOKEN_COUNT);
        let total = read(attr::TOTAL_TOKEN_COUNT);
        if completion.is_none() && prompt.is_none() && total.is_none() {
            return None;
        }
        Some(TokenCount {
            completion: completion.unwrap_or(0),
            prompt: prompt.unwrap_or(0),
            total: total.unwrap_or(0),
        })
    }

    /// Flattened record of the root span
    pub fn line_run_record(&self) -> LineRunRecord {
        let span = &self.span;
        let key = RunKey::of(span);
        LineRunRecord {
            id: span.trace_id.clone(),
            partition_key: self.collection_id.clone(),
            collection_id: self.collection_id.clone(),
            session_id: span.session_id().map(str::to_string),
            line_run_id: key.line_run_id,
            batch_run_id: key.batch_run_id,
            line_number: key.line_number,
            trace_id: span.trace_id.clone(),
            root_span_id: Some(span.span_id.clone()),
            inputs: self.inputs.as_ref().map(truncate_and_replace),
            outputs: self.outputs.as_ref().map(truncate_and_replace),
            start_time: timestamp(&span.start_time),
            end_time: Some(timestamp(&span.end_time)),
            status: span.status.code.as_str().to_string(),
            latency: Some(span.latency_seconds()),
            name: span.name.clone(),
            kind: span.attribute_str(attr::SPAN_TYPE).map(str::to_string),
            created_by: self.created_by.clone(),
            cumulative_token_count: self.token_count(),
            evaluations: Map::new(),
        }
    }

    /// Placeholder marking the trace as in progress
    pub fn running_item(&self) -> LineRunRecord {
        let span = &self.span;
        let key = RunKey::of(span);
        LineRunRecord {
            id: span.trace_id.clone(),
            partition_key: self.collection_id.clone(),
            collection_id: self.collection_id.clone(),
            session_id: span.session_id().map(str::to_string),
            line_run_id: key.line_run_id,
            batch_run_id: key.batch_run_id,
            line_number: key.line_number,
            trace_id: span.trace_id.clone(),
            root_span_id: None,
            inputs: None,
            outputs: None,
            start_time: timestamp(&span.start_time),
            end_time: None,
            status: RUNNING_STATUS.to_string(),
            latency: None,
            name: span.name.clone(),
            kind: None,
            created_by: self.created_by.clone(),
            cumulative_token_count: None,
            evaluations: Map::new(),
        }
    }

    async fn persist_running_item(&self, store: &dyn DocumentStore) -> Result<(), PersistError> {
        let item = serde_json::to_value(self.running_item())?;
        match store.create_item(item).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict(id)) => {
                debug!(trace_id = %id, "line run already recorded");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_line_run(&self, store: &dyn DocumentStore) -> Result<(), PersistError> {
        let record = self.line_run_record();
        debug!(
            trace_id = %record.trace_id,
            status = %record.status,
            "persisting line run"
        );
        store.upsert_item(serde_json::to_value(record)?).await?;
        Ok(())
    }

    fn evaluation_target(&self) -> Option<EvaluationTarget> {
        if let Some(line_run_id) = self.span.attribute_str(attr::REFERENCED_LINE_RUN_ID) {
            return Some(EvaluationTarget::Line {
                line_run_id: line_run_id.to_string(),
            });
        }
        self.span
            .attribute_str(attr::REFERENCED_BATCH_RUN_ID)
            .map(|batch_run_id| EvaluationTarget::Batch {
                batch_run_id: batch_run_id.to_string(),
                line_number: line_number(&self.span),
            })
    }

    /// Evaluation payload of this root span
    pub fn line_evaluation(&self) -> LineEvaluation {
        let key = RunKey::of(&self.span);
        LineEvaluation {
            line_run_id: key.line_run_id,
            batch_run_id: key.batch_run_id,
            line_number: key.line_number,
            collection_id: self.collection_id.clone(),
            trace_id: self.span.trace_id.clone(),
            root_span_id: self.span.span_id.clone(),
            outputs: self.outputs.as_ref().map(truncate_and_replace),
            name: self.span.name.clone(),
            created_by: self.created_by.clone(),
        }
    }

    /// Fold this evaluation into the referenced run, once
    ///
    /// `Retriable` when the referenced record is missing or unfinished.
    pub async fn insert_evaluation(&self, store: &dyn DocumentStore) -> Result<(), PersistError> {
        let Some(target) = self.evaluation_target() else {
            return Ok(());
        };

        let (query, name) = match &target {
            EvaluationTarget::Line { line_run_id } => (
                SqlQuery::equality(&[
                    (attr::LINE_RUN_ID, Value::from(line_run_id.clone())),
                    (attr::BATCH_RUN_ID, Value::Null),
                    (attr::LINE_NUMBER, Value::Null),
                ]),
                self.span.name.clone(),
            ),
            EvaluationTarget::Batch {
                batch_run_id,
                line_number,
            } => (
                SqlQuery::equality(&[
                    (attr::LINE_RUN_ID, Value::Null),
                    (attr::BATCH_RUN_ID, Value::from(batch_run_id.clone())),
                    (attr::LINE_NUMBER, line_number.map(Value::from).unwrap_or(Value::Null)),
                ]),
                // Keyed by the evaluating batch run
                self.span
                    .attribute_str(attr::BATCH_RUN_ID)
                    .map(str::to_string)
                    .unwrap_or_else(|| self.span.name.clone()),
            ),
        };

        let items = store.query_items(&query).await?;
        let Some(referenced) = items.into_iter().next() else {
            return Err(PersistError::Retriable(format!("{:?} not found", target)));
        };

        let status = referenced.get("status").and_then(Value::as_str);
        if !status.is_some_and(|s| FINISHED_STATUSES.contains(&s)) {
            return Err(PersistError::Retriable(format!(
                "{:?} is {}",
                target,
                status.unwrap_or("missing a status")
            )));
        }

        let field = |key: &str| {
            referenced
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| StoreError::Backend(format!("referenced record has no `{}`", key)))
        };
        let id = field("id")?;
        let partition_key = field("partition_key")?;

        let patch = PatchOperation::add(
            format!("/evaluations/{}", pointer_segment(&name)),
            serde_json::to_value(self.line_evaluation())?,
        );
        store.patch_item(&id, &partition_key, &[patch]).await?;

        info!(evaluation = %name, referenced = %id, "evaluation recorded");
        Ok(())
    }

    pub async fn insert_evaluation_with_retry(
        &self,
        store: &dyn DocumentStore,
    ) -> Result<(), PersistError> {
        self.insert_evaluation_with_retry_using(store, tokio::time::sleep)
            .await
    }

    /// [`Self::insert_evaluation_with_retry`] with the sleep supplied by the caller
    pub async fn insert_evaluation_with_retry_using<F, Fut>(
        &self,
        store: &dyn DocumentStore,
        mut sleep: F,
    ) -> Result<(), PersistError>
    where
        F: FnMut(Duration) -> Fut,
        Fut: Future<Output = ()>,
    {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.insert_evaluation(store).await {
                Err(PersistError::Retriable(reason)) if attempt < attempts => {
                    counter!(names::EVALUATION_RETRIES_TOTAL).increment(1);
                    info!(attempt, %reason, "evaluation target not ready, retrying");
                    sleep(self.retry.backoff).await;
                    attempt += 1;
                }
                Err(PersistError::Retriable(reason)) => {
                    warn!(attempts, %reason, "giving up on evaluation");
                    return Err(PersistError::EvaluationTargetUnavailable { attempts, reason });
                }
                other => return other,
            }
        }
    }
}
