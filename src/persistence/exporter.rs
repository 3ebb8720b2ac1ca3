// src/persistence/exporter.rs
//! Span exporter that persists line-run summaries
//!
//! `export` only queues the tree; a background task persists queued trees
//! with at most `max_in_flight` running at once. Spans of one tree are
//! persisted in delivery order, so children land before their root.

use crate::observability::names;
use crate::persistence::store::DocumentStore;
use crate::persistence::summary::{EvaluationRetryPolicy, Summary};
use crate::recording::exporter::SpanExporter;
use crate::recording::span::Span;
use metrics::counter;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[derive(Debug, Clone)]
pub struct SummarySettings {
    pub collection_id: String,
    pub created_by: Map<String, Value>,
    pub retry: EvaluationRetryPolicy,
    pub max_in_flight: usize,
}

impl Default for SummarySettings {
    fn default() -> Self {
        Self {
            collection_id: "default".to_string(),
            created_by: Map::new(),
            retry: EvaluationRetryPolicy::default(),
            max_in_flight: 8,
        }
    }
}

/// Spans persisted and failed since the exporter started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PersistStats {
    pub persisted: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    persisted: AtomicUsize,
    failed: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> PersistStats {
        PersistStats {
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

pub struct SummaryExporter {
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<Span>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl SummaryExporter {
    /// Start the background persistence task
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(store: Arc<dyn DocumentStore>, settings: SummarySettings) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(persist_loop(store, settings, receiver, counters.clone()));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            counters,
        }
    }

    pub fn stats(&self) -> PersistStats {
        self.counters.snapshot()
    }

    /// Stop accepting trees and wait until every queued tree is persisted
    pub async fn shutdown(&self) -> PersistStats {
        drop(self.sender.lock().take());

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("summary persistence task failed: {}", e);
            }
        }
        self.counters.snapshot()
    }
}

impl SpanExporter for SummaryExporter {
    fn export(&self, spans: Vec<Span>) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) if sender.send(spans).is_ok() => {}
            _ => warn!("summary exporter is shut down, dropping span tree"),
        }
    }
}

async fn persist_loop(
    store: Arc<dyn DocumentStore>,
    settings: SummarySettings,
    mut receiver: mpsc::UnboundedReceiver<Vec<Span>>,
    counters: Arc<Counters>,
) {
    let max_in_flight = settings.max_in_flight.max(1);
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let settings = Arc::new(settings);

    while let Some(spans) = receiver.recv().await {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                error!("persistence semaphore closed, dropping span tree");
                break;
            }
        };

        let store = store.clone();
        let settings = settings.clone();
        let counters = counters.clone();
        tokio::spawn(async move {
            let _permit = permit;
            persist_tree(store.as_ref(), &settings, spans, &counters).await;
        });
    }

    // Every permit back means every spawned tree is done
    if semaphore.acquire_many(max_in_flight as u32).await.is_err() {
        error!("persistence semaphore closed before draining");
    }
    debug!("summary persistence drained");
}

async fn persist_tree(
    store: &dyn DocumentStore,
    settings: &SummarySettings,
    spans: Vec<Span>,
    counters: &Counters,
) {
    for span in spans {
        let trace_id = span.trace_id.clone();
        let mut summary = Summary::new(span, settings.collection_id.clone(), settings.created_by.clone())
            .with_retry(settings.retry);

        match summary.persist(store).await {
            Ok(()) => {
                counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                counter!(names::PERSIST_FAILURES_TOTAL).increment(1);
                warn!(trace_id = %trace_id, "failed to persist span: {}", e);
            }
        }
    }
}
