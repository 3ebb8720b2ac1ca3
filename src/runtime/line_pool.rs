// src/runtime/line_pool.rs
//! Line execution pool
//!
//! Runs the jobs of a batch on a bounded set of worker processes. Each
//! submitted batch gets a coordinator task that owns its workers:
//!
//! ```text
//! submit(batch) ──▶ coordinator ── Execute{job} ──▶ worker 0..C
//!                      ▲    │                          │
//!                      │    └── liveness tick          │
//!                      └──────── PoolEvent ◀───────────┘
//!                             (one channel task per worker)
//! ```
//!
//! Whatever happens to a worker, every job yields exactly one envelope:
//! - crashed worker: SystemError, or re-dispatch under the retry policy
//! - line over its wall-clock budget: Timeout, worker killed and replaced
//! - cancellation: pending and in-flight lines are reported Cancelled
//! - no worker can be brought up: SystemError for every remaining line

use crate::interception::HookConfig;
use crate::observability::names;
use crate::recording::exporter::SpanExporter;
use crate::recording::recorder::SpanRecorder;
use crate::recording::span::{attr, events, span_types, Span, SpanStatus, RESOURCE_COLLECTION};
use crate::runtime::connections::ConnectionSource;
use crate::runtime::job::{ErrorDetail, FlowReference, Job, LineStatus, ResultEnvelope, RunReference};
use crate::runtime::process_manager::{ProcessManager, WorkerHandle, WorkerState};
use crate::runtime::protocol::{codec, decode, encode, WorkerBootstrap, WorkerCommand, WorkerMessage};
use crate::runtime::resource_limiter::WorkerLimits;
use crate::utils::errors::{EngineError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type FrameReader = FramedRead<Box<dyn AsyncRead + Send + Unpin>, LinesCodec>;
type FrameWriter = FramedWrite<Box<dyn AsyncWrite + Send + Unpin>, LinesCodec>;

/// Re-dispatch policy for infrastructure failures
///
/// User errors are never retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InfraRetryPolicy {
    /// Extra attempts after the first dispatch
    pub max_retries: u32,

    /// Whether timed-out lines are re-dispatched too
    pub retry_timeouts: bool,
}

impl InfraRetryPolicy {
    /// Whether a line that failed with `status` on dispatch number `attempts`
    /// goes back in the queue
    pub fn should_retry(&self, status: LineStatus, attempts: u32) -> bool {
        let retriable = match status {
            LineStatus::SystemError => true,
            LineStatus::Timeout => self.retry_timeouts,
            _ => false,
        };
        retriable && attempts <= self.max_retries
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target concurrency
    pub worker_count: usize,

    /// Wall-clock budget for one line
    pub line_timeout: Duration,

    pub liveness_interval: Duration,
    pub startup_timeout: Duration,

    /// Grace period for workers to exit after `Shutdown`
    pub terminate_grace: Duration,

    pub retry: InfraRetryPolicy,

    /// Consecutive bootstrap failures before the batch is fatal
    pub max_startup_failures: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            line_timeout: Duration::from_secs(600),
            liveness_interval: Duration::from_millis(200),
            startup_timeout: Duration::from_secs(30),
            terminate_grace: Duration::from_secs(2),
            retry: InfraRetryPolicy::default(),
            max_startup_failures: 3,
        }
    }
}

/// Settings shared by every worker the pool starts
#[derive(Debug, Clone)]
pub struct WorkerTemplate {
    pub hooks: HookConfig,
    pub connections: ConnectionSource,
    pub limits: WorkerLimits,

    /// Collection recorded on every span's resource
    pub collection: String,

    pub log_filter: String,
}

impl Default for WorkerTemplate {
    fn default() -> Self {
        Self {
            hooks: HookConfig::default(),
            connections: ConnectionSource::None,
            limits: WorkerLimits::unlimited(),
            collection: "default".to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl WorkerTemplate {
    fn bootstrap(&self, worker_id: usize, run_id: &str, flow: &FlowReference) -> WorkerBootstrap {
        WorkerBootstrap {
            worker_id,
            run_id: run_id.to_string(),
            flow: flow.clone(),
            hooks: self.hooks.clone(),
            connections: self.connections.clone(),
            limits: self.limits,
            collection: self.collection.clone(),
            log_filter: self.log_filter.clone(),
        }
    }
}

/// One batch run: a flow applied to every row of a dataset
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub run_id: String,
    pub flow: FlowReference,

    /// Flow input name to connection name, shared by every line
    pub connection_bindings: BTreeMap<String, String>,

    pub rows: Vec<Map<String, Value>>,

    /// Run this batch evaluates, if any
    pub evaluation_of: Option<RunReference>,
}

impl BatchRequest {
    pub fn new(run_id: impl Into<String>, flow: FlowReference, rows: Vec<Map<String, Value>>) -> Self {
        Self {
            run_id: run_id.into(),
            flow,
            connection_bindings: BTreeMap::new(),
            rows,
            evaluation_of: None,
        }
    }

    pub fn bind(mut self, input: impl Into<String>, connection: impl Into<String>) -> Self {
        self.connection_bindings.insert(input.into(), connection.into());
        self
    }

    pub fn evaluating(mut self, reference: RunReference) -> Self {
        self.evaluation_of = Some(reference);
        self
    }

    /// One job per row, in row order
    fn jobs(&self) -> Vec<Job> {
        self.rows
            .iter()
            .enumerate()
            .map(|(line_index, row)| {
                let mut job = Job::new(&self.run_id, line_index, self.flow.clone(), row.clone());
                job.connection_bindings = self.connection_bindings.clone();
                job.reference = self.evaluation_of.clone();
                job
            })
            .collect()
    }
}

/// Outcome counts for one batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub user_errors: usize,
    pub system_errors: usize,
    pub timeouts: usize,
    pub cancelled: usize,

    /// Re-dispatches under the retry policy
    pub retries: usize,

    pub workers_started: usize,

    /// Workers lost to crashes and timeouts
    pub workers_lost: usize,

    pub elapsed_ms: u64,
}

impl BatchStats {
    fn record(&mut self, status: LineStatus) {
        match status {
            LineStatus::Success => self.succeeded += 1,
            LineStatus::UserError => self.user_errors += 1,
            LineStatus::SystemError => self.system_errors += 1,
            LineStatus::Timeout => self.timeouts += 1,
            LineStatus::Cancelled => self.cancelled += 1,
        }
    }

    /// Lines that did not succeed
    pub fn failed(&self) -> usize {
        self.total - self.succeeded
    }
}

/// Caller's side of a running batch
pub struct BatchHandle {
    run_id: String,
    results: mpsc::UnboundedReceiver<ResultEnvelope>,
    cancel: CancellationToken,
    task: JoinHandle<Result<BatchStats>>,
}

impl BatchHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next terminal envelope, in completion order
    ///
    /// Returns `None` once every line has been reported.
    pub async fn next(&mut self) -> Option<ResultEnvelope> {
        self.results.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this batch, e.g. from a signal handler
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait for the coordinator to finish
    pub async fn finish(self) -> Result<BatchStats> {
        self.task
            .await
            .map_err(|e| EngineError::RuntimeError(format!("batch coordinator failed: {}", e)))?
    }

    /// Drain every envelope, sorted by line, then finish
    pub async fn collect(mut self) -> Result<(Vec<ResultEnvelope>, BatchStats)> {
        let mut envelopes = Vec::new();
        while let Some(envelope) = self.next().await {
            envelopes.push(envelope);
        }
        envelopes.sort_by_key(|envelope| envelope.line_index);
        let stats = self.finish().await?;
        Ok((envelopes, stats))
    }
}

/// Bounded pool of worker processes executing batch lines
pub struct LineExecutionPool {
    config: PoolConfig,
    manager: Arc<ProcessManager>,
    template: WorkerTemplate,
    exporter: Arc<dyn SpanExporter>,

    /// Cancellation token per active batch
    active: Arc<DashMap<String, CancellationToken>>,
}

impl LineExecutionPool {
    pub fn new(
        config: PoolConfig,
        manager: ProcessManager,
        template: WorkerTemplate,
        exporter: Arc<dyn SpanExporter>,
    ) -> Self {
        Self {
            config,
            manager: Arc::new(manager),
            template,
            exporter,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Start a batch; envelopes stream through the returned handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, request: BatchRequest) -> Result<BatchHandle> {
        if request.flow.name.is_empty() {
            return Err(EngineError::ConfigError("flow name is empty".to_string()));
        }
        if self.config.worker_count == 0 {
            return Err(EngineError::ConfigError(
                "worker_count must be at least 1".to_string(),
            ));
        }

        let cancel = CancellationToken::new();
        match self.active.entry(request.run_id.clone()) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateRun(request.run_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
            }
        }

        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let coordinator = BatchCoordinator::new(
            &request,
            self.config.clone(),
            self.manager.clone(),
            self.template.clone(),
            self.exporter.clone(),
            cancel.clone(),
            results_tx,
        );

        let active = self.active.clone();
        let run_id = request.run_id.clone();
        let task = tokio::spawn(async move {
            let result = coordinator.run().await;
            active.remove(&run_id);
            result
        });

        Ok(BatchHandle {
            run_id: request.run_id,
            results: results_rx,
            cancel,
            task,
        })
    }

    /// Cancel an active batch; false if no such run is active
    pub fn cancel(&self, run_id: &str) -> bool {
        match self.active.get(run_id) {
            Some(token) => {
                info!(run_id, "cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_runs(&self) -> Vec<String> {
        self.active.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Sent by worker channel tasks to their coordinator
enum PoolEvent {
    Ready { worker: WorkerHandle, writer: FrameWriter },
    StartFailed { worker_id: usize, error: String },
    Message { worker_id: usize, message: WorkerMessage },
    Disconnected { worker_id: usize, reason: Option<String> },
}

struct ActiveWorker {
    handle: WorkerHandle,
    writer: FrameWriter,
}

/// A worker taken out of service, with the line it was running
struct RetiredWorker {
    handle: WorkerHandle,
    in_flight: Option<(usize, Duration)>,
}

struct BatchCoordinator {
    run_id: String,
    flow: FlowReference,
    config: PoolConfig,
    manager: Arc<ProcessManager>,
    template: WorkerTemplate,
    exporter: Arc<dyn SpanExporter>,
    cancel: CancellationToken,
    results: mpsc::UnboundedSender<ResultEnvelope>,
    events_tx: mpsc::UnboundedSender<PoolEvent>,
    events_rx: mpsc::UnboundedReceiver<PoolEvent>,

    jobs: Vec<Job>,
    pending: VecDeque<usize>,
    attempts: Vec<u32>,
    delivered: Vec<bool>,
    delivered_count: usize,

    workers: BTreeMap<usize, ActiveWorker>,
    tasks: HashMap<usize, JoinHandle<()>>,
    starting: usize,
    target: usize,
    next_worker_id: usize,
    startup_failures: u32,

    cancelled: bool,
    fatal: Option<String>,
    stats: BatchStats,
}

impl BatchCoordinator {
    fn new(
        request: &BatchRequest,
        config: PoolConfig,
        manager: Arc<ProcessManager>,
        template: WorkerTemplate,
        exporter: Arc<dyn SpanExporter>,
        cancel: CancellationToken,
        results: mpsc::UnboundedSender<ResultEnvelope>,
    ) -> Self {
        let jobs = request.jobs();
        let total = jobs.len();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Self {
            run_id: request.run_id.clone(),
            flow: request.flow.clone(),
            target: config.worker_count,
            config,
            manager,
            template,
            exporter,
            cancel,
            results,
            events_tx,
            events_rx,
            pending: (0..total).collect(),
            attempts: vec![0; total],
            delivered: vec![false; total],
            delivered_count: 0,
            jobs,
            workers: BTreeMap::new(),
            tasks: HashMap::new(),
            starting: 0,
            next_worker_id: 0,
            startup_failures: 0,
            cancelled: false,
            fatal: None,
            stats: BatchStats {
                total,
                ..Default::default()
            },
        }
    }

    async fn run(mut self) -> Result<BatchStats> {
        let started = Instant::now();
        info!(
            run_id = %self.run_id,
            flow = %self.flow.name,
            lines = self.jobs.len(),
            workers = self.target,
            strategy = ?self.manager.strategy(),
            "batch started"
        );

        let mut liveness = tokio::time::interval(self.config.liveness_interval);
        liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancel = self.cancel.clone();

        while !self.is_complete() {
            if let Some(reason) = self.fatal.take() {
                self.fail_remaining(&reason).await;
                self.shutdown().await;
                error!(run_id = %self.run_id, "batch aborted: {}", reason);
                return Err(EngineError::PoolExhausted(reason));
            }

            self.fill_workers();
            self.dispatch().await;
            if self.is_complete() {
                break;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled(), if !self.cancelled => self.cancel_batch().await,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
                _ = liveness.tick() => self.check_workers().await,
            }
        }

        self.shutdown().await;
        self.stats.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            run_id = %self.run_id,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed(),
            elapsed_ms = self.stats.elapsed_ms,
            "batch finished"
        );
        Ok(self.stats)
    }

    fn is_complete(&self) -> bool {
        self.delivered_count == self.jobs.len()
    }

    fn busy_count(&self) -> usize {
        self.workers
            .values()
            .filter(|worker| worker.handle.state == WorkerState::Busy)
            .count()
    }

    fn idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .find(|(_, worker)| worker.handle.state == WorkerState::Idle)
            .map(|(id, _)| *id)
    }

    /// Start workers lazily, never more than there is work for
    fn fill_workers(&mut self) {
        if self.cancelled || self.fatal.is_some() {
            return;
        }

        let wanted = self.target.min(self.pending.len() + self.busy_count());
        while self.workers.len() + self.starting < wanted {
            let worker_id = self.next_worker_id;
            self.next_worker_id += 1;
            self.starting += 1;

            let bootstrap = self.template.bootstrap(worker_id, &self.run_id, &self.flow);
            let task = tokio::spawn(worker_channel(
                self.manager.clone(),
                bootstrap,
                self.config.startup_timeout,
                self.events_tx.clone(),
            ));
            self.tasks.insert(worker_id, task);
        }
    }

    /// Hand pending lines to idle workers, oldest first
    async fn dispatch(&mut self) {
        while !self.pending.is_empty() {
            let Some(worker_id) = self.idle_worker() else {
                break;
            };
            let Some(line) = self.pending.pop_front() else {
                break;
            };
            self.attempts[line] += 1;

            let frame = match encode(&WorkerCommand::Execute {
                job: self.jobs[line].clone(),
            }) {
                Ok(frame) => frame,
                Err(e) => {
                    let envelope = self.failure_envelope(
                        line,
                        LineStatus::SystemError,
                        ErrorDetail::new("SerializationError", e.to_string()),
                        None,
                        Duration::ZERO,
                    );
                    self.deliver(envelope);
                    continue;
                }
            };

            let Some(worker) = self.workers.get_mut(&worker_id) else {
                break;
            };
            worker.handle.assign(line);
            debug!(run_id = %self.run_id, line, worker_id, "line dispatched");

            if let Err(e) = worker.writer.send(frame).await {
                warn!(worker_id, line, "failed to send job to worker: {}", e);
                // The job never reached the worker
                self.attempts[line] -= 1;
                self.pending.push_front(line);
                self.retire_worker(worker_id, WorkerState::Crashed).await;
                self.stats.workers_lost += 1;
            }
        }
    }

    async fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Ready { mut worker, writer } => {
                self.starting = self.starting.saturating_sub(1);
                self.startup_failures = 0;
                worker.state = WorkerState::Idle;
                self.stats.workers_started += 1;
                counter!(names::WORKERS_STARTED_TOTAL).increment(1);
                info!(run_id = %self.run_id, worker_id = worker.id, pid = ?worker.pid(), "worker ready");
                self.workers.insert(worker.id, ActiveWorker { handle: worker, writer });
            }
            PoolEvent::StartFailed { worker_id, error } => {
                self.starting = self.starting.saturating_sub(1);
                self.tasks.remove(&worker_id);
                self.startup_failures += 1;
                self.on_startup_failure(worker_id, error);
            }
            PoolEvent::Message { worker_id, message } => match message {
                WorkerMessage::Completed { envelope } => self.complete(worker_id, envelope),
                WorkerMessage::Ready { pid } => {
                    debug!(worker_id, pid, "ignoring repeated ready");
                }
            },
            PoolEvent::Disconnected { worker_id, reason } => {
                if !self.workers.contains_key(&worker_id) {
                    return;
                }
                let message = match reason {
                    Some(reason) => format!("worker {} disconnected: {}", worker_id, reason),
                    None => format!("worker {} exited unexpectedly", worker_id),
                };
                warn!(run_id = %self.run_id, worker_id, "{}", message);
                self.worker_lost(
                    worker_id,
                    LineStatus::SystemError,
                    ErrorDetail::new("WorkerCrashed", message),
                )
                .await;
            }
        }
    }

    fn on_startup_failure(&mut self, worker_id: usize, error: String) {
        warn!(run_id = %self.run_id, worker_id, "worker failed to start: {}", error);

        let live = self.workers.len() + self.starting;
        if live == 0 {
            self.fatal = Some(format!("no worker could be started: {}", error));
        } else if self.startup_failures >= self.config.max_startup_failures {
            self.fatal = Some(format!(
                "{} consecutive worker startup failures, last: {}",
                self.startup_failures, error
            ));
        } else if live < self.target {
            // Carry on with the workers we have
            self.target = live;
            warn!(run_id = %self.run_id, target = live, "concurrency lowered");
        }
    }

    fn complete(&mut self, worker_id: usize, mut envelope: ResultEnvelope) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            debug!(worker_id, "result from discarded worker ignored");
            return;
        };
        if envelope.run_id != self.run_id || worker.handle.current_job != Some(envelope.line_index) {
            warn!(
                worker_id,
                line = envelope.line_index,
                "unexpected result from worker ignored"
            );
            return;
        }

        worker.handle.release();
        let line = envelope.line_index;
        envelope.worker_id = Some(worker_id);
        envelope.attempts = self.attempts[line];
        self.deliver(envelope);
    }

    /// Probe every worker: dead processes and lines over budget
    async fn check_workers(&mut self) {
        let ids: Vec<usize> = self.workers.keys().copied().collect();
        for worker_id in ids {
            let Some(worker) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            let alive = self.manager.is_alive(&mut worker.handle);
            let busy_for = worker.handle.busy_for();
            let pid = worker.handle.pid();

            if !alive {
                warn!(run_id = %self.run_id, worker_id, ?pid, "worker process died");
                self.worker_lost(
                    worker_id,
                    LineStatus::SystemError,
                    ErrorDetail::new(
                        "WorkerCrashed",
                        format!("worker {} (pid {:?}) exited unexpectedly", worker_id, pid),
                    ),
                )
                .await;
                continue;
            }

            if let Some(elapsed) = busy_for {
                if elapsed > self.config.line_timeout {
                    warn!(run_id = %self.run_id, worker_id, ?elapsed, "line timed out");
                    self.worker_lost(
                        worker_id,
                        LineStatus::Timeout,
                        ErrorDetail::new(
                            "LineTimeout",
                            format!("line exceeded {:?} wall-clock budget", self.config.line_timeout),
                        ),
                    )
                    .await;
                }
            }
        }
    }

    /// Take a worker out of service and kill its process
    async fn retire_worker(&mut self, worker_id: usize, state: WorkerState) -> Option<RetiredWorker> {
        if let Some(task) = self.tasks.remove(&worker_id) {
            task.abort();
        }
        let ActiveWorker { mut handle, .. } = self.workers.remove(&worker_id)?;
        let in_flight = handle.retire(state);

        if let Err(e) = self.manager.terminate(&mut handle, Duration::ZERO).await {
            warn!(worker_id, "failed to terminate worker: {}", e);
        }
        Some(RetiredWorker { handle, in_flight })
    }

    async fn worker_lost(&mut self, worker_id: usize, status: LineStatus, detail: ErrorDetail) {
        self.stats.workers_lost += 1;
        counter!(names::WORKERS_REPLACED_TOTAL).increment(1);

        let state = match status {
            LineStatus::Timeout => WorkerState::Terminating,
            _ => WorkerState::Crashed,
        };
        let Some(retired) = self.retire_worker(worker_id, state).await else {
            return;
        };
        debug!(
            run_id = %self.run_id,
            worker_id,
            state = ?retired.handle.state,
            jobs_completed = retired.handle.jobs_completed,
            "worker retired"
        );
        if let Some((line, elapsed)) = retired.in_flight {
            self.fail_line(line, status, detail, worker_id, elapsed);
        }
    }

    fn fail_line(
        &mut self,
        line: usize,
        status: LineStatus,
        detail: ErrorDetail,
        worker_id: usize,
        elapsed: Duration,
    ) {
        let attempts = self.attempts[line];
        if !self.cancelled && self.config.retry.should_retry(status, attempts) {
            info!(
                run_id = %self.run_id,
                line,
                attempts,
                "re-dispatching line after {}",
                status.as_str()
            );
            self.stats.retries += 1;
            self.pending.push_front(line);
            return;
        }

        let envelope = self.failure_envelope(line, status, detail, Some(worker_id), elapsed);
        self.deliver(envelope);
    }

    fn failure_envelope(
        &self,
        line: usize,
        status: LineStatus,
        detail: ErrorDetail,
        worker_id: Option<usize>,
        elapsed: Duration,
    ) -> ResultEnvelope {
        let job = &self.jobs[line];
        let mut envelope = ResultEnvelope::terminal(job, status, Some(detail.clone()));
        envelope.spans = failure_trace(job, &self.template.collection, &detail);
        envelope.worker_id = worker_id;
        envelope.duration_ms = elapsed.as_millis() as u64;
        envelope.attempts = self.attempts[line];
        envelope
    }

    fn cancelled_envelope(&self, line: usize, worker_id: Option<usize>) -> ResultEnvelope {
        let mut envelope = ResultEnvelope::terminal(
            &self.jobs[line],
            LineStatus::Cancelled,
            Some(ErrorDetail::new("Cancelled", "batch run was cancelled")),
        );
        envelope.worker_id = worker_id;
        envelope.attempts = self.attempts[line];
        envelope
    }

    /// Record a terminal envelope; at most once per line
    fn deliver(&mut self, envelope: ResultEnvelope) {
        let line = envelope.line_index;
        if self.delivered[line] {
            warn!(run_id = %self.run_id, line, "duplicate result dropped");
            return;
        }
        self.delivered[line] = true;
        self.delivered_count += 1;

        self.stats.record(envelope.status);
        counter!(names::LINES_TOTAL, "status" => envelope.status.as_str()).increment(1);
        histogram!(names::LINE_DURATION_SECONDS).record(envelope.duration_ms as f64 / 1000.0);
        debug!(
            run_id = %self.run_id,
            line,
            status = envelope.status.as_str(),
            attempts = envelope.attempts,
            "line finished"
        );

        if !envelope.spans.is_empty() {
            self.exporter.export(envelope.spans.clone());
        }
        // The caller may have stopped listening
        let _ = self.results.send(envelope);
    }

    async fn cancel_batch(&mut self) {
        self.cancelled = true;
        info!(
            run_id = %self.run_id,
            pending = self.pending.len(),
            in_flight = self.busy_count(),
            "cancelling batch"
        );

        while let Some(line) = self.pending.pop_front() {
            let envelope = self.cancelled_envelope(line, None);
            self.deliver(envelope);
        }

        let busy: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.handle.state == WorkerState::Busy)
            .map(|(id, _)| *id)
            .collect();
        for worker_id in busy {
            if let Some(RetiredWorker {
                in_flight: Some((line, elapsed)),
                ..
            }) = self.retire_worker(worker_id, WorkerState::Terminating).await
            {
                let mut envelope = self.cancelled_envelope(line, Some(worker_id));
                envelope.duration_ms = elapsed.as_millis() as u64;
                self.deliver(envelope);
            }
        }
    }

    /// Every undelivered line becomes a SystemError
    async fn fail_remaining(&mut self, reason: &str) {
        let detail = ErrorDetail::new("PoolExhausted", reason);

        let busy: Vec<usize> = self.workers.keys().copied().collect();
        for worker_id in busy {
            if let Some(RetiredWorker {
                in_flight: Some((line, elapsed)),
                ..
            }) = self.retire_worker(worker_id, WorkerState::Terminating).await
            {
                let envelope = self.failure_envelope(
                    line,
                    LineStatus::SystemError,
                    detail.clone(),
                    Some(worker_id),
                    elapsed,
                );
                self.deliver(envelope);
            }
        }

        while let Some(line) = self.pending.pop_front() {
            let envelope =
                self.failure_envelope(line, LineStatus::SystemError, detail.clone(), None, Duration::ZERO);
            self.deliver(envelope);
        }
    }

    /// Stop every remaining worker
    ///
    /// Workers still starting are aborted; dropping their handle kills the
    /// process.
    async fn shutdown(&mut self) {
        for (_, task) in self.tasks.drain() {
            task.abort();
        }

        let grace = self.config.terminate_grace;
        let workers = std::mem::take(&mut self.workers);
        join_all(
            workers
                .into_values()
                .map(|worker| stop_worker(self.manager.clone(), worker, grace)),
        )
        .await;
    }
}

/// Ask a worker to exit, killing it if it has not within `grace`
async fn stop_worker(manager: Arc<ProcessManager>, worker: ActiveWorker, grace: Duration) {
    let ActiveWorker { mut handle, mut writer } = worker;
    if let Ok(frame) = encode(&WorkerCommand::Shutdown) {
        let _ = writer.send(frame).await;
    }
    drop(writer);

    let deadline = Instant::now() + grace;
    while manager.is_alive(&mut handle) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    if let Err(e) = manager.terminate(&mut handle, Duration::ZERO).await {
        warn!(worker_id = handle.id, "failed to stop worker: {}", e);
    }
}

/// Start one worker, wait for it to report ready, then forward its messages
async fn worker_channel(
    manager: Arc<ProcessManager>,
    bootstrap: WorkerBootstrap,
    startup_timeout: Duration,
    events: mpsc::UnboundedSender<PoolEvent>,
) {
    let worker_id = bootstrap.worker_id;
    let (handle, channel) = match manager.start(&bootstrap).await {
        Ok(started) => started,
        Err(e) => {
            let _ = events.send(PoolEvent::StartFailed {
                worker_id,
                error: e.to_string(),
            });
            return;
        }
    };

    let mut reader = FramedRead::new(channel.reader, codec());
    let writer = FramedWrite::new(channel.writer, codec());

    match tokio::time::timeout(startup_timeout, wait_ready(&mut reader)).await {
        Ok(Ok(pid)) => debug!(worker_id, pid, "worker reported ready"),
        Ok(Err(e)) => return startup_failed(&manager, handle, &events, e.to_string()).await,
        Err(_) => {
            let error = format!("no ready signal within {:?}", startup_timeout);
            return startup_failed(&manager, handle, &events, error).await;
        }
    }

    if let Err(SendError(PoolEvent::Ready { mut worker, .. })) =
        events.send(PoolEvent::Ready { worker: handle, writer })
    {
        // Coordinator already gone
        let _ = manager.terminate(&mut worker, Duration::ZERO).await;
        return;
    }

    let reason = loop {
        match reader.next().await {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match decode::<WorkerMessage>(&line) {
                    Ok(message) => {
                        if events.send(PoolEvent::Message { worker_id, message }).is_err() {
                            return;
                        }
                    }
                    Err(e) => break Some(e.to_string()),
                }
            }
            Some(Err(e)) => break Some(format!("channel read failed: {}", e)),
            None => break None,
        }
    };
    let _ = events.send(PoolEvent::Disconnected { worker_id, reason });
}

async fn wait_ready(reader: &mut FrameReader) -> Result<u32> {
    while let Some(line) = reader.next().await {
        let line = line.map_err(|e| EngineError::WorkerProtocol(format!("channel read failed: {}", e)))?;
        if line.trim().is_empty() {
            continue;
        }
        return match decode::<WorkerMessage>(&line)? {
            WorkerMessage::Ready { pid } => Ok(pid),
            WorkerMessage::Completed { .. } => Err(EngineError::WorkerProtocol(
                "result received before ready".to_string(),
            )),
        };
    }
    Err(EngineError::WorkerProtocol(
        "worker exited before reporting ready".to_string(),
    ))
}

async fn startup_failed(
    manager: &ProcessManager,
    mut handle: WorkerHandle,
    events: &mpsc::UnboundedSender<PoolEvent>,
    error: String,
) {
    if let Err(e) = manager.terminate(&mut handle, Duration::ZERO).await {
        debug!(worker_id = handle.id, "terminate after failed start: {}", e);
    }
    let _ = events.send(PoolEvent::StartFailed {
        worker_id: handle.id,
        error,
    });
}

/// Span tree standing in for a line whose worker never reported back
fn failure_trace(job: &Job, collection: &str, detail: &ErrorDetail) -> Vec<Span> {
    let mut resource = Map::new();
    resource.insert(RESOURCE_COLLECTION.to_string(), Value::from(collection));
    let recorder = SpanRecorder::new(resource);

    let mut root = recorder.start_span(job.flow.name.clone(), None, span_types::FLOW);
    for (key, value) in job.root_attributes() {
        root.set_attribute(key, value);
    }
    root.record_payload(events::INPUTS, &Value::Object(job.inputs.clone()));

    let mut exception = Map::new();
    exception.insert(attr::EXCEPTION_TYPE.to_string(), Value::from(detail.kind.clone()));
    exception.insert(attr::EXCEPTION_MESSAGE.to_string(), Value::from(detail.message.clone()));
    root.add_event(events::EXCEPTION, exception);
    root.end(SpanStatus::error(detail.message.clone()));

    recorder.take_finished()
}
