// src/runtime/worker.rs
//! Worker runtime
//!
//! Runs inside a worker process. It executes one job at a time:
//! - binds the job's connections
//! - invokes the flow, driving async flows to completion
//! - captures the span tree produced during the invocation
//! - classifies the outcome; flow errors and panics become UserError
//!
//! Crashes, hangs and aborts are not reported from here; the pool detects
//! them from the outside.

use crate::interception::HookRegistry;
use crate::observability::{init_tracing, LogFormat};
use crate::recording::recorder::SpanRecorder;
use crate::recording::span::{attr, events, span_types, SpanStatus, RESOURCE_COLLECTION};
use crate::runtime::connections::ConnectionResolver;
use crate::runtime::invocable::{FlowError, FlowRegistry, Invocable, LineContext};
use crate::runtime::job::{ErrorDetail, FlowReference, Job, LineStatus, ResultEnvelope};
use crate::runtime::protocol::{decode, encode, WorkerBootstrap, WorkerCommand, WorkerMessage};
use crate::utils::errors::{EngineError, Result};
use futures::FutureExt;
use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, Write};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Flows, connections and hooks a worker runs with
///
/// Under the duplicate strategy the parent builds this once and every
/// forked worker inherits it, hooks already wired.
pub struct WorkerEnvironment {
    pub flows: FlowRegistry,
    pub connections: Arc<dyn ConnectionResolver>,
    pub hooks: Arc<HookRegistry>,
    pub collection: String,
}

pub struct WorkerRuntime {
    env: Arc<WorkerEnvironment>,
    worker_id: usize,

    /// Flow instances, created once per worker
    instances: HashMap<String, Arc<dyn Invocable>>,
}

impl WorkerRuntime {
    pub fn new(env: Arc<WorkerEnvironment>, worker_id: usize) -> Self {
        Self {
            env,
            worker_id,
            instances: HashMap::new(),
        }
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Instantiate `flow` if this worker has not yet done so
    pub fn prepare(&mut self, flow: &FlowReference) -> std::result::Result<Arc<dyn Invocable>, FlowError> {
        if let Some(instance) = self.instances.get(&flow.name) {
            return Ok(instance.clone());
        }

        let instance = self
            .env
            .flows
            .instantiate(flow, self.env.connections.as_ref())?;
        self.instances.insert(flow.name.clone(), instance.clone());
        Ok(instance)
    }

    /// Run one job to a terminal envelope
    pub async fn execute(&mut self, job: Job) -> ResultEnvelope {
        let started = Instant::now();
        debug!(run_id = %job.run_id, line = job.line_index, "executing line");

        let mut resource = Map::new();
        resource.insert(
            RESOURCE_COLLECTION.to_string(),
            Value::from(self.env.collection.clone()),
        );
        let recorder = SpanRecorder::new(resource);

        let mut root = recorder.start_span(job.flow.name.clone(), None, span_types::FLOW);
        for (key, value) in job.root_attributes() {
            root.set_attribute(key, value);
        }
        root.record_payload(events::INPUTS, &Value::Object(job.inputs.clone()));

        let root_span_id = root.span_id().to_string();
        let outcome = self.run_flow(&job, &recorder, root_span_id).await;

        let mut token_attributes = Map::new();
        recorder.token_usage().apply_to(&mut token_attributes);
        for (key, value) in token_attributes {
            root.set_attribute(key, value);
        }

        let (status, output, error) = match outcome {
            Ok(output) => {
                root.record_payload(events::OUTPUT, &output);
                root.end(SpanStatus::ok());
                (LineStatus::Success, Some(output), None)
            }
            Err(detail) => {
                let mut exception = Map::new();
                exception.insert(attr::EXCEPTION_TYPE.to_string(), Value::from(detail.kind.clone()));
                exception.insert(
                    attr::EXCEPTION_MESSAGE.to_string(),
                    Value::from(detail.message.clone()),
                );
                root.add_event(events::EXCEPTION, exception);
                root.end(SpanStatus::error(detail.message.clone()));
                (LineStatus::UserError, None, Some(detail))
            }
        };

        ResultEnvelope {
            run_id: job.run_id,
            line_index: job.line_index,
            line_run_id: job.line_run_id,
            status,
            output,
            error,
            spans: recorder.take_finished(),
            worker_id: Some(self.worker_id),
            duration_ms: started.elapsed().as_millis() as u64,
            attempts: 1,
        }
    }

    async fn run_flow(
        &mut self,
        job: &Job,
        recorder: &SpanRecorder,
        root_span_id: String,
    ) -> std::result::Result<Value, ErrorDetail> {
        let invocable = self.prepare(&job.flow).map_err(|e| detail(&e))?;

        let mut connections = BTreeMap::new();
        for (input, name) in &job.connection_bindings {
            let connection = self
                .env
                .connections
                .get(name)
                .map_err(|e| detail(&FlowError::from(e)))?;
            connections.insert(input.clone(), connection);
        }

        let ctx = LineContext::new(
            recorder.clone(),
            root_span_id,
            connections,
            self.env.hooks.clone(),
        );

        // The invoke call itself runs inside the guarded future
        let invocation = AssertUnwindSafe(async { invocable.invoke(&ctx, &job.inputs).await });
        match invocation.catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(detail(&e)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(line = job.line_index, "flow panicked: {}", message);
                Err(ErrorDetail::new("Panic", message))
            }
        }
    }
}

fn detail(error: &FlowError) -> ErrorDetail {
    ErrorDetail::new(error.kind(), error.message())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "flow panicked".to_string()
    }
}

fn send<W: Write>(writer: &mut W, message: &WorkerMessage) -> Result<()> {
    let line = encode(message)?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Blocking command loop
///
/// Reports ready, then executes jobs until `Shutdown` or end of input.
pub fn serve<R: BufRead, W: Write>(runtime: &mut WorkerRuntime, reader: R, mut writer: W) -> Result<()> {
    let executor = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    send(
        &mut writer,
        &WorkerMessage::Ready {
            pid: std::process::id(),
        },
    )?;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match decode::<WorkerCommand>(&line)? {
            WorkerCommand::Execute { job } => {
                let envelope = executor.block_on(runtime.execute(job));
                send(&mut writer, &WorkerMessage::Completed { envelope })?;
            }
            WorkerCommand::Shutdown => {
                debug!(worker_id = runtime.worker_id(), "shutdown requested");
                break;
            }
        }
    }

    Ok(())
}

fn warm_up(runtime: &mut WorkerRuntime, flow: &FlowReference) {
    if let Err(e) = runtime.prepare(flow) {
        // Every job will report the same error as a UserError
        warn!(flow = %flow.name, "flow init failed: {}", e);
    }
}

/// Entry point of a forked worker; the environment is inherited
#[cfg(unix)]
pub fn serve_forked(
    env: Arc<WorkerEnvironment>,
    bootstrap: &WorkerBootstrap,
    stream: std::os::unix::net::UnixStream,
) -> Result<()> {
    bootstrap.limits.apply()?;

    let reader = std::io::BufReader::new(stream.try_clone()?);
    let mut runtime = WorkerRuntime::new(env, bootstrap.worker_id);
    warm_up(&mut runtime, &bootstrap.flow);
    serve(&mut runtime, reader, stream)
}

/// Entry point of a clean-strategy worker
///
/// Reads the bootstrap line from stdin, rebuilds the environment with
/// `build` (which re-applies hook substitution), then serves over
/// stdin/stdout. Flow code must not write to stdout.
pub fn run_stdio<F>(build: F) -> Result<()>
where
    F: FnOnce(&WorkerBootstrap) -> Result<WorkerEnvironment>,
{
    let stdin = std::io::stdin();
    let mut reader = stdin.lock();

    let mut first = String::new();
    if reader.read_line(&mut first)? == 0 {
        return Err(EngineError::WorkerProtocol(
            "stdin closed before bootstrap".to_string(),
        ));
    }
    let bootstrap: WorkerBootstrap = decode(&first)?;

    if let Err(e) = init_tracing(LogFormat::Pretty, &bootstrap.log_filter) {
        eprintln!("worker {}: {}", bootstrap.worker_id, e);
    }

    let env = Arc::new(build(&bootstrap)?);
    bootstrap.limits.apply()?;

    info!(
        worker_id = bootstrap.worker_id,
        run_id = %bootstrap.run_id,
        "clean worker started"
    );

    let mut runtime = WorkerRuntime::new(env, bootstrap.worker_id);
    warm_up(&mut runtime, &bootstrap.flow);

    let stdout = std::io::stdout();
    serve(&mut runtime, reader, stdout.lock())
}
