// src/main.rs
//! Flowrun CLI
//!
//! `flowrun run` executes a built-in flow over a JSONL dataset on a pool of
//! worker processes. The hidden `flowrun worker` subcommand is the entry
//! point of clean-strategy workers and speaks the protocol on stdin/stdout.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use flowrun_engine::observability::{init_metrics, init_tracing};
use flowrun_engine::persistence::{DocumentStore, MemoryStore, SqliteStore, SummaryExporter};
use flowrun_engine::recording::{FanoutExporter, JsonlExporter, SpanExporter};
use flowrun_engine::runtime::flows::{builtin_environment, builtin_flows};
use flowrun_engine::runtime::worker;
#[cfg(unix)]
use flowrun_engine::runtime::ForkLauncher;
use flowrun_engine::runtime::{
    BatchRequest, ConnectionSource, FlowReference, LaunchStrategy, LineExecutionPool,
    ProcessLauncher, ProcessManager, RunReference, SpawnLauncher, WorkerTemplate,
};
use flowrun_engine::utils::config::{EngineConfig, StoreKind};
use flowrun_engine::EngineError;
use serde_json::{json, Map, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Batch flow runner
#[derive(Parser)]
#[command(name = "flowrun", version)]
#[command(about = "Run a flow over every row of a dataset on isolated worker processes", long_about = None)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a batch
    Run(RunArgs),

    /// List built-in flows
    Flows,

    /// Clean-strategy worker entry point
    #[command(hide = true)]
    Worker,
}

#[derive(Args)]
struct RunArgs {
    /// JSONL dataset, one JSON object per line
    dataset: PathBuf,

    /// Flow to run
    #[arg(short, long)]
    flow: String,

    /// Init arguments for class-style flows, as a JSON object
    #[arg(long)]
    init: Option<String>,

    /// Bind a flow input to a connection, `input=connection`
    #[arg(long = "bind", value_parser = parse_binding)]
    bindings: Vec<(String, String)>,

    /// Batch run this run evaluates
    #[arg(long)]
    evaluate: Option<String>,

    /// Worker processes
    #[arg(short, long)]
    workers: Option<usize>,

    /// Process creation strategy: auto, fork or spawn
    #[arg(long, value_parser = parse_strategy)]
    strategy: Option<LaunchStrategy>,

    /// Per-line timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Write result envelopes to this file as JSONL
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Write every span to this file as JSONL
    #[arg(long)]
    spans: Option<PathBuf>,

    /// Run id; generated when absent
    #[arg(long)]
    run_id: Option<String>,
}

fn parse_binding(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((input, connection)) if !input.is_empty() && !connection.is_empty() => {
            Ok((input.to_string(), connection.to_string()))
        }
        _ => Err(format!("expected input=connection, got `{}`", raw)),
    }
}

fn parse_strategy(raw: &str) -> std::result::Result<LaunchStrategy, String> {
    match raw {
        "auto" => Ok(LaunchStrategy::Auto),
        "fork" => Ok(LaunchStrategy::Fork),
        "spawn" => Ok(LaunchStrategy::Spawn),
        other => Err(format!("unknown strategy `{}` (auto, fork, spawn)", other)),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Workers stay single-threaded: no coordinator runtime is started here
        Commands::Worker => {
            worker::run_stdio(|bootstrap| {
                builtin_environment(&bootstrap.hooks, &bootstrap.connections, &bootstrap.collection)
            })?;
            Ok(())
        }
        Commands::Flows => {
            for name in builtin_flows().names() {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Run(args) => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            init_tracing(config.observability.log_format, &config.observability.log_filter)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start runtime")?;
            runtime.block_on(run(config, args))
        }
    }
}

async fn run(config: EngineConfig, args: RunArgs) -> Result<()> {
    init_metrics(config.observability.metrics_addr.as_deref())?;

    info!("Starting flowrun v{}", flowrun_engine::VERSION);

    check_flow(&args.flow)?;
    let rows = read_dataset(&args.dataset)?;

    let mut pool_config = config.pool.to_pool_config();
    if let Some(workers) = args.workers {
        if workers == 0 {
            bail!("--workers must be at least 1");
        }
        pool_config.worker_count = workers;
    }
    if let Some(timeout) = args.timeout {
        pool_config.line_timeout = Duration::from_secs(timeout);
    }

    let connections = match &config.connections.file {
        Some(path) => ConnectionSource::File { path: path.clone() },
        None => ConnectionSource::None,
    };
    let template = WorkerTemplate {
        hooks: config.hooks.clone(),
        connections,
        limits: config.pool.worker_limits(),
        collection: config.persistence.collection_id.clone(),
        log_filter: config.observability.log_filter.clone(),
    };

    let strategy = args.strategy.unwrap_or(config.pool.strategy).resolve();
    let launcher = launcher(strategy, &template)?;
    info!(?strategy, workers = pool_config.worker_count, "worker pool configured");

    // Exporters: summaries into the document store, optionally raw spans
    let mut fanout = FanoutExporter::new();
    let summaries = if config.persistence.enabled {
        let store = open_store(&config).await?;
        let summaries = Arc::new(SummaryExporter::spawn(
            store,
            config.persistence.summary_settings(created_by()),
        ));
        fanout = fanout.with(summaries.clone());
        Some(summaries)
    } else {
        None
    };
    if let Some(path) = &args.spans {
        fanout = fanout.with(Arc::new(JsonlExporter::create(path)?));
    }
    let exporter = Arc::new(fanout);

    let pool = LineExecutionPool::new(
        pool_config,
        ProcessManager::new(launcher),
        template,
        exporter.clone(),
    );

    let run_id = args.run_id.unwrap_or_else(|| ulid::Ulid::new().to_string());
    let mut flow = FlowReference::new(args.flow.as_str());
    if let Some(init) = &args.init {
        let init: Value = serde_json::from_str(init).context("--init must be a JSON object")?;
        flow = flow.with_init(init);
    }

    let mut request = BatchRequest::new(run_id.clone(), flow, rows);
    for (input, connection) in args.bindings {
        request = request.bind(input, connection);
    }
    if let Some(batch_run_id) = args.evaluate {
        request = request.evaluating(RunReference::Batch(batch_run_id));
    }

    let mut handle = pool.submit(request)?;

    let token = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling batch");
            token.cancel();
        }
    });

    let mut output = match &args.output {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("cannot create {}", path.display()))?,
        )),
        None => None,
    };

    while let Some(envelope) = handle.next().await {
        debug!(
            line = envelope.line_index,
            status = envelope.status.as_str(),
            "line finished"
        );
        if let Some(out) = output.as_mut() {
            serde_json::to_writer(&mut *out, &envelope)?;
            out.write_all(b"\n")?;
        }
    }

    let outcome = handle.finish().await;

    if let Some(mut out) = output {
        out.flush()?;
    }
    exporter.flush();
    let persisted = match summaries {
        Some(summaries) => Some(summaries.shutdown().await),
        None => None,
    };

    let stats = outcome?;
    info!(
        run_id = %run_id,
        succeeded = stats.succeeded,
        failed = stats.failed(),
        "Batch finished"
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "run_id": run_id,
            "stats": stats,
            "persistence": persisted,
        }))?
    );
    Ok(())
}

fn launcher(strategy: LaunchStrategy, template: &WorkerTemplate) -> Result<Arc<dyn ProcessLauncher>> {
    match strategy {
        #[cfg(unix)]
        LaunchStrategy::Fork => {
            // Children inherit this environment, hook substitution included
            let environment =
                builtin_environment(&template.hooks, &template.connections, &template.collection)?;
            Ok(Arc::new(ForkLauncher::new(Arc::new(environment))))
        }
        _ => Ok(Arc::new(SpawnLauncher::current_exe()?)),
    }
}

async fn open_store(config: &EngineConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.persistence.store {
        StoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreKind::Sqlite => {
            let path = config
                .persistence
                .sqlite_path
                .as_deref()
                .ok_or_else(|| anyhow!("persistence.sqlite_path is required for the sqlite store"))?;
            Ok(Arc::new(SqliteStore::open(path).await?))
        }
    }
}

/// Unknown flows are rejected before any worker is started
fn check_flow(name: &str) -> flowrun_engine::Result<()> {
    if builtin_flows().contains(name) {
        Ok(())
    } else {
        Err(EngineError::FlowNotFound(name.to_string()))
    }
}

fn created_by() -> Map<String, Value> {
    let mut created_by = Map::new();
    let name = std::env::var("USER").unwrap_or_else(|_| "flowrun".to_string());
    created_by.insert("name".to_string(), Value::String(name));
    created_by
}

/// One JSON object per non-blank line
fn read_dataset(path: &Path) -> Result<Vec<Map<String, Value>>> {
    let file = File::open(path).with_context(|| format!("cannot open dataset {}", path.display()))?;

    let mut rows = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), index + 1))?
        {
            Value::Object(row) => rows.push(row),
            _ => bail!("{}:{}: row must be a JSON object", path.display(), index + 1),
        }
    }
    Ok(rows)
}
