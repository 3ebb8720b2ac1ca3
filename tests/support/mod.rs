// tests/support/mod.rs
#![allow(dead_code)]

use flowrun_engine::recording::{CollectingExporter, SpanExporter};
use flowrun_engine::runtime::flows::builtin_environment;
use flowrun_engine::runtime::{
    ConnectionSource, LineExecutionPool, PoolConfig, ProcessLauncher, ProcessManager,
    SpawnLauncher, WorkerTemplate,
};
use serde_json::{Map, Value};
use std::sync::{Arc, Once};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Pool settings tuned for quick tests
pub fn fast_config(worker_count: usize) -> PoolConfig {
    PoolConfig {
        worker_count,
        line_timeout: Duration::from_secs(30),
        liveness_interval: Duration::from_millis(50),
        startup_timeout: Duration::from_secs(15),
        terminate_grace: Duration::from_millis(500),
        ..PoolConfig::default()
    }
}

pub fn template(connections: ConnectionSource) -> WorkerTemplate {
    WorkerTemplate {
        connections,
        collection: "integration".to_string(),
        log_filter: "warn".to_string(),
        ..WorkerTemplate::default()
    }
}

/// Clean-strategy launcher running the built `flowrun worker`
pub fn spawn_launcher() -> Arc<dyn ProcessLauncher> {
    Arc::new(SpawnLauncher::new(env!("CARGO_BIN_EXE_flowrun")).arg("worker"))
}

/// Duplicate-strategy launcher over the built-in flows
#[cfg(unix)]
pub fn fork_launcher(template: &WorkerTemplate) -> Arc<dyn ProcessLauncher> {
    let environment = builtin_environment(&template.hooks, &template.connections, &template.collection)
        .expect("built-in environment");
    Arc::new(flowrun_engine::runtime::ForkLauncher::new(Arc::new(environment)))
}

pub fn pool(
    launcher: Arc<dyn ProcessLauncher>,
    config: PoolConfig,
    template: WorkerTemplate,
    exporter: Arc<dyn SpanExporter>,
) -> LineExecutionPool {
    LineExecutionPool::new(config, ProcessManager::new(launcher), template, exporter)
}

pub fn collecting() -> (CollectingExporter, Arc<dyn SpanExporter>) {
    let exporter = CollectingExporter::new();
    let shared: Arc<dyn SpanExporter> = Arc::new(exporter.clone());
    (exporter, shared)
}

pub fn rows(values: Vec<Value>) -> Vec<Map<String, Value>> {
    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => map,
            other => panic!("row must be an object, got {}", other),
        })
        .collect()
}
