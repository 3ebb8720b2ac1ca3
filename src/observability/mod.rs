// src/observability/mod.rs
//! Logging and metrics setup
//!
//! Logs always go to stderr: a clean-strategy worker uses its stdout as the
//! protocol channel back to the coordinator.

use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Metric names emitted by the engine
pub mod names {
    pub const LINES_TOTAL: &str = "flowrun_lines_total";
    pub const LINE_DURATION_SECONDS: &str = "flowrun_line_duration_seconds";
    pub const WORKERS_STARTED_TOTAL: &str = "flowrun_workers_started_total";
    pub const WORKERS_REPLACED_TOTAL: &str = "flowrun_workers_replaced_total";
    pub const EVALUATION_RETRIES_TOTAL: &str = "flowrun_evaluation_retries_total";
    pub const PERSIST_FAILURES_TOTAL: &str = "flowrun_persist_failures_total";
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_filter` when set.
pub fn init_tracing(format: LogFormat, default_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .map_err(|e| EngineError::ConfigError(format!("invalid log filter: {}", e)))?;

    let installed = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init(),
    };

    installed.map_err(|e| EngineError::ConfigError(format!("tracing already initialized: {}", e)))
}

/// Install the Prometheus exporter when an address is configured
///
/// Without an address the `metrics` macros stay no-ops.
pub fn init_metrics(listen_addr: Option<&str>) -> Result<()> {
    let Some(addr) = listen_addr else {
        return Ok(());
    };

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| EngineError::ConfigError(format!("invalid metrics address {}: {}", addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}
