// src/utils/config.rs
//! Engine configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional file
//! (TOML, YAML or JSON by extension), then `FLOWRUN__SECTION__KEY`
//! environment variables.

use crate::interception::HookConfig;
use crate::observability::LogFormat;
use crate::persistence::exporter::SummarySettings;
use crate::persistence::summary::EvaluationRetryPolicy;
use crate::runtime::line_pool::{InfraRetryPolicy, PoolConfig};
use crate::runtime::process_manager::LaunchStrategy;
use crate::runtime::resource_limiter::WorkerLimits;
use crate::utils::errors::{EngineError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolSettings,
    pub persistence: PersistenceSettings,
    pub hooks: HookConfig,
    pub connections: ConnectionSettings,
    pub observability: ObservabilitySettings,
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of worker processes (target concurrency)
    pub worker_count: usize,

    /// Process creation strategy
    pub strategy: LaunchStrategy,

    /// Wall-clock budget for one line
    pub line_timeout_secs: u64,

    /// Liveness polling interval
    pub liveness_interval_ms: u64,

    /// How long a worker may take to report ready
    pub startup_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL on orderly shutdown
    pub terminate_grace_ms: u64,

    /// Re-dispatch attempts for lines whose worker crashed
    pub max_retries: u32,

    /// Also re-dispatch lines that timed out
    pub retry_timeouts: bool,

    /// Consecutive bootstrap failures tolerated before the batch is fatal
    pub max_startup_failures: u32,

    /// Address-space cap for each worker
    pub memory_limit_mb: Option<u64>,

    /// CPU-time cap for each worker
    pub cpu_time_limit_secs: Option<u64>,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            strategy: LaunchStrategy::Auto,
            line_timeout_secs: 600,
            liveness_interval_ms: 200,
            startup_timeout_secs: 30,
            terminate_grace_ms: 2_000,
            max_retries: 0,
            retry_timeouts: false,
            max_startup_failures: 3,
            memory_limit_mb: None,
            cpu_time_limit_secs: None,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            worker_count: self.worker_count,
            line_timeout: Duration::from_secs(self.line_timeout_secs),
            liveness_interval: Duration::from_millis(self.liveness_interval_ms),
            startup_timeout: Duration::from_secs(self.startup_timeout_secs),
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            retry: InfraRetryPolicy {
                max_retries: self.max_retries,
                retry_timeouts: self.retry_timeouts,
            },
            max_startup_failures: self.max_startup_failures,
        }
    }

    pub fn worker_limits(&self) -> WorkerLimits {
        WorkerLimits {
            memory_limit_mb: self.memory_limit_mb,
            cpu_time_limit_secs: self.cpu_time_limit_secs,
        }
    }
}

/// Which document store backs run persistence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

/// Run persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub enabled: bool,
    pub store: StoreKind,
    pub sqlite_path: Option<PathBuf>,

    /// Partition every record is written under
    pub collection_id: String,

    /// Total attempts when folding an evaluation into its referenced run
    pub evaluation_attempts: u32,

    /// Fixed sleep between evaluation attempts
    pub evaluation_backoff_ms: u64,

    /// Span trees persisted concurrently
    pub max_in_flight: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            store: StoreKind::Memory,
            sqlite_path: None,
            collection_id: "default".to_string(),
            evaluation_attempts: 3,
            evaluation_backoff_ms: 1_000,
            max_in_flight: 8,
        }
    }
}

impl PersistenceSettings {
    pub fn retry_policy(&self) -> EvaluationRetryPolicy {
        EvaluationRetryPolicy {
            attempts: self.evaluation_attempts,
            backoff: Duration::from_millis(self.evaluation_backoff_ms),
        }
    }

    pub fn summary_settings(&self, created_by: Map<String, Value>) -> SummarySettings {
        SummarySettings {
            collection_id: self.collection_id.clone(),
            created_by,
            retry: self.retry_policy(),
            max_in_flight: self.max_in_flight,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Connections file (JSON or YAML)
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_format: LogFormat,
    pub log_filter: String,

    /// Prometheus listen address, e.g. "127.0.0.1:9184"
    pub metrics_addr: Option<String>,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_format: LogFormat::Pretty,
            log_filter: "info".to_string(),
            metrics_addr: None,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            debug!("Loading configuration file {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("FLOWRUN")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pool.worker_count == 0 {
            return Err(EngineError::ConfigError(
                "pool.worker_count must be at least 1".to_string(),
            ));
        }

        if self.persistence.evaluation_attempts == 0 {
            return Err(EngineError::ConfigError(
                "persistence.evaluation_attempts must be at least 1".to_string(),
            ));
        }

        if self.persistence.store == StoreKind::Sqlite && self.persistence.sqlite_path.is_none() {
            return Err(EngineError::ConfigError(
                "persistence.sqlite_path is required for the sqlite store".to_string(),
            ));
        }

        self.pool
            .worker_limits()
            .validate()
            .map_err(EngineError::ConfigError)?;

        Ok(())
    }
}
