// src/runtime/protocol.rs
//! Coordinator ↔ worker wire protocol
//!
//! Newline-delimited JSON in both directions. A clean-strategy worker reads
//! its [`WorkerBootstrap`] as the first stdin line; afterwards the
//! coordinator sends [`WorkerCommand`]s and the worker answers with
//! [`WorkerMessage`]s.
//!
//! ```text
//! coordinator                        worker
//!     │ ── WorkerBootstrap ──────────▶ │   (clean strategy only)
//!     │ ◀──────────────── Ready{pid} ─ │
//!     │ ── Execute{job} ─────────────▶ │
//!     │ ◀──── Completed{envelope} ──── │
//!     │ ── Shutdown ─────────────────▶ │
//! ```

use crate::interception::HookConfig;
use crate::runtime::connections::ConnectionSource;
use crate::runtime::job::{FlowReference, Job, ResultEnvelope};
use crate::runtime::resource_limiter::WorkerLimits;
use crate::utils::errors::{EngineError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LinesCodec;

/// Largest frame accepted in either direction
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Everything a worker needs to rebuild its environment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerBootstrap {
    pub worker_id: usize,
    pub run_id: String,
    pub flow: FlowReference,

    #[serde(default)]
    pub hooks: HookConfig,

    #[serde(default)]
    pub connections: ConnectionSource,

    #[serde(default)]
    pub limits: WorkerLimits,

    /// Collection recorded on every span's resource
    pub collection: String,

    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerCommand {
    Execute { job: Job },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { pid: u32 },
    Completed { envelope: ResultEnvelope },
}

/// Render one frame; compact JSON never contains a raw newline
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim_end())
        .map_err(|e| EngineError::WorkerProtocol(format!("malformed frame: {}", e)))
}

pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_BYTES)
}
