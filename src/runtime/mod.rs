// src/runtime/mod.rs
//! Batch execution runtime
//!
//! - **Line Pool**: bounded worker pool running the lines of a batch
//! - **Process Manager**: fork (duplicate) and spawn (clean) worker launch
//! - **Worker**: the in-process job loop, one job at a time
//! - **Invocable**: flows, class-style flow factories and the line context
//! - **Protocol**: newline-delimited JSON between coordinator and workers
//! - **Resource Limiter**: per-worker memory and CPU caps
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                  LineExecutionPool                       │
//! │   submit(batch) ─▶ coordinator (one per batch)           │
//! │        │  FIFO queue, liveness, timeout, retry, cancel   │
//! │        ▼                                                 │
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐                │
//! │  │ worker 0 │  │ worker 1 │  │ worker 2 │  ...           │
//! │  │ (fork or │  │          │  │          │                │
//! │  │  spawn)  │  │          │  │          │                │
//! │  └──────────┘  └──────────┘  └──────────┘                │
//! │        │ ResultEnvelope + span tree                      │
//! │        ▼                                                 │
//! │   caller  +  SpanExporter (run persistence)              │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod connections;
pub mod flows;
pub mod invocable;
pub mod job;
pub mod line_pool;
pub mod process_manager;
pub mod protocol;
pub mod resource_limiter;
pub mod worker;

// Re-export commonly used types
pub use connections::{Connection, ConnectionResolver, ConnectionSource, InMemoryConnections};
pub use invocable::{AsyncFn, FlowError, FlowFactory, FlowRegistry, Invocable, LineContext, SyncFn};
pub use job::{ErrorDetail, FlowReference, Job, LineStatus, ResultEnvelope, RunReference};
pub use line_pool::{
    BatchHandle, BatchRequest, BatchStats, InfraRetryPolicy, LineExecutionPool, PoolConfig,
    WorkerTemplate,
};
#[cfg(unix)]
pub use process_manager::ForkLauncher;
pub use process_manager::{LaunchStrategy, ProcessLauncher, ProcessManager, SpawnLauncher};
pub use resource_limiter::WorkerLimits;
pub use worker::{WorkerEnvironment, WorkerRuntime};
