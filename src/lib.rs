// src/lib.rs
//! Flowrun batch execution engine
//!
//! Runs a flow independently over every row of a dataset on a pool of
//! isolated worker processes, captures a span tree per line and persists
//! line-run summaries with evaluation folding.
//!
//! # Architecture
//!
//! - **runtime**: line pool, process manager, worker runtime, flows
//! - **recording**: span/trace model, in-worker recorder, exporters
//! - **interception**: outbound-call hooks with record/replay
//! - **persistence**: document stores and line-run summaries
//! - **observability**: logging and metrics setup
//! - **utils**: errors and configuration

pub mod interception;
pub mod observability;
pub mod persistence;
pub mod recording;
pub mod runtime;
pub mod utils;

// Re-export commonly used types
pub use persistence::{DocumentStore, SummaryExporter};
pub use recording::{Span, SpanExporter};
pub use runtime::line_pool::{BatchHandle, BatchRequest, BatchStats, LineExecutionPool, PoolConfig};
pub use runtime::job::{Job, LineStatus, ResultEnvelope};
pub use utils::config::EngineConfig;
pub use utils::errors::{EngineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
