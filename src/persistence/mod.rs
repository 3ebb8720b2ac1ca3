// src/persistence/mod.rs
//! Run persistence
//!
//! - **Store**: the document store capability and its query/patch model
//! - **Summary**: flattens delivered spans into line-run records and folds
//!   evaluations into the runs they reference
//! - **Exporter**: the pool-facing `SpanExporter` running summaries in the
//!   background
//!
//! ```text
//! LineExecutionPool → SummaryExporter → Summary::persist → DocumentStore
//!                                                           (memory | sqlite)
//! ```

pub mod exporter;
pub mod memory_store;
pub mod sanitize;
pub mod sqlite_store;
pub mod store;
pub mod summary;

pub use exporter::{PersistStats, SummaryExporter, SummarySettings};
pub use memory_store::MemoryStore;
pub use sanitize::truncate_and_replace;
pub use sqlite_store::SqliteStore;
pub use store::{DocumentStore, PatchOperation, SqlQuery, StoreError};
pub use summary::{EvaluationRetryPolicy, LineEvaluation, LineRunRecord, PersistError, Summary};
