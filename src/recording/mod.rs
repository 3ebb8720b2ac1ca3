// src/recording/mod.rs
//! Trace recording
//!
//! - **Span**: the span/trace data model and tree validation
//! - **Recorder**: builds a span tree inside a worker while a line runs
//! - **Exporter**: sinks the coordinator hands finished trees to
//!
//! ```text
//! Worker: flow → SpanRecorder → ResultEnvelope.spans
//!                                      ↓
//! Coordinator: LineExecutionPool → SpanExporter → Summary / JSONL
//! ```

pub mod exporter;
pub mod recorder;
pub mod span;

pub use exporter::{CollectingExporter, FanoutExporter, JsonlExporter, NoopExporter, SpanExporter};
pub use recorder::{ActiveSpan, SpanRecorder, TokenUsage};
pub use span::{validate_tree, Span, SpanEvent, SpanStatus, SpanTreeError, StatusCode};
