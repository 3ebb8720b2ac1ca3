// src/recording/exporter.rs
//! Span exporters
//!
//! The line pool hands every span tree it receives from a worker to a
//! [`SpanExporter`]. Exporters must not block the caller for long; slow
//! sinks queue the work and return.

use crate::recording::span::Span;
use crate::utils::errors::{EngineError, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives the finished span tree of one line
pub trait SpanExporter: Send + Sync {
    fn export(&self, spans: Vec<Span>);

    /// Flush anything buffered
    fn flush(&self) {}
}

/// Drops every span
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _spans: Vec<Span>) {}
}

/// Keeps exported spans in memory
#[derive(Debug, Default, Clone)]
pub struct CollectingExporter {
    spans: Arc<Mutex<Vec<Span>>>,
}

impl CollectingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.spans.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().is_empty()
    }
}

impl SpanExporter for CollectingExporter {
    fn export(&self, spans: Vec<Span>) {
        self.spans.lock().extend(spans);
    }
}

/// Appends one JSON document per span to a file
pub struct JsonlExporter {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlExporter {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                EngineError::RecordingFailed(format!("cannot open {}: {}", path.display(), e))
            })?;

        debug!("Exporting spans to {}", path.display());

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl SpanExporter for JsonlExporter {
    fn export(&self, spans: Vec<Span>) {
        let mut writer = self.writer.lock();
        for span in &spans {
            let written = serde_json::to_writer(&mut *writer, span)
                .map_err(std::io::Error::from)
                .and_then(|_| writer.write_all(b"\n"));
            if let Err(e) = written {
                warn!(span_id = %span.span_id, "failed to export span: {}", e);
                return;
            }
        }
    }

    fn flush(&self) {
        if let Err(e) = self.writer.lock().flush() {
            warn!("failed to flush span export file: {}", e);
        }
    }
}

/// Forwards every tree to each inner exporter
#[derive(Default, Clone)]
pub struct FanoutExporter {
    exporters: Vec<Arc<dyn SpanExporter>>,
}

impl FanoutExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporters.push(exporter);
        self
    }
}

impl SpanExporter for FanoutExporter {
    fn export(&self, spans: Vec<Span>) {
        match self.exporters.split_last() {
            None => {}
            Some((last, rest)) => {
                for exporter in rest {
                    exporter.export(spans.clone());
                }
                last.export(spans);
            }
        }
    }

    fn flush(&self) {
        for exporter in &self.exporters {
            exporter.flush();
        }
    }
}

/// Pretty JSON rendering of a span tree
pub fn to_json(spans: &[Span]) -> Result<String> {
    serde_json::to_string_pretty(spans)
        .map_err(|e| EngineError::RecordingFailed(format!("JSON serialization error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::recorder::SpanRecorder;
    use crate::recording::span::{span_types, SpanStatus};
    use serde_json::Map;
    use std::io::{BufRead, BufReader};

    fn tree() -> Vec<Span> {
        let recorder = SpanRecorder::new(Map::new());
        let root = recorder.start_span("flow", None, span_types::FLOW);
        root.child("step", span_types::FUNCTION).end(SpanStatus::ok());
        root.end(SpanStatus::ok());
        recorder.take_finished()
    }

    #[test]
    fn test_fanout_reaches_every_exporter() {
        let first = CollectingExporter::new();
        let second = CollectingExporter::new();
        let fanout = FanoutExporter::new()
            .with(Arc::new(first.clone()))
            .with(Arc::new(second.clone()));

        fanout.export(tree());
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_jsonl_exporter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spans.jsonl");

        let exporter = JsonlExporter::create(&path).unwrap();
        exporter.export(tree());
        exporter.flush();

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|line| line.unwrap())
            .collect();
        assert_eq!(lines.len(), 2);

        let root: Span = serde_json::from_str(&lines[1]).unwrap();
        assert!(root.is_root());
    }

    #[test]
    fn test_to_json() {
        let json = to_json(&tree()).unwrap();
        assert!(json.contains("\"span_type\": \"Flow\""));
    }
}
