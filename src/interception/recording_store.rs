// src/interception/recording_store.rs
//! JSONL store of recorded hook responses
//!
//! Each line is `{"key": "<hook>:<canonical request json>", "response": ...}`.
//! Lines are appended with a single write so forked workers sharing the
//! file do not interleave entries.

use crate::interception::hook_registry::{CallError, CallFuture, OutboundCall};
use crate::utils::errors::{EngineError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordedCall {
    key: String,
    response: Value,
}

/// Lookup key for one call
///
/// `serde_json` maps keep their keys sorted, so the rendered request is
/// canonical.
pub fn call_key(hook: &str, request: &Value) -> String {
    format!("{}:{}", hook, request)
}

pub struct RecordingStore {
    entries: RwLock<HashMap<String, Value>>,
    writer: Mutex<Option<File>>,
}

impl RecordingStore {
    /// Open `path` for appending new entries
    pub fn open_for_record(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                EngineError::RecordingFailed(format!("cannot open {}: {}", path.display(), e))
            })?;

        debug!("Recording hook calls to {}", path.display());

        Ok(Self {
            entries: RwLock::new(HashMap::new()),
            writer: Mutex::new(Some(file)),
        })
    }

    /// Load every entry of an existing recording; later entries win
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            EngineError::RecordingFailed(format!("cannot open {}: {}", path.display(), e))
        })?;

        let mut entries = HashMap::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let recorded: RecordedCall = serde_json::from_str(&line).map_err(|e| {
                EngineError::RecordingFailed(format!(
                    "{} line {}: {}",
                    path.display(),
                    index + 1,
                    e
                ))
            })?;
            entries.insert(recorded.key, recorded.response);
        }

        debug!("Loaded {} recorded calls from {}", entries.len(), path.display());

        Ok(Self {
            entries: RwLock::new(entries),
            writer: Mutex::new(None),
        })
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn append(&self, key: String, response: Value) -> Result<()> {
        let mut line = serde_json::to_vec(&RecordedCall {
            key: key.clone(),
            response: response.clone(),
        })?;
        line.push(b'\n');

        if let Some(file) = self.writer.lock().as_mut() {
            file.write_all(&line)?;
        }

        self.entries.write().insert(key, response);
        Ok(())
    }
}

/// Calls the real hook and records its response
pub struct RecordingCall {
    hook: String,
    inner: Arc<dyn OutboundCall>,
    store: Arc<RecordingStore>,
}

impl RecordingCall {
    pub fn new(hook: String, inner: Arc<dyn OutboundCall>, store: Arc<RecordingStore>) -> Self {
        Self { hook, inner, store }
    }
}

impl OutboundCall for RecordingCall {
    fn call<'a>(&'a self, request: &'a Value) -> CallFuture<'a> {
        Box::pin(async move {
            let response = self.inner.call(request).await?;
            if let Err(e) = self
                .store
                .append(call_key(&self.hook, request), response.clone())
            {
                warn!(hook = %self.hook, "failed to record call: {}", e);
            }
            Ok(response)
        })
    }
}

/// Serves recorded responses
pub struct ReplayCall {
    hook: String,
    store: Arc<RecordingStore>,
}

impl ReplayCall {
    pub fn new(hook: String, store: Arc<RecordingStore>) -> Self {
        Self { hook, store }
    }
}

impl OutboundCall for ReplayCall {
    fn call<'a>(&'a self, request: &'a Value) -> CallFuture<'a> {
        let key = call_key(&self.hook, request);
        let result = self.store.get(&key).ok_or(CallError::ReplayMiss {
            hook: self.hook.clone(),
            key,
        });
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ignores_field_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": 2}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": 2, "b": 1}"#).unwrap();
        assert_eq!(call_key("llm.chat", &a), call_key("llm.chat", &b));
        assert_ne!(call_key("llm.chat", &a), call_key("other", &a));
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");

        let store = RecordingStore::open_for_record(&path).unwrap();
        store.append("h:1".to_string(), json!("first")).unwrap();
        store.append("h:2".to_string(), json!({"n": 2})).unwrap();
        store.append("h:1".to_string(), json!("latest")).unwrap();

        let loaded = RecordingStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("h:1"), Some(json!("latest")));
        assert_eq!(loaded.get("h:2"), Some(json!({"n": 2})));
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        std::fs::write(&path, "not json\n").unwrap();

        assert!(matches!(
            RecordingStore::load(&path),
            Err(EngineError::RecordingFailed(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RecordingStore::load(&dir.path().join("absent.jsonl")).is_err());
    }
}
