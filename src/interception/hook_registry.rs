// src/interception/hook_registry.rs
//! Registry of named outbound-call hook points
//!
//! Flows never talk to an external service directly; they go through a hook
//! name such as `llm.chat`. The registry maps each name to the real
//! implementation and, when recording or replaying, to a substitute that
//! wraps or replaces it.

use crate::interception::recording_store::{RecordingCall, RecordingStore, ReplayCall};
use crate::utils::errors::{EngineError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Failure of one outbound call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("no hook registered under {0}")]
    UnknownHook(String),

    #[error("call failed: {0}")]
    Failed(String),

    #[error("no recorded response for {hook} (key {key})")]
    ReplayMiss { hook: String, key: String },
}

pub type CallFuture<'a> = BoxFuture<'a, std::result::Result<Value, CallError>>;

/// An outbound capability a flow can call
pub trait OutboundCall: Send + Sync {
    fn call<'a>(&'a self, request: &'a Value) -> CallFuture<'a>;
}

/// How hook points are wired for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Real implementations only
    #[default]
    Live,

    /// Real implementations, every response appended to the recording
    Record,

    /// Responses served from the recording
    Replay,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    pub mode: HookMode,
    pub recording_path: Option<PathBuf>,
}

/// Hook name to implementation mapping
#[derive(Default, Clone)]
pub struct HookRegistry {
    real: HashMap<String, Arc<dyn OutboundCall>>,
    substitutes: HashMap<String, Arc<dyn OutboundCall>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the real implementation of a hook point
    pub fn register(&mut self, name: impl Into<String>, call: Arc<dyn OutboundCall>) {
        let name = name.into();
        debug!("Registering hook {}", name);
        self.real.insert(name, call);
    }

    /// Route a hook point to a substitute
    pub fn substitute(&mut self, name: impl Into<String>, call: Arc<dyn OutboundCall>) {
        let name = name.into();
        debug!("Substituting hook {}", name);
        self.substitutes.insert(name, call);
    }

    /// Drop every substitute, restoring the real implementations
    pub fn clear_substitutes(&mut self) {
        self.substitutes.clear();
    }

    /// Substitute first, real implementation second
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn OutboundCall>> {
        self.substitutes
            .get(name)
            .or_else(|| self.real.get(name))
            .cloned()
    }

    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.real.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_substituted(&self, name: &str) -> bool {
        self.substitutes.contains_key(name)
    }

    /// Call a hook by name
    pub async fn call(&self, name: &str, request: &Value) -> std::result::Result<Value, CallError> {
        let hook = self
            .resolve(name)
            .ok_or_else(|| CallError::UnknownHook(name.to_string()))?;
        hook.call(request).await
    }

    /// Wire substitutes for the configured mode
    pub fn apply(&mut self, config: &HookConfig) -> Result<()> {
        self.clear_substitutes();

        let path = || {
            config.recording_path.clone().ok_or_else(|| {
                EngineError::ConfigError(format!(
                    "hooks.recording_path is required in {:?} mode",
                    config.mode
                ))
            })
        };

        match config.mode {
            HookMode::Live => {}
            HookMode::Record => {
                let store = Arc::new(RecordingStore::open_for_record(&path()?)?);
                let real: Vec<(String, Arc<dyn OutboundCall>)> = self
                    .real
                    .iter()
                    .map(|(name, call)| (name.clone(), call.clone()))
                    .collect();
                for (name, inner) in real {
                    let wrapped = RecordingCall::new(name.clone(), inner, store.clone());
                    self.substitute(name, Arc::new(wrapped));
                }
            }
            HookMode::Replay => {
                let store = Arc::new(RecordingStore::load(&path()?)?);
                for name in self.hook_names() {
                    let replay = ReplayCall::new(name.clone(), store.clone());
                    self.substitute(name, Arc::new(replay));
                }
            }
        }

        info!(
            "Hooks wired in {:?} mode ({} hook points)",
            config.mode,
            self.real.len()
        );
        Ok(())
    }
}

/// Adapts a plain closure into an [`OutboundCall`]
pub struct FnCall<F>(F);

impl<F> FnCall<F>
where
    F: Fn(&Value) -> std::result::Result<Value, CallError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> OutboundCall for FnCall<F>
where
    F: Fn(&Value) -> std::result::Result<Value, CallError> + Send + Sync,
{
    fn call<'a>(&'a self, request: &'a Value) -> CallFuture<'a> {
        let result = (self.0)(request);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn upper() -> Arc<dyn OutboundCall> {
        Arc::new(FnCall::new(|request| {
            Ok(json!(request["text"].as_str().unwrap_or_default().to_uppercase()))
        }))
    }

    #[tokio::test]
    async fn test_resolve_real() {
        let mut registry = HookRegistry::new();
        registry.register("upper", upper());

        let response = registry.call("upper", &json!({"text": "hi"})).await.unwrap();
        assert_eq!(response, json!("HI"));
    }

    #[tokio::test]
    async fn test_unknown_hook() {
        let registry = HookRegistry::new();
        let err = registry.call("missing", &json!({})).await.unwrap_err();
        assert_eq!(err, CallError::UnknownHook("missing".to_string()));
    }

    #[tokio::test]
    async fn test_substitute_wins_until_cleared() {
        let mut registry = HookRegistry::new();
        registry.register("upper", upper());
        registry.substitute("upper", Arc::new(FnCall::new(|_| Ok(json!("fake")))));

        assert_eq!(registry.call("upper", &json!({"text": "a"})).await.unwrap(), json!("fake"));

        registry.clear_substitutes();
        assert_eq!(registry.call("upper", &json!({"text": "a"})).await.unwrap(), json!("A"));
    }

    #[test]
    fn test_record_mode_requires_path() {
        let mut registry = HookRegistry::new();
        let config = HookConfig {
            mode: HookMode::Record,
            recording_path: None,
        };
        assert!(matches!(registry.apply(&config), Err(EngineError::ConfigError(_))));
    }

    #[tokio::test]
    async fn test_record_then_replay() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");

        let mut recording = HookRegistry::new();
        recording.register("upper", upper());
        recording
            .apply(&HookConfig {
                mode: HookMode::Record,
                recording_path: Some(path.clone()),
            })
            .unwrap();
        assert!(recording.is_substituted("upper"));
        recording.call("upper", &json!({"text": "abc"})).await.unwrap();

        // The real implementation is never reached on replay
        let mut replaying = HookRegistry::new();
        replaying.register(
            "upper",
            Arc::new(FnCall::new(|_| Err(CallError::Failed("offline".to_string())))),
        );
        replaying
            .apply(&HookConfig {
                mode: HookMode::Replay,
                recording_path: Some(path),
            })
            .unwrap();

        let replayed = replaying.call("upper", &json!({"text": "abc"})).await.unwrap();
        assert_eq!(replayed, json!("ABC"));

        let miss = replaying.call("upper", &json!({"text": "xyz"})).await.unwrap_err();
        assert!(matches!(miss, CallError::ReplayMiss { .. }));
    }
}
