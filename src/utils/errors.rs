// src/utils/errors.rs
//! Crate-wide error type
//!
//! Per-line failures never show up here: they travel as `LineStatus` values
//! inside result envelopes. `EngineError` covers the coordinator, process
//! management, configuration and storage plumbing.

use thiserror::Error;

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The OS refused to create a worker process
    #[error("failed to start worker process: {0}")]
    ProcessSpawnFailed(String),

    /// No worker could be brought up; the batch cannot make progress
    #[error("worker pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("worker protocol error: {0}")]
    WorkerProtocol(String),

    #[error("runtime error: {0}")]
    RuntimeError(String),

    #[error("flow not registered: {0}")]
    FlowNotFound(String),

    #[error("batch run already active: {0}")]
    DuplicateRun(String),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("storage error: {0}")]
    StorageFailed(String),

    #[error("recording error: {0}")]
    RecordingFailed(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

impl From<nix::Error> for EngineError {
    fn from(err: nix::Error) -> Self {
        EngineError::RuntimeError(format!("system call failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::ProcessSpawnFailed("EAGAIN".to_string());
        assert_eq!(err.to_string(), "failed to start worker process: EAGAIN");

        let err = EngineError::PoolExhausted("no workers".to_string());
        assert!(err.to_string().contains("no workers"));
    }

    #[test]
    fn test_from_serde() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json");
        let err: EngineError = parse.unwrap_err().into();
        assert!(matches!(err, EngineError::Serialization(_)));
    }
}
