// src/runtime/connections.rs
//! Connection resolution
//!
//! Workers bind named connections to flow inputs before invoking a flow.
//! Under the clean strategy the worker rebuilds its resolver from the
//! serialized [`ConnectionSource`] it receives at bootstrap.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub name: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub configs: Map<String, Value>,

    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl Connection {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            configs: Map::new(),
            secrets: BTreeMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.configs.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), value.into());
        self
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.configs.get(key).and_then(Value::as_str)
    }
}

// Secrets stay out of logs
impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("configs", &self.configs)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("connection {0} not found")]
    NotFound(String),

    #[error("invalid connections file {path}: {message}")]
    InvalidFile { path: String, message: String },
}

pub trait ConnectionResolver: Send + Sync {
    fn get(&self, name: &str) -> Result<Connection, ConnectionError>;
}

/// Connections held in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnections {
    connections: HashMap<String, Connection>,
}

impl InMemoryConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.connections.insert(connection.name.clone(), connection);
    }

    pub fn with(mut self, connection: Connection) -> Self {
        self.insert(connection);
        self
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Load a list of connections from a JSON or YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConnectionError> {
        let invalid = |message: String| ConnectionError::InvalidFile {
            path: path.display().to_string(),
            message,
        };

        let content = std::fs::read_to_string(path).map_err(|e| invalid(e.to_string()))?;

        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml") | Some("yml")
        );
        let connections: Vec<Connection> = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| invalid(e.to_string()))?
        } else {
            serde_json::from_str(&content).map_err(|e| invalid(e.to_string()))?
        };

        debug!("Loaded {} connections from {}", connections.len(), path.display());

        Ok(connections
            .into_iter()
            .fold(Self::new(), |store, connection| store.with(connection)))
    }
}

impl ConnectionResolver for InMemoryConnections {
    fn get(&self, name: &str) -> Result<Connection, ConnectionError> {
        self.connections
            .get(name)
            .cloned()
            .ok_or_else(|| ConnectionError::NotFound(name.to_string()))
    }
}

/// Where a worker gets its connections from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ConnectionSource {
    #[default]
    None,
    File { path: PathBuf },
    Inline { connections: Vec<Connection> },
}

impl ConnectionSource {
    pub fn resolver(&self) -> Result<Arc<dyn ConnectionResolver>, ConnectionError> {
        let store = match self {
            ConnectionSource::None => InMemoryConnections::new(),
            ConnectionSource::File { path } => InMemoryConnections::from_file(path)?,
            ConnectionSource::Inline { connections } => connections
                .iter()
                .cloned()
                .fold(InMemoryConnections::new(), |store, connection| store.with(connection)),
        };
        Ok(Arc::new(store))
    }
}
