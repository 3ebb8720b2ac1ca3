// src/persistence/sqlite_store.rs
//! Document storage using SQLite
//!
//! Each document is stored whole as JSON text, keyed by
//! `(id, partition_key)`. Equality filters run through `json_extract`.

use crate::persistence::store::{
    apply_patch, document_key, DocumentStore, PatchOperation, SqlQuery, StoreError,
};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// JSON document store in one SQLite table
pub struct SqliteStore {
    db: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a store file
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                EngineError::StorageFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;

        let store = Self::from_connection(conn).await?;
        info!("Document store opened at {:?}", path);
        Ok(store)
    }

    /// Store that lives only as long as this value
    pub async fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            EngineError::StorageFailed(format!("Failed to open database: {}", e))
        })?;
        Self::from_connection(conn).await
    }

    async fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self {
            db: Arc::new(Mutex::new(conn)),
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<()> {
        let db = self.db.lock().await;

        db.execute(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT NOT NULL,
                partition_key TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (id, partition_key)
            )
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Schema creation failed: {}", e)))?;

        db.execute(
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_partition ON documents(partition_key)
            "#,
            [],
        )
        .map_err(|e| EngineError::StorageFailed(format!("Index creation failed: {}", e)))?;

        Ok(())
    }

    /// Number of stored documents
    pub async fn count(&self) -> Result<u64> {
        let db = self.db.lock().await;
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .map_err(|e| EngineError::StorageFailed(format!("Count failed: {}", e)))?;
        Ok(count as u64)
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Bind value a JSON scalar compares equal to under `json_extract`
fn sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn json_path(field: &str) -> std::result::Result<String, StoreError> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::Backend(format!("unsupported filter field `{}`", field)));
    }
    Ok(format!("'$.{}'", field))
}

/// Translate the filters of a query into a WHERE clause and its bindings
fn where_clause(query: &SqlQuery) -> std::result::Result<(String, Vec<SqlValue>), StoreError> {
    let mut clauses = Vec::new();
    let mut bindings = Vec::new();

    for (field, expected) in query.filters() {
        let path = json_path(field)?;
        if expected.is_null() {
            // json_type is 'null' for an explicit null and SQL NULL for a missing member
            clauses.push(format!("json_type(body, {}) = 'null'", path));
        } else {
            clauses.push(format!("json_extract(body, {}) = ?", path));
            bindings.push(sql_value(expected));
        }
    }
    if let Some(partition_key) = &query.partition_key {
        clauses.push("partition_key = ?".to_string());
        bindings.push(SqlValue::Text(partition_key.clone()));
    }

    let clause = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    Ok((clause, bindings))
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn query_items(&self, query: &SqlQuery) -> std::result::Result<Vec<Value>, StoreError> {
        let (clause, bindings) = where_clause(query)?;
        let db = self.db.lock().await;

        let mut stmt = db
            .prepare(&format!(
                "SELECT body FROM documents{} ORDER BY partition_key, id",
                clause
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params_from_iter(bindings), |row| row.get::<_, Value>(0))
            .map_err(backend)?;

        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(backend)
    }

    async fn patch_item(
        &self,
        id: &str,
        partition_key: &str,
        operations: &[PatchOperation],
    ) -> std::result::Result<Value, StoreError> {
        let mut db = self.db.lock().await;
        let tx = db.transaction().map_err(backend)?;

        let mut document: Value = tx
            .query_row(
                "SELECT body FROM documents WHERE id = ? AND partition_key = ?",
                params![id, partition_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?
            .ok_or_else(|| StoreError::NotFound {
                id: id.to_string(),
                partition_key: partition_key.to_string(),
            })?;

        for operation in operations {
            apply_patch(&mut document, operation)?;
        }

        tx.execute(
            "UPDATE documents SET body = ?, updated_at = ? WHERE id = ? AND partition_key = ?",
            params![document, chrono::Utc::now().timestamp(), id, partition_key],
        )
        .map_err(backend)?;
        tx.commit().map_err(backend)?;

        Ok(document)
    }

    async fn upsert_item(&self, item: Value) -> std::result::Result<Value, StoreError> {
        let (id, partition_key) = document_key(&item)?;
        let db = self.db.lock().await;

        db.execute(
            r#"
            INSERT INTO documents (id, partition_key, body, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id, partition_key) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![id, partition_key, item, chrono::Utc::now().timestamp()],
        )
        .map_err(backend)?;

        Ok(item)
    }

    async fn create_item(&self, item: Value) -> std::result::Result<Value, StoreError> {
        let (id, partition_key) = document_key(&item)?;
        let db = self.db.lock().await;

        let inserted = db.execute(
            "INSERT INTO documents (id, partition_key, body, updated_at) VALUES (?, ?, ?, ?)",
            params![id, partition_key, item, chrono::Utc::now().timestamp()],
        );
        match inserted {
            Ok(_) => Ok(item),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::Conflict(id))
            }
            Err(e) => Err(backend(e)),
        }
    }
}
