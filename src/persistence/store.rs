// src/persistence/store.rs
//! Document store capability
//!
//! Run persistence only needs four operations from a store of JSON
//! documents addressed by `(id, partition_key)`: equality queries, a
//! conditional single-field patch, upsert and create-if-absent.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("document {id} not found in partition {partition_key}")]
    NotFound { id: String, partition_key: String },

    #[error("document {0} already exists")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryParameter {
    /// Placeholder name including the `@` prefix
    pub name: String,
    pub value: Value,
}

/// Conjunction of field equality filters
///
/// A `null` parameter only matches documents whose field is explicitly null.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub query: String,
    pub parameters: Vec<QueryParameter>,

    /// `None` queries every partition
    pub partition_key: Option<String>,
}

impl SqlQuery {
    /// `SELECT * FROM c WHERE c.a = @a AND c.b = @b`, across partitions
    pub fn equality(filters: &[(&str, Value)]) -> Self {
        let clauses: Vec<String> = filters
            .iter()
            .map(|(field, _)| format!("c.{} = @{}", field, field))
            .collect();
        let query = if clauses.is_empty() {
            "SELECT * FROM c".to_string()
        } else {
            format!("SELECT * FROM c WHERE {}", clauses.join(" AND "))
        };

        Self {
            query,
            parameters: filters
                .iter()
                .map(|(field, value)| QueryParameter {
                    name: format!("@{}", field),
                    value: value.clone(),
                })
                .collect(),
            partition_key: None,
        }
    }

    pub fn in_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    pub fn cross_partition(&self) -> bool {
        self.partition_key.is_none()
    }

    /// Field name and expected value of every filter
    pub fn filters(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.parameters
            .iter()
            .map(|param| (param.name.trim_start_matches('@'), &param.value))
    }

    /// Whether `document` satisfies every filter
    pub fn matches(&self, document: &Value) -> bool {
        if let Some(partition_key) = &self.partition_key {
            if document.get("partition_key").and_then(Value::as_str) != Some(partition_key) {
                return false;
            }
        }
        self.filters()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    /// Set the member at a JSON pointer, creating it if absent
    Add { path: String, value: Value },
}

impl PatchOperation {
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOperation::Add {
            path: path.into(),
            value,
        }
    }
}

/// Escape one JSON pointer segment
pub fn pointer_segment(raw: &str) -> String {
    raw.replace('~', "~0").replace('/', "~1")
}

/// Apply a patch operation to a document in place
pub fn apply_patch(document: &mut Value, operation: &PatchOperation) -> Result<(), StoreError> {
    match operation {
        PatchOperation::Add { path, value } => {
            let segments: Vec<String> = path
                .strip_prefix('/')
                .ok_or_else(|| StoreError::Backend(format!("invalid patch path {}", path)))?
                .split('/')
                .map(|segment| segment.replace("~1", "/").replace("~0", "~"))
                .collect();

            let Some((last, parents)) = segments.split_last() else {
                return Err(StoreError::Backend(format!("invalid patch path {}", path)));
            };

            let mut target = document;
            for segment in parents {
                let object = target
                    .as_object_mut()
                    .ok_or_else(|| StoreError::Backend(format!("{} is not an object", path)))?;
                target = object
                    .entry(segment.clone())
                    .or_insert_with(|| Value::Object(Map::new()));
            }

            target
                .as_object_mut()
                .ok_or_else(|| StoreError::Backend(format!("parent of {} is not an object", path)))?
                .insert(last.clone(), value.clone());
            Ok(())
        }
    }
}

/// `(id, partition_key)` of a document
pub fn document_key(document: &Value) -> Result<(String, String), StoreError> {
    let field = |name: &str| {
        document
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| StoreError::Backend(format!("document has no string `{}`", name)))
    };
    Ok((field("id")?, field("partition_key")?))
}

/// Async interface of a JSON document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn query_items(&self, query: &SqlQuery) -> Result<Vec<Value>, StoreError>;

    /// Apply `operations` to one document; `NotFound` if it does not exist
    async fn patch_item(
        &self,
        id: &str,
        partition_key: &str,
        operations: &[PatchOperation],
    ) -> Result<Value, StoreError>;

    /// Insert or replace
    async fn upsert_item(&self, item: Value) -> Result<Value, StoreError>;

    /// Insert; `Conflict` if the document already exists
    async fn create_item(&self, item: Value) -> Result<Value, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equality_query_shape() {
        let query = SqlQuery::equality(&[
            ("line_run_id", json!("main")),
            ("batch_run_id", Value::Null),
            ("line_number", Value::Null),
        ]);
        assert_eq!(
            query.query,
            "SELECT * FROM c WHERE c.line_run_id = @line_run_id AND c.batch_run_id = @batch_run_id AND c.line_number = @line_number"
        );
        assert_eq!(query.parameters[0].name, "@line_run_id");
        assert_eq!(query.parameters[1].value, Value::Null);
        assert!(query.cross_partition());
    }

    #[test]
    fn test_query_matching() {
        let query = SqlQuery::equality(&[("line_run_id", json!("a")), ("batch_run_id", Value::Null)]);
        assert!(query.matches(&json!({"line_run_id": "a", "batch_run_id": null})));
        assert!(!query.matches(&json!({"line_run_id": "a"})));
        assert!(!query.matches(&json!({"line_run_id": "b", "batch_run_id": null})));

        let scoped = SqlQuery::equality(&[("line_run_id", json!("a"))]).in_partition("p1");
        assert!(!scoped.matches(&json!({"line_run_id": "a", "partition_key": "p2"})));
    }

    #[test]
    fn test_apply_add_patch() {
        let mut document = json!({"id": "1", "evaluations": {}});
        apply_patch(
            &mut document,
            &PatchOperation::add("/evaluations/accuracy", json!({"score": 1})),
        )
        .unwrap();
        assert_eq!(document["evaluations"]["accuracy"], json!({"score": 1}));

        // A second name lands beside the first
        apply_patch(&mut document, &PatchOperation::add("/evaluations/fluency", json!(2))).unwrap();
        assert_eq!(document["evaluations"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_patch_path_escaping() {
        let mut document = json!({});
        let path = format!("/evaluations/{}", pointer_segment("run/a~b"));
        apply_patch(&mut document, &PatchOperation::add(path, json!(true))).unwrap();
        assert_eq!(document["evaluations"]["run/a~b"], json!(true));
    }

    #[test]
    fn test_patch_wire_shape() {
        let op = PatchOperation::add("/evaluations/x", json!(1));
        assert_eq!(
            serde_json::to_value(&op).unwrap(),
            json!({"op": "add", "path": "/evaluations/x", "value": 1})
        );
    }

    #[test]
    fn test_document_key() {
        let key = document_key(&json!({"id": "a", "partition_key": "p"})).unwrap();
        assert_eq!(key, ("a".to_string(), "p".to_string()));
        assert!(document_key(&json!({"id": "a"})).is_err());
    }
}
