// src/persistence/memory_store.rs
//! In-process document store

use crate::persistence::store::{apply_patch, document_key, DocumentStore, PatchOperation, SqlQuery, StoreError};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

/// Documents keyed by `(partition_key, id)`
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: DashMap<(String, String), Value>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str, partition_key: &str) -> Option<Value> {
        self.documents
            .get(&(partition_key.to_string(), id.to_string()))
            .map(|document| document.value().clone())
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Every document, ordered by partition then id
    pub fn documents(&self) -> Vec<Value> {
        let mut entries: Vec<((String, String), Value)> = self
            .documents
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, document)| document).collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn query_items(&self, query: &SqlQuery) -> Result<Vec<Value>, StoreError> {
        Ok(self
            .documents
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn patch_item(
        &self,
        id: &str,
        partition_key: &str,
        operations: &[PatchOperation],
    ) -> Result<Value, StoreError> {
        let mut document = self
            .documents
            .get_mut(&(partition_key.to_string(), id.to_string()))
            .ok_or_else(|| StoreError::NotFound {
                id: id.to_string(),
                partition_key: partition_key.to_string(),
            })?;

        // Patch a copy so a failing operation leaves the document untouched
        let mut patched = document.value().clone();
        for operation in operations {
            apply_patch(&mut patched, operation)?;
        }
        *document = patched.clone();
        Ok(patched)
    }

    async fn upsert_item(&self, item: Value) -> Result<Value, StoreError> {
        let (id, partition_key) = document_key(&item)?;
        self.documents.insert((partition_key, id), item.clone());
        Ok(item)
    }

    async fn create_item(&self, item: Value) -> Result<Value, StoreError> {
        let (id, partition_key) = document_key(&item)?;
        match self.documents.entry((partition_key, id.clone())) {
            Entry::Occupied(_) => Err(StoreError::Conflict(id)),
            Entry::Vacant(slot) => {
                slot.insert(item.clone());
                Ok(item)
            }
        }
    }
}
