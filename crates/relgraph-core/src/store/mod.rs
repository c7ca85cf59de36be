//! Document store abstraction
//!
//! The graph persists entities as flat JSON documents keyed by local
//! identity. Relationship fields hold local ids (a string, `null`, or an
//! array of strings). Stores broadcast a [`StoreNotification`] for every
//! document they have durably written.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::changes::ChangeTarget;
use crate::errors::Result;
use crate::types::LocalId;

pub use memory::MemoryDocumentStore;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: LocalId,
    pub collection: String,
    #[serde(rename = "type")]
    pub mapping: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn empty(id: LocalId, collection: impl Into<String>, mapping: impl Into<String>) -> Self {
        Self {
            id,
            collection: collection.into(),
            mapping: mapping.into(),
            fields: Map::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

impl ChangeTarget for Document {
    fn field_value(&self, field: &str) -> Result<Value> {
        Ok(self.fields.get(field).cloned().unwrap_or(Value::Null))
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> Result<()> {
        self.fields.insert(field.to_string(), value);
        Ok(())
    }
}

/// A document has been durably written
#[derive(Debug, Clone, PartialEq)]
pub struct StoreNotification {
    pub local_id: LocalId,
}

/// Per-document outcome of a `put`
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub local_id: LocalId,
    pub error: Option<String>,
}

impl WriteResult {
    pub fn ok(local_id: LocalId) -> Self {
        Self {
            local_id,
            error: None,
        }
    }

    pub fn failed(local_id: LocalId, error: impl Into<String>) -> Self {
        Self {
            local_id,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// # Errors
    ///
    /// Returns `Store` if the backend cannot be read.
    async fn get(&self, local_id: &LocalId) -> Result<Option<Document>>;

    /// Fetch several documents; the result is aligned with `local_ids`
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backend cannot be read.
    async fn get_multiple(&self, local_ids: &[LocalId]) -> Result<Vec<Option<Document>>> {
        let mut documents = Vec::with_capacity(local_ids.len());
        for local_id in local_ids {
            documents.push(self.get(local_id).await?);
        }
        Ok(documents)
    }

    /// Write documents, replacing any stored under the same local id
    ///
    /// The batch is atomic: either every result is ok or nothing was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the backend rejects the batch outright.
    async fn put(&self, documents: Vec<Document>) -> Result<Vec<WriteResult>>;

    /// Receive a notification for every document written from now on
    fn subscribe(&self) -> broadcast::Receiver<StoreNotification>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_serde_layout() {
        let mut doc = Document::empty(LocalId::from("l1"), "social", "User");
        doc.fields.insert("name".into(), json!("Ada"));
        doc.fields.insert("bestFriend".into(), json!("l2"));

        let encoded = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            encoded,
            json!({"_id": "l1", "collection": "social", "type": "User", "name": "Ada", "bestFriend": "l2"})
        );

        let decoded: Document = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, doc);
    }
}
