use std::fmt;

use serde_json::Value;

use super::proxy::RelationshipProxy;
use super::relationship::Relationship;
use super::Graph;
use crate::cache::InstanceKey;
use crate::errors::{GraphError, Result};
use crate::schema::{Mapping, MappingKey};
use crate::store::Document;
use crate::types::LocalId;

/// Resident state of one instance; values and proxies are indexed by the
/// mapping's attribute and relationship slots
#[derive(Debug, Clone)]
pub(crate) struct EntityRecord {
    pub(crate) key: InstanceKey,
    pub(crate) mapping: MappingKey,
    pub(crate) values: Vec<Value>,
    pub(crate) proxies: Vec<RelationshipProxy>,
}

impl EntityRecord {
    pub(crate) fn empty(mapping: &Mapping) -> Self {
        Self {
            key: InstanceKey::next(),
            mapping: mapping.key().clone(),
            values: vec![Value::Null; mapping.attributes().len()],
            proxies: mapping
                .relationships()
                .iter()
                .map(|spec| RelationshipProxy::new(spec.is_sequence()))
                .collect(),
        }
    }
}

/// Handle to a resident instance
#[derive(Clone)]
pub struct Instance {
    graph: Graph,
    local_id: LocalId,
}

impl Instance {
    pub(crate) fn new(graph: Graph, local_id: LocalId) -> Self {
        Self { graph, local_id }
    }

    pub fn local_id(&self) -> &LocalId {
        &self.local_id
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance is no longer resident.
    pub fn mapping_key(&self) -> Result<MappingKey> {
        Ok(self.graph.state().record(&self.local_id)?.mapping.clone())
    }

    /// Current value of the mapping's id attribute
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance is no longer resident.
    pub fn remote_id(&self) -> Result<Value> {
        let state = self.graph.state();
        let mapping = state.mapping_for(&self.local_id)?;
        let record = state.record(&self.local_id)?;
        Ok(mapping
            .id_slot()
            .map(|slot| record.values[slot].clone())
            .unwrap_or(Value::Null))
    }

    /// # Errors
    ///
    /// Returns `FieldNotFound` if `field` is not an attribute.
    pub fn get(&self, field: &str) -> Result<Value> {
        let state = self.graph.state();
        let mapping = state.mapping_for(&self.local_id)?;
        let slot = mapping
            .attribute_slot(field)
            .ok_or_else(|| GraphError::FieldNotFound {
                mapping: mapping.key().to_string(),
                field: field.to_string(),
            })?;
        Ok(state.record(&self.local_id)?.values[slot].clone())
    }

    /// Write an attribute, recording a `Set` change if the value differs
    ///
    /// Writing the id attribute re-registers the instance in the identity
    /// cache.
    ///
    /// # Errors
    ///
    /// Returns `FieldNotFound` for unknown fields and `IdentityConflict` if
    /// another instance already holds the new remote id.
    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        self.graph
            .state()
            .set_attribute(&self.local_id, field, value.into())
    }

    /// # Errors
    ///
    /// Returns `FieldNotFound` if `field` is not a relationship.
    pub fn relationship(&self, field: &str) -> Result<Relationship> {
        self.graph
            .state()
            .mapping_for(&self.local_id)?
            .require_relationship(field)?;
        Ok(Relationship::new(
            self.graph.clone(),
            self.local_id.clone(),
            field.to_string(),
        ))
    }

    /// Snapshot of the instance in stored-document form
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the instance is no longer resident.
    pub fn to_document(&self) -> Result<Document> {
        self.graph.state().to_document(&self.local_id)
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.graph.ptr_eq(&other.graph) && self.local_id == other.local_id
    }
}

impl Eq for Instance {}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Instance").field(&self.local_id).finish()
    }
}
