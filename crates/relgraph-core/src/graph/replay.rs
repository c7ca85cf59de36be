//! Replaying changes onto resident instances

use serde_json::Value;

use super::proxy::Identity;
use super::GraphState;
use crate::changes::{Change, ChangeTarget};
use crate::errors::{GraphError, Result};
use crate::schema::Mapping;
use crate::types::LocalId;

/// A resident instance viewed as a change target. Writes bypass mirroring
/// and change emission.
struct LiveTarget<'a> {
    state: &'a mut GraphState,
    local_id: LocalId,
    mapping: Mapping,
}

impl LiveTarget<'_> {
    fn unknown(&self, field: &str) -> GraphError {
        GraphError::FieldNotFound {
            mapping: self.mapping.key().to_string(),
            field: field.to_string(),
        }
    }
}

impl ChangeTarget for LiveTarget<'_> {
    fn field_value(&self, field: &str) -> Result<Value> {
        let record = self.state.record(&self.local_id)?;
        if let Some(slot) = self.mapping.attribute_slot(field) {
            return Ok(record.values[slot].clone());
        }
        match self.mapping.relationship_slot(field) {
            Some(slot) => Ok(record.proxies[slot].identity_value()),
            None => Err(self.unknown(field)),
        }
    }

    fn set_field_value(&mut self, field: &str, value: Value) -> Result<()> {
        if let Some(slot) = self.mapping.attribute_slot(field) {
            if self.mapping.id_slot() == Some(slot) {
                self.state.recache(&self.local_id, &self.mapping, &value)?;
            }
            self.state.record_mut(&self.local_id)?.values[slot] = value;
            return Ok(());
        }
        let slot = self
            .mapping
            .relationship_slot(field)
            .ok_or_else(|| self.unknown(field))?;
        let sequence = self.mapping.relationships()[slot].is_sequence();
        let identity = Identity::from_value(sequence, field, &value)?;
        let resolved = identity
            .ids()
            .iter()
            .all(|id| self.state.entities.contains_key(id));
        self.state.record_mut(&self.local_id)?.proxies[slot].replace(identity, resolved);
        Ok(())
    }
}

impl GraphState {
    pub(crate) fn apply_change(&mut self, change: &Change) -> Result<()> {
        let record = self.record(&change.local_id)?;
        if record.mapping.collection != change.collection || record.mapping.mapping != change.mapping
        {
            return Err(GraphError::InvalidInput {
                reason: format!(
                    "change for {}.{} cannot apply to {} instance {}",
                    change.collection, change.mapping, record.mapping, change.local_id
                ),
            });
        }
        let mapping = self.registry.mapping_by_key(&record.mapping)?.clone();
        let mut target = LiveTarget {
            state: self,
            local_id: change.local_id.clone(),
            mapping,
        };
        change.apply(&mut target)
    }
}
