//! Bidirectional relationship maintenance
//!
//! Every edit to one side of a relationship is mirrored onto the other side
//! within the same critical section, and each side that actually changes
//! records exactly one change. Mirror targets that are not resident are
//! still kept consistent by recording the reverse edit straight into the
//! ledger, to be applied to their stored documents at merge time.

use serde_json::Value;

use super::proxy::{ids_to_value, ids_to_values, Identity};
use super::relationship::RelationshipValue;
use super::GraphState;
use crate::changes::{sequence_splice, ChangeKind};
use crate::errors::{GraphError, Result};
use crate::schema::{MappingKey, RelationshipSpec};
use crate::types::LocalId;

impl GraphState {
    pub(crate) fn relationship_spec(
        &self,
        owner: &LocalId,
        field: &str,
    ) -> Result<(usize, RelationshipSpec)> {
        let (slot, spec) = self.mapping_for(owner)?.require_relationship(field)?;
        Ok((slot, spec.clone()))
    }

    fn validate_targets(&self, spec: &RelationshipSpec, ids: &[LocalId]) -> Result<()> {
        for (i, id) in ids.iter().enumerate() {
            let record = self.record(id)?;
            if record.mapping != spec.related {
                return Err(GraphError::WrongTargetMapping {
                    field: spec.name.clone(),
                    expected: spec.related.to_string(),
                    actual: record.mapping.to_string(),
                });
            }
            if ids[..i].contains(id) {
                return Err(GraphError::DuplicateRelated {
                    field: spec.name.clone(),
                    local_id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Replace a relationship's value, mirroring onto old and new targets
    pub(crate) fn set_relationship(
        &mut self,
        owner: &LocalId,
        field: &str,
        value: RelationshipValue,
    ) -> Result<()> {
        let (slot, spec) = self.relationship_spec(owner, field)?;
        let invalid = |reason: &str| GraphError::InvalidRelationshipValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        let new_ids = match (spec.is_sequence(), value) {
            (_, RelationshipValue::None) => Vec::new(),
            (false, RelationshipValue::One(id)) => vec![id],
            (false, RelationshipValue::Many(_)) => {
                return Err(invalid("a to-one relationship cannot hold a sequence"))
            }
            (true, RelationshipValue::Many(ids)) => ids,
            (true, RelationshipValue::One(_)) => {
                return Err(invalid("a to-many relationship requires a sequence"))
            }
        };
        self.validate_targets(&spec, &new_ids)?;

        let owner_mapping = self.record(owner)?.mapping.clone();
        let proxy = &self.record(owner)?.proxies[slot];
        let old_ids = proxy.ids();
        let old_value = proxy.identity_value();
        let removed: Vec<LocalId> = old_ids
            .iter()
            .filter(|id| !new_ids.contains(id))
            .cloned()
            .collect();
        let added: Vec<LocalId> = new_ids
            .iter()
            .filter(|id| !old_ids.contains(id))
            .cloned()
            .collect();

        for target in &removed {
            self.detach(target, &spec.related, &spec.counterpart, owner)?;
        }

        let identity = if spec.is_sequence() {
            Identity::Many(new_ids)
        } else {
            Identity::One(new_ids.into_iter().next())
        };
        let proxy = &mut self.record_mut(owner)?.proxies[slot];
        proxy.replace(identity, true);
        let new_value = proxy.identity_value();

        for target in &added {
            self.attach(target, &spec.counterpart, owner)?;
        }

        if old_value != new_value {
            self.emit(
                owner,
                &owner_mapping,
                field,
                ChangeKind::Set {
                    old: old_value,
                    new: new_value,
                },
            )?;
        }
        Ok(())
    }

    /// Positional edit of a to-many relationship; returns the removed ids
    pub(crate) fn splice_relationship(
        &mut self,
        owner: &LocalId,
        field: &str,
        index: usize,
        remove_count: usize,
        added: Vec<LocalId>,
    ) -> Result<Vec<LocalId>> {
        let (slot, spec) = self.relationship_spec(owner, field)?;
        if !spec.is_sequence() {
            return Err(GraphError::InvalidRelationshipValue {
                field: field.to_string(),
                reason: "splice requires a to-many relationship".to_string(),
            });
        }
        let owner_mapping = self.record(owner)?.mapping.clone();
        let ids = self.record(owner)?.proxies[slot].ids();
        let len = ids.len();
        if index > len || remove_count > len - index {
            return Err(GraphError::SpliceOutOfBounds {
                field: field.to_string(),
                index,
                remove_count,
                len,
            });
        }
        self.validate_targets(&spec, &added)?;
        let end = index + remove_count;
        if let Some(duplicate) = added
            .iter()
            .find(|a| ids[..index].contains(a) || ids[end..].contains(a))
        {
            return Err(GraphError::DuplicateRelated {
                field: field.to_string(),
                local_id: duplicate.to_string(),
            });
        }
        let removed = ids[index..end].to_vec();
        if removed.is_empty() && added.is_empty() {
            return Ok(removed);
        }

        self.record_mut(owner)?.proxies[slot].splice(index, remove_count, &added);

        for target in removed.iter().filter(|r| !added.contains(r)) {
            self.detach(target, &spec.related, &spec.counterpart, owner)?;
        }
        for target in added.iter().filter(|a| !removed.contains(a)) {
            self.attach(target, &spec.counterpart, owner)?;
        }

        self.emit(
            owner,
            &owner_mapping,
            field,
            ChangeKind::Splice {
                index,
                expected_len: len,
                removed: ids_to_values(&removed),
                added: ids_to_values(&added),
            },
        )?;
        Ok(removed)
    }

    /// Apply a batch of edits to a resolved to-many relationship as a
    /// single splice. `edit` runs under the graph lock.
    pub(crate) fn edit_relationship<F>(&mut self, owner: &LocalId, field: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<LocalId>),
    {
        let (slot, spec) = self.relationship_spec(owner, field)?;
        if !spec.is_sequence() {
            return Err(GraphError::InvalidRelationshipValue {
                field: field.to_string(),
                reason: "edit requires a to-many relationship".to_string(),
            });
        }
        let proxy = &self.record(owner)?.proxies[slot];
        if proxy.is_fault() {
            return Err(GraphError::RelationshipFaulted {
                field: field.to_string(),
                local_id: owner.to_string(),
            });
        }
        let before = proxy.ids();
        let mut after = before.clone();
        edit(&mut after);
        match sequence_splice(&before, &after) {
            Some(diff) => self
                .splice_relationship(owner, field, diff.index, diff.removed.len(), diff.added)
                .map(|_| ()),
            None => Ok(()),
        }
    }

    /// Mirror step: make `target.field` refer to `owner`
    fn attach(&mut self, target: &LocalId, field: &str, owner: &LocalId) -> Result<()> {
        let (slot, spec) = self.relationship_spec(target, field)?;
        let target_mapping = self.record(target)?.mapping.clone();
        let identity = self.record(target)?.proxies[slot].identity().clone();
        match identity {
            Identity::Many(ids) => {
                if ids.contains(owner) {
                    return Ok(());
                }
                let index = self.record_mut(target)?.proxies[slot].push(owner.clone());
                self.emit(
                    target,
                    &target_mapping,
                    field,
                    ChangeKind::Splice {
                        index,
                        expected_len: ids.len(),
                        removed: Vec::new(),
                        added: vec![Value::String(owner.to_string())],
                    },
                )
            }
            Identity::One(current) => {
                if current.as_ref() == Some(owner) {
                    return Ok(());
                }
                // The target's previous partner loses its link to the target
                if let Some(previous) = &current {
                    self.detach(previous, &spec.related, &spec.counterpart, target)?;
                }
                self.record_mut(target)?.proxies[slot].set_one(Some(owner.clone()));
                self.emit(
                    target,
                    &target_mapping,
                    field,
                    ChangeKind::Set {
                        old: Identity::One(current).to_value(),
                        new: Value::String(owner.to_string()),
                    },
                )
            }
        }
    }

    /// Mirror step: make `target.field` stop referring to `owner`
    fn detach(
        &mut self,
        target: &LocalId,
        target_mapping: &MappingKey,
        field: &str,
        owner: &LocalId,
    ) -> Result<()> {
        let owner_value = Value::String(owner.to_string());
        if !self.entities.contains_key(target) {
            let mapping = self.registry.mapping_by_key(target_mapping)?;
            let (_, spec) = mapping.require_relationship(field)?;
            let kind = if spec.is_sequence() {
                ChangeKind::Remove {
                    removed: vec![owner_value],
                }
            } else {
                ChangeKind::Set {
                    old: owner_value,
                    new: Value::Null,
                }
            };
            return self.emit(target, target_mapping, field, kind);
        }

        let (slot, _) = self.relationship_spec(target, field)?;
        let identity = self.record(target)?.proxies[slot].identity().clone();
        let kind = match identity {
            Identity::Many(ids) => {
                let len = ids.len();
                match self.record_mut(target)?.proxies[slot].remove(owner) {
                    Some(index) => ChangeKind::Splice {
                        index,
                        expected_len: len,
                        removed: vec![owner_value],
                        added: Vec::new(),
                    },
                    None => return Ok(()),
                }
            }
            Identity::One(current) => {
                if current.as_ref() != Some(owner) {
                    return Ok(());
                }
                self.record_mut(target)?.proxies[slot].set_one(None);
                ChangeKind::Set {
                    old: owner_value,
                    new: Value::Null,
                }
            }
        };
        self.emit(target, target_mapping, field, kind)
    }

    /// Verify one relationship's proxy and its mirrors agree
    pub(crate) fn check_relationship(&self, owner: &LocalId, field: &str) -> Result<()> {
        let (slot, spec) = self.relationship_spec(owner, field)?;
        let proxy = &self.record(owner)?.proxies[slot];
        proxy.check_sync(owner, field)?;
        for target in proxy.ids() {
            let Some(record) = self.entities.get(&target) else {
                continue;
            };
            let (mirror_slot, _) = self.relationship_spec(&target, &spec.counterpart)?;
            if !record.proxies[mirror_slot].identity().contains(owner) {
                return Err(GraphError::RelationshipDesync {
                    local_id: owner.to_string(),
                    field: field.to_string(),
                    reason: format!(
                        "{}.{} does not refer back ({})",
                        target,
                        spec.counterpart,
                        ids_to_value(&record.proxies[mirror_slot].ids())
                    ),
                });
            }
        }
        Ok(())
    }
}
