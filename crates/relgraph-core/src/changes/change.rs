//! Change records
//!
//! A [`Change`] describes one field-level mutation of one entity. Changes
//! are replayable against anything implementing [`ChangeTarget`]: stored
//! documents during a merge, or live instances. Replay checks the value
//! being replaced first, so a change applied to state that has moved on
//! fails with `ChangeConflict` instead of silently clobbering it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{GraphError, Result};
use crate::types::LocalId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ChangeKind {
    /// Whole-value replacement
    Set { old: Value, new: Value },
    /// Positional edit of a sequence of length `expected_len`
    Splice {
        index: usize,
        expected_len: usize,
        removed: Vec<Value>,
        added: Vec<Value>,
    },
    /// Removal of members by value, position unknown
    Remove { removed: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub collection: String,
    #[serde(rename = "type")]
    pub mapping: String,
    pub local_id: LocalId,
    pub field: String,
    #[serde(flatten)]
    pub kind: ChangeKind,
}

/// Something a [`Change`] can be replayed onto
pub trait ChangeTarget {
    /// Current value of `field`; absent fields read as `null`
    ///
    /// # Errors
    ///
    /// Returns an error if the field cannot be read.
    fn field_value(&self, field: &str) -> Result<Value>;

    /// # Errors
    ///
    /// Returns an error if the field does not accept `value`.
    fn set_field_value(&mut self, field: &str, value: Value) -> Result<()>;
}

impl Change {
    /// Build and validate a change
    ///
    /// # Errors
    ///
    /// Returns `MissingField` if any naming component is empty.
    pub fn new(
        collection: impl Into<String>,
        mapping: impl Into<String>,
        local_id: LocalId,
        field: impl Into<String>,
        kind: ChangeKind,
    ) -> Result<Self> {
        let change = Self {
            collection: collection.into(),
            mapping: mapping.into(),
            local_id,
            field: field.into(),
            kind,
        };
        change.validate()?;
        Ok(change)
    }

    /// # Errors
    ///
    /// Returns `MissingField` naming the first empty component.
    pub fn validate(&self) -> Result<()> {
        let missing = if self.collection.is_empty() {
            Some("collection")
        } else if self.mapping.is_empty() {
            Some("type")
        } else if self.local_id.as_str().is_empty() {
            Some("local_id")
        } else if self.field.is_empty() {
            Some("field")
        } else {
            None
        };
        match missing {
            Some(field) => Err(GraphError::MissingField {
                field: field.to_string(),
            }),
            None => Ok(()),
        }
    }

    fn conflict(&self, expected: impl Into<String>, actual: &Value) -> GraphError {
        GraphError::ChangeConflict {
            local_id: self.local_id.to_string(),
            field: self.field.clone(),
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    fn sequence(&self, current: &Value) -> Result<Vec<Value>> {
        match current {
            Value::Null => Ok(Vec::new()),
            Value::Array(items) => Ok(items.clone()),
            other => Err(self.conflict("a sequence", other)),
        }
    }

    /// Replay this change onto `target`
    ///
    /// # Errors
    ///
    /// Returns `ChangeConflict` if the target no longer holds the state this
    /// change was recorded against.
    pub fn apply<T: ChangeTarget + ?Sized>(&self, target: &mut T) -> Result<()> {
        let current = target.field_value(&self.field)?;
        match &self.kind {
            ChangeKind::Set { old, new } => {
                if current != *old {
                    return Err(self.conflict(old.to_string(), &current));
                }
                target.set_field_value(&self.field, new.clone())
            }
            ChangeKind::Splice {
                index,
                expected_len,
                removed,
                added,
            } => {
                let mut items = self.sequence(&current)?;
                if items.len() != *expected_len {
                    return Err(self.conflict(format!("length {}", expected_len), &current));
                }
                let end = match index.checked_add(removed.len()) {
                    Some(end) if end <= items.len() && items[*index..end] == removed[..] => end,
                    _ => {
                        return Err(self.conflict(
                            format!("{} at index {}", Value::Array(removed.clone()), index),
                            &current,
                        ))
                    }
                };
                items.splice(*index..end, added.iter().cloned());
                target.set_field_value(&self.field, Value::Array(items))
            }
            ChangeKind::Remove { removed } => {
                let mut items = self.sequence(&current)?;
                for value in removed {
                    match items.iter().position(|item| item == value) {
                        Some(pos) => {
                            items.remove(pos);
                        }
                        None => return Err(self.conflict(format!("member {}", value), &current)),
                    }
                }
                target.set_field_value(&self.field, Value::Array(items))
            }
        }
    }
}

/// Minimal positional edit turning one sequence into another
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSplice<T> {
    pub index: usize,
    pub removed: Vec<T>,
    pub added: Vec<T>,
}

/// Diff two sequences into a single splice over the span between their
/// common prefix and common suffix; `None` if they are equal
pub fn sequence_splice<T: PartialEq + Clone>(before: &[T], after: &[T]) -> Option<SequenceSplice<T>> {
    let prefix = before
        .iter()
        .zip(after)
        .take_while(|(a, b)| a == b)
        .count();
    if prefix == before.len() && prefix == after.len() {
        return None;
    }
    let max_suffix = before.len().min(after.len()) - prefix;
    let suffix = before
        .iter()
        .rev()
        .zip(after.iter().rev())
        .take(max_suffix)
        .take_while(|(a, b)| a == b)
        .count();
    Some(SequenceSplice {
        index: prefix,
        removed: before[prefix..before.len() - suffix].to_vec(),
        added: after[prefix..after.len() - suffix].to_vec(),
    })
}
