//! Relationship proxies
//!
//! Each relationship field of a resident instance is backed by a proxy
//! holding the related local ids (`identity`) and, once resolved, the
//! resident instances they name (`related`). A proxy whose identity is
//! non-empty but whose related side has not been resolved is a fault.

use serde_json::Value;

use crate::errors::{GraphError, Result};
use crate::types::LocalId;

/// Local ids a relationship field refers to
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    One(Option<LocalId>),
    Many(Vec<LocalId>),
}

impl Identity {
    pub fn empty(sequence: bool) -> Self {
        if sequence {
            Identity::Many(Vec::new())
        } else {
            Identity::One(None)
        }
    }

    /// Parse the persisted form: `null`, a string, or an array of strings
    ///
    /// # Errors
    ///
    /// Returns `InvalidRelationshipValue` if the value has the wrong shape.
    pub fn from_value(sequence: bool, field: &str, value: &Value) -> Result<Self> {
        let invalid = |reason: &str| GraphError::InvalidRelationshipValue {
            field: field.to_string(),
            reason: reason.to_string(),
        };
        match (sequence, value) {
            (false, Value::Null) => Ok(Identity::One(None)),
            (false, Value::String(id)) => Ok(Identity::One(Some(LocalId::from(id.as_str())))),
            (false, _) => Err(invalid("expected a local id or null")),
            (true, Value::Null) => Ok(Identity::Many(Vec::new())),
            (true, Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(id) => Ok(LocalId::from(id.as_str())),
                    _ => Err(invalid("expected an array of local ids")),
                })
                .collect::<Result<Vec<_>>>()
                .map(Identity::Many),
            (true, _) => Err(invalid("expected an array of local ids")),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Identity::One(None) => Value::Null,
            Identity::One(Some(id)) => Value::String(id.to_string()),
            Identity::Many(ids) => ids_to_value(ids),
        }
    }

    pub fn ids(&self) -> Vec<LocalId> {
        match self {
            Identity::One(id) => id.iter().cloned().collect(),
            Identity::Many(ids) => ids.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Identity::One(id) => id.is_none(),
            Identity::Many(ids) => ids.is_empty(),
        }
    }

    pub fn contains(&self, local_id: &LocalId) -> bool {
        match self {
            Identity::One(id) => id.as_ref() == Some(local_id),
            Identity::Many(ids) => ids.contains(local_id),
        }
    }
}

pub(crate) fn ids_to_value(ids: &[LocalId]) -> Value {
    Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
}

pub(crate) fn ids_to_values(ids: &[LocalId]) -> Vec<Value> {
    ids.iter().map(|id| Value::String(id.to_string())).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Related {
    Unresolved,
    One(Option<LocalId>),
    Many(Vec<LocalId>),
}

#[derive(Debug, Clone)]
pub(crate) struct RelationshipProxy {
    identity: Identity,
    related: Related,
}

impl RelationshipProxy {
    pub(crate) fn new(sequence: bool) -> Self {
        let identity = Identity::empty(sequence);
        let related = Self::resolved_from(&identity);
        Self { identity, related }
    }

    /// A proxy rehydrated from storage; faulted unless empty
    pub(crate) fn from_identity(identity: Identity) -> Self {
        let related = if identity.is_empty() {
            Self::resolved_from(&identity)
        } else {
            Related::Unresolved
        };
        Self { identity, related }
    }

    fn resolved_from(identity: &Identity) -> Related {
        match identity {
            Identity::One(id) => Related::One(id.clone()),
            Identity::Many(ids) => Related::Many(ids.clone()),
        }
    }

    pub(crate) fn identity(&self) -> &Identity {
        &self.identity
    }

    pub(crate) fn related(&self) -> &Related {
        &self.related
    }

    pub(crate) fn is_sequence(&self) -> bool {
        matches!(self.identity, Identity::Many(_))
    }

    pub(crate) fn is_fault(&self) -> bool {
        self.related == Related::Unresolved
    }

    pub(crate) fn ids(&self) -> Vec<LocalId> {
        self.identity.ids()
    }

    pub(crate) fn identity_value(&self) -> Value {
        self.identity.to_value()
    }

    /// Mark related as resolved to the current identity
    pub(crate) fn resolve(&mut self) {
        self.related = Self::resolved_from(&self.identity);
    }

    /// Replace the whole identity; `resolved` says whether every id is
    /// resident
    pub(crate) fn replace(&mut self, identity: Identity, resolved: bool) {
        self.identity = identity;
        if resolved {
            self.resolve();
        } else {
            self.related = Related::Unresolved;
        }
    }

    /// Set a to-one proxy; the new partner is always resident
    pub(crate) fn set_one(&mut self, id: Option<LocalId>) {
        self.identity = Identity::One(id.clone());
        self.related = Related::One(id);
    }

    /// Append to a to-many proxy, returning the insertion index
    pub(crate) fn push(&mut self, id: LocalId) -> usize {
        let index = match &mut self.identity {
            Identity::Many(ids) => {
                ids.push(id.clone());
                ids.len() - 1
            }
            Identity::One(_) => return 0,
        };
        if let Related::Many(related) = &mut self.related {
            related.push(id);
        }
        index
    }

    /// Remove a member from a to-many proxy, returning its former index
    pub(crate) fn remove(&mut self, id: &LocalId) -> Option<usize> {
        let index = match &mut self.identity {
            Identity::Many(ids) => {
                let index = ids.iter().position(|i| i == id)?;
                ids.remove(index);
                index
            }
            Identity::One(_) => return None,
        };
        if let Related::Many(related) = &mut self.related {
            related.retain(|r| r != id);
        }
        Some(index)
    }

    /// Positional edit of a to-many proxy; the caller checks bounds
    pub(crate) fn splice(&mut self, index: usize, remove_count: usize, added: &[LocalId]) {
        if let Identity::Many(ids) = &mut self.identity {
            ids.splice(index..index + remove_count, added.iter().cloned());
        }
        if let Related::Many(related) = &mut self.related {
            related.splice(index..index + remove_count, added.iter().cloned());
        }
    }

    /// Verify related agrees with identity
    pub(crate) fn check_sync(&self, owner: &LocalId, field: &str) -> Result<()> {
        let agrees = match (&self.identity, &self.related) {
            (_, Related::Unresolved) => true,
            (Identity::One(id), Related::One(related)) => id == related,
            (Identity::Many(ids), Related::Many(related)) => ids == related,
            _ => false,
        };
        if agrees {
            Ok(())
        } else {
            Err(GraphError::RelationshipDesync {
                local_id: owner.to_string(),
                field: field.to_string(),
                reason: "related instances disagree with related identities".to_string(),
            })
        }
    }
}
