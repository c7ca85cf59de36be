//! Identity cache
//!
//! Maps local identities, (mapping, remote id) pairs and singleton mappings
//! to the one resident instance holding them. Each slot is held by at most
//! one instance; a second claimant is a consistency violation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::trace;

use crate::errors::{GraphError, Result};
use crate::schema::MappingKey;
use crate::types::LocalId;

/// Distinguishes instance objects; two records with the same local id but
/// different keys are different instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceKey(u64);

impl InstanceKey {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Normalize a remote identity value into its cache key
///
/// Strings and numbers are identities; `null` means "no remote identity".
///
/// # Errors
///
/// Returns `InvalidInput` for booleans, arrays and objects.
pub fn remote_key(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(GraphError::InvalidInput {
            reason: format!("remote identity must be a string or number, got {}", other),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub instance_key: InstanceKey,
    pub local_id: LocalId,
    pub mapping: MappingKey,
    pub remote_id: Option<String>,
    pub singleton: bool,
}

/// Lookup criteria, tried in order: local id, then remote id, then
/// singleton
#[derive(Debug, Clone, Default)]
pub struct CacheQuery {
    pub local_id: Option<LocalId>,
    pub mapping: Option<MappingKey>,
    pub remote_id: Option<String>,
}

impl CacheQuery {
    pub fn local(local_id: LocalId) -> Self {
        Self {
            local_id: Some(local_id),
            ..Self::default()
        }
    }

    pub fn remote(mapping: MappingKey, remote_id: impl Into<String>) -> Self {
        Self {
            mapping: Some(mapping),
            remote_id: Some(remote_id.into()),
            ..Self::default()
        }
    }

    pub fn singleton(mapping: MappingKey) -> Self {
        Self {
            mapping: Some(mapping),
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct Slot {
    instance_key: InstanceKey,
    mapping: MappingKey,
    remote_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct IdentityCache {
    by_local: HashMap<LocalId, Slot>,
    by_remote: HashMap<(MappingKey, String), LocalId>,
    singletons: HashMap<MappingKey, LocalId>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, query: &CacheQuery) -> Option<LocalId> {
        if let Some(local_id) = &query.local_id {
            return self.by_local.contains_key(local_id).then(|| local_id.clone());
        }
        let mapping = query.mapping.as_ref()?;
        match &query.remote_id {
            Some(remote) => self.by_remote.get(&(mapping.clone(), remote.clone())).cloned(),
            None => self.singletons.get(mapping).cloned(),
        }
    }

    pub fn contains(&self, local_id: &LocalId) -> bool {
        self.by_local.contains_key(local_id)
    }

    pub fn len(&self) -> usize {
        self.by_local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_local.is_empty()
    }

    /// Register or re-register an instance
    ///
    /// Re-inserting the same instance with a new remote id moves its remote
    /// slot. Nothing is modified unless every slot check passes.
    ///
    /// # Errors
    ///
    /// Returns `IdentityConflict` if any slot is held by another instance.
    pub fn insert(&mut self, entry: CacheEntry) -> Result<()> {
        let previous_remote = match self.by_local.get(&entry.local_id) {
            Some(slot) if slot.instance_key != entry.instance_key => {
                return Err(GraphError::IdentityConflict {
                    slot: format!("local:{}", entry.local_id),
                });
            }
            Some(slot) => slot.remote_id.clone(),
            None => None,
        };

        if entry.singleton {
            if let Some(holder) = self.singletons.get(&entry.mapping) {
                if *holder != entry.local_id {
                    return Err(GraphError::IdentityConflict {
                        slot: format!("singleton:{}", entry.mapping),
                    });
                }
            }
        }

        if let Some(remote) = &entry.remote_id {
            if let Some(holder) = self.by_remote.get(&(entry.mapping.clone(), remote.clone())) {
                if *holder != entry.local_id {
                    return Err(GraphError::IdentityConflict {
                        slot: format!("remote:{}:{}", entry.mapping, remote),
                    });
                }
            }
        }

        if let Some(old) = previous_remote {
            if entry.remote_id.as_ref() != Some(&old) {
                self.by_remote.remove(&(entry.mapping.clone(), old));
            }
        }
        if let Some(remote) = &entry.remote_id {
            self.by_remote
                .insert((entry.mapping.clone(), remote.clone()), entry.local_id.clone());
        }
        if entry.singleton {
            self.singletons
                .insert(entry.mapping.clone(), entry.local_id.clone());
        }
        trace!(
            local_id = %entry.local_id,
            mapping = %entry.mapping,
            remote_id = ?entry.remote_id,
            "identity cached"
        );
        self.by_local.insert(
            entry.local_id,
            Slot {
                instance_key: entry.instance_key,
                mapping: entry.mapping,
                remote_id: entry.remote_id,
            },
        );
        Ok(())
    }

    pub fn mapping_of(&self, local_id: &LocalId) -> Option<&MappingKey> {
        self.by_local.get(local_id).map(|slot| &slot.mapping)
    }
}
