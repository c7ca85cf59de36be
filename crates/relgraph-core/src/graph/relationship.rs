//! Relationship handles and fault resolution

use std::fmt;
use std::time::Instant;

use futures::FutureExt;
use tracing::debug;

use super::entity::Instance;
use super::proxy::{Identity, Related, RelationshipProxy};
use super::Graph;
use crate::errors::{GraphError, Result};
use crate::types::LocalId;

/// Value assigned to a relationship
#[derive(Debug, Clone, PartialEq)]
pub enum RelationshipValue {
    None,
    One(LocalId),
    Many(Vec<LocalId>),
}

impl From<&Instance> for RelationshipValue {
    fn from(instance: &Instance) -> Self {
        RelationshipValue::One(instance.local_id().clone())
    }
}

impl From<Option<&Instance>> for RelationshipValue {
    fn from(instance: Option<&Instance>) -> Self {
        instance.map_or(RelationshipValue::None, RelationshipValue::from)
    }
}

impl From<&[Instance]> for RelationshipValue {
    fn from(instances: &[Instance]) -> Self {
        RelationshipValue::Many(instances.iter().map(|i| i.local_id().clone()).collect())
    }
}

impl From<Vec<Instance>> for RelationshipValue {
    fn from(instances: Vec<Instance>) -> Self {
        RelationshipValue::from(instances.as_slice())
    }
}

/// Resolved contents of a relationship
#[derive(Debug, Clone, PartialEq)]
pub enum RelatedInstances {
    One(Option<Instance>),
    Many(Vec<Instance>),
}

impl RelatedInstances {
    /// The related instance of a to-one relationship
    pub fn as_one(&self) -> Option<&Instance> {
        match self {
            RelatedInstances::One(instance) => instance.as_ref(),
            RelatedInstances::Many(_) => None,
        }
    }

    pub fn into_vec(self) -> Vec<Instance> {
        match self {
            RelatedInstances::One(instance) => instance.into_iter().collect(),
            RelatedInstances::Many(instances) => instances,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RelatedInstances::One(instance) => usize::from(instance.is_some()),
            RelatedInstances::Many(instances) => instances.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to one relationship field of a resident instance
#[derive(Clone)]
pub struct Relationship {
    graph: Graph,
    owner: LocalId,
    field: String,
}

impl Relationship {
    pub(crate) fn new(graph: Graph, owner: LocalId, field: String) -> Self {
        Self {
            graph,
            owner,
            field,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn owner(&self) -> Instance {
        Instance::new(self.graph.clone(), self.owner.clone())
    }

    fn with_proxy<T>(&self, f: impl FnOnce(&RelationshipProxy) -> Result<T>) -> Result<T> {
        let state = self.graph.state();
        let (slot, _) = state.relationship_spec(&self.owner, &self.field)?;
        f(&state.record(&self.owner)?.proxies[slot])
    }

    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the owner is no longer resident.
    pub fn is_fault(&self) -> Result<bool> {
        self.with_proxy(|proxy| Ok(proxy.is_fault()))
    }

    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the owner is no longer resident.
    pub fn is_sequence(&self) -> Result<bool> {
        self.with_proxy(|proxy| Ok(proxy.is_sequence()))
    }

    /// Local ids of the related instances; available even for a fault
    ///
    /// # Errors
    ///
    /// Returns `InstanceNotFound` if the owner is no longer resident.
    pub fn identity(&self) -> Result<Identity> {
        self.with_proxy(|proxy| Ok(proxy.identity().clone()))
    }

    /// The related instances without resolving
    ///
    /// # Errors
    ///
    /// Returns `RelationshipFaulted` if the relationship is a fault.
    pub fn related(&self) -> Result<RelatedInstances> {
        self.with_proxy(|proxy| match proxy.related() {
            Related::Unresolved => Err(GraphError::RelationshipFaulted {
                field: self.field.clone(),
                local_id: self.owner.to_string(),
            }),
            Related::One(id) => Ok(RelatedInstances::One(
                id.clone().map(|id| Instance::new(self.graph.clone(), id)),
            )),
            Related::Many(ids) => Ok(RelatedInstances::Many(
                ids.iter()
                    .map(|id| Instance::new(self.graph.clone(), id.clone()))
                    .collect(),
            )),
        })
    }

    /// The related instances, loading any that are not resident
    ///
    /// Concurrent calls on the same faulted relationship share a single
    /// store round-trip.
    ///
    /// # Errors
    ///
    /// Returns `DocumentNotFound` if a related document is missing from the
    /// store, or the store's error.
    pub async fn get(&self) -> Result<RelatedInstances> {
        loop {
            let resolution = {
                let mut state = self.graph.state();
                let (slot, _) = state.relationship_spec(&self.owner, &self.field)?;
                let proxy = &state.record(&self.owner)?.proxies[slot];
                if !proxy.is_fault() {
                    drop(state);
                    return self.related();
                }
                let key = (self.owner.clone(), self.field.clone());
                match state.resolutions.get(&key) {
                    Some(pending) => pending.clone(),
                    None => {
                        let missing: Vec<LocalId> = proxy
                            .ids()
                            .into_iter()
                            .filter(|id| !state.entities.contains_key(id))
                            .collect();
                        let resolution =
                            resolve_fault(self.graph.clone(), key.clone(), missing)
                                .boxed()
                                .shared();
                        state.resolutions.insert(key, resolution.clone());
                        resolution
                    }
                }
            };
            resolution.await?;
        }
    }

    /// Replace the relationship's value, updating the other side
    ///
    /// # Errors
    ///
    /// Returns `InvalidRelationshipValue` for the wrong shape,
    /// `WrongTargetMapping` for an instance of another mapping, and
    /// `InstanceNotFound` for a target that is not resident.
    pub fn set(&self, value: impl Into<RelationshipValue>) -> Result<()> {
        self.graph
            .state()
            .set_relationship(&self.owner, &self.field, value.into())
    }

    /// Remove `remove_count` related instances at `index` and insert
    /// `added` there; works on a fault. Returns the removed local ids.
    ///
    /// # Errors
    ///
    /// Returns `SpliceOutOfBounds`, `DuplicateRelated` if an added instance
    /// is already related, or the errors of [`set`](Self::set).
    pub fn splice(
        &self,
        index: usize,
        remove_count: usize,
        added: &[Instance],
    ) -> Result<Vec<LocalId>> {
        let added = added.iter().map(|i| i.local_id().clone()).collect();
        self.graph
            .state()
            .splice_relationship(&self.owner, &self.field, index, remove_count, added)
    }

    /// Edit the related local ids in place, recorded as one splice
    ///
    /// The closure runs while the graph is locked and must not call back
    /// into the graph.
    ///
    /// # Errors
    ///
    /// Returns `RelationshipFaulted` on a fault, or the errors of
    /// [`splice`](Self::splice) for the resulting edit.
    pub fn edit<F>(&self, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Vec<LocalId>),
    {
        self.graph
            .state()
            .edit_relationship(&self.owner, &self.field, edit)
    }

    /// Verify this relationship agrees with itself and its mirrors
    ///
    /// # Errors
    ///
    /// Returns `RelationshipDesync` describing the first disagreement.
    pub fn check(&self) -> Result<()> {
        self.graph
            .state()
            .check_relationship(&self.owner, &self.field)
    }
}

impl fmt::Debug for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relationship")
            .field("owner", &self.owner)
            .field("field", &self.field)
            .finish()
    }
}

async fn resolve_fault(graph: Graph, key: (LocalId, String), missing: Vec<LocalId>) -> Result<()> {
    let start = Instant::now();
    let fetched = if missing.is_empty() {
        Ok(Vec::new())
    } else {
        graph.store().get_multiple(&missing).await
    };

    let mut state = graph.state();
    state.resolutions.remove(&key);
    let (owner, field) = key;
    for (local_id, document) in missing.iter().zip(fetched?) {
        let document = document.ok_or_else(|| GraphError::DocumentNotFound {
            local_id: local_id.to_string(),
        })?;
        if document.id != *local_id {
            return Err(GraphError::store(format!(
                "requested document {} but the store returned {}",
                local_id, document.id
            )));
        }
        state.materialize(document)?;
    }

    let (slot, _) = state.relationship_spec(&owner, &field)?;
    let all_resident = state.record(&owner)?.proxies[slot]
        .ids()
        .iter()
        .all(|id| state.entities.contains_key(id));
    if all_resident {
        state.record_mut(&owner)?.proxies[slot].resolve();
    }
    debug!(
        local_id = %owner,
        field = %field,
        fetched = missing.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "fault resolved"
    );
    Ok(())
}
