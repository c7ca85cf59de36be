//! The object graph
//!
//! [`Graph`] is a cloneable handle over shared state: the schema registry,
//! the identity cache, the resident entity records and the change ledger.
//! All state sits behind one lock which is never held across an await, so
//! every synchronous mutation (an attribute write, a relationship set with
//! its mirrored reverse edits) is atomic with respect to other tasks.

mod entity;
mod linkage;
mod proxy;
mod relationship;
mod replay;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::cache::{remote_key, CacheEntry, CacheQuery, IdentityCache, InstanceKey};
use crate::changes::{Change, ChangeKind, ChangeLedger, Topic};
use crate::config::GraphConfig;
use crate::errors::{GraphError, Result};
use crate::mapping_op::{Datum, MappingOperation, MappingResult};
use crate::merge::{MergeEngine, MergeReport};
use crate::schema::{CollectionDefinition, Mapping, MappingKey, Registry};
use crate::store::{Document, DocumentStore};
use crate::types::LocalId;
use crate::{log_op_end, log_op_error, log_op_start};

pub(crate) use entity::EntityRecord;
pub use entity::Instance;
pub use proxy::Identity;
use proxy::RelationshipProxy;
pub use relationship::{RelatedInstances, Relationship, RelationshipValue};

pub(crate) type SharedResolution = Shared<BoxFuture<'static, Result<()>>>;

pub(crate) struct GraphState {
    pub(crate) registry: Registry,
    pub(crate) cache: IdentityCache,
    pub(crate) ledger: ChangeLedger,
    pub(crate) entities: HashMap<LocalId, EntityRecord>,
    pub(crate) resolutions: HashMap<(LocalId, String), SharedResolution>,
}

impl GraphState {
    fn new(config: &GraphConfig) -> Self {
        Self {
            registry: Registry::new(),
            cache: IdentityCache::new(),
            ledger: ChangeLedger::new(config.merge.notification_buffer),
            entities: HashMap::new(),
            resolutions: HashMap::new(),
        }
    }

    pub(crate) fn record(&self, local_id: &LocalId) -> Result<&EntityRecord> {
        self.entities
            .get(local_id)
            .ok_or_else(|| GraphError::InstanceNotFound {
                local_id: local_id.to_string(),
            })
    }

    pub(crate) fn record_mut(&mut self, local_id: &LocalId) -> Result<&mut EntityRecord> {
        self.entities
            .get_mut(local_id)
            .ok_or_else(|| GraphError::InstanceNotFound {
                local_id: local_id.to_string(),
            })
    }

    pub(crate) fn mapping_for(&self, local_id: &LocalId) -> Result<&Mapping> {
        let record = self.record(local_id)?;
        self.registry.mapping_by_key(&record.mapping)
    }

    pub(crate) fn installed_mapping(&self, key: &MappingKey) -> Result<Mapping> {
        let mapping = self.registry.mapping_by_key(key)?;
        if !mapping.is_installed() {
            return Err(GraphError::MappingNotInstalled {
                mapping: key.to_string(),
            });
        }
        Ok(mapping.clone())
    }

    pub(crate) fn emit(
        &mut self,
        local_id: &LocalId,
        mapping: &MappingKey,
        field: &str,
        kind: ChangeKind,
    ) -> Result<()> {
        let change = Change::new(
            mapping.collection.clone(),
            mapping.mapping.clone(),
            local_id.clone(),
            field,
            kind,
        )?;
        self.ledger.register(change)?;
        Ok(())
    }

    /// Construct a fresh instance with every field empty
    pub(crate) fn create_entity(
        &mut self,
        key: &MappingKey,
        local_id: Option<LocalId>,
    ) -> Result<LocalId> {
        let mapping = self.installed_mapping(key)?;
        let local_id = local_id.unwrap_or_else(LocalId::generate);
        let record = EntityRecord::empty(&mapping);
        self.cache.insert(CacheEntry {
            instance_key: record.key,
            local_id: local_id.clone(),
            mapping: key.clone(),
            remote_id: None,
            singleton: mapping.is_singleton(),
        })?;
        trace!(local_id = %local_id, mapping = %key, "instance created");
        self.entities.insert(local_id.clone(), record);
        Ok(local_id)
    }

    /// Make a stored document resident; an already-resident instance wins
    pub(crate) fn materialize(&mut self, document: Document) -> Result<LocalId> {
        if self.entities.contains_key(&document.id) {
            return Ok(document.id);
        }
        let key = MappingKey::new(document.collection.clone(), document.mapping.clone());
        let mapping = self.installed_mapping(&key)?;
        let document = self.replay_pending(document);

        let values: Vec<Value> = mapping
            .attributes()
            .iter()
            .map(|a| document.get(a).cloned().unwrap_or(Value::Null))
            .collect();
        let proxies = mapping
            .relationships()
            .iter()
            .map(|spec| {
                let value = document.get(&spec.name).unwrap_or(&Value::Null);
                Identity::from_value(spec.is_sequence(), &spec.name, value)
                    .map(RelationshipProxy::from_identity)
            })
            .collect::<Result<Vec<_>>>()?;
        let remote_id = match mapping.id_slot() {
            Some(slot) => remote_key(&values[slot])?,
            None => None,
        };

        let record = EntityRecord {
            key: InstanceKey::next(),
            mapping: key.clone(),
            values,
            proxies,
        };
        self.cache.insert(CacheEntry {
            instance_key: record.key,
            local_id: document.id.clone(),
            mapping: key,
            remote_id,
            singleton: mapping.is_singleton(),
        })?;
        trace!(local_id = %document.id, "instance materialized");
        self.entities.insert(document.id.clone(), record);
        Ok(document.id)
    }

    /// Bring a stored document up to date with changes not yet merged.
    /// If a merge already wrote a prefix of them, only the rest applies.
    fn replay_pending(&self, document: Document) -> Document {
        let pending = self.ledger.changes_for(&document.id);
        for skip in 0..pending.len() {
            let mut candidate = document.clone();
            if pending[skip..].iter().all(|c| c.apply(&mut candidate).is_ok()) {
                return candidate;
            }
        }
        document
    }

    /// Re-register an instance after its remote identity changed
    pub(crate) fn recache(
        &mut self,
        local_id: &LocalId,
        mapping: &Mapping,
        remote: &Value,
    ) -> Result<()> {
        let remote_id = remote_key(remote)?;
        let instance_key = self.record(local_id)?.key;
        self.cache.insert(CacheEntry {
            instance_key,
            local_id: local_id.clone(),
            mapping: mapping.key().clone(),
            remote_id,
            singleton: mapping.is_singleton(),
        })
    }

    pub(crate) fn set_attribute(
        &mut self,
        local_id: &LocalId,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let mapping = self.mapping_for(local_id)?.clone();
        let slot = match mapping.attribute_slot(field) {
            Some(slot) => slot,
            None if mapping.relationship_slot(field).is_some() => {
                return Err(GraphError::InvalidInput {
                    reason: format!("{} is a relationship; set it through the relationship", field),
                });
            }
            None => {
                return Err(GraphError::FieldNotFound {
                    mapping: mapping.key().to_string(),
                    field: field.to_string(),
                });
            }
        };
        let old = self.record(local_id)?.values[slot].clone();
        if old == value {
            return Ok(());
        }
        if mapping.id_slot() == Some(slot) {
            self.recache(local_id, &mapping, &value)?;
        }
        self.record_mut(local_id)?.values[slot] = value.clone();
        self.emit(
            local_id,
            mapping.key(),
            field,
            ChangeKind::Set { old, new: value },
        )
    }

    pub(crate) fn to_document(&self, local_id: &LocalId) -> Result<Document> {
        let record = self.record(local_id)?;
        let mapping = self.registry.mapping_by_key(&record.mapping)?;
        let mut document = Document::empty(
            local_id.clone(),
            mapping.collection(),
            mapping.name(),
        );
        for (name, value) in mapping.attributes().iter().zip(&record.values) {
            if !value.is_null() {
                document.fields.insert(name.clone(), value.clone());
            }
        }
        for (spec, proxy) in mapping.relationships().iter().zip(&record.proxies) {
            if !proxy.identity().is_empty() {
                document
                    .fields
                    .insert(spec.name.clone(), proxy.identity_value());
            }
        }
        Ok(document)
    }
}

struct GraphInner {
    state: Mutex<GraphState>,
    store: Arc<dyn DocumentStore>,
    config: GraphConfig,
    merge: MergeEngine,
}

/// Shared handle to an object graph backed by a document store
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, GraphConfig::default())
    }

    pub fn with_config(store: Arc<dyn DocumentStore>, config: GraphConfig) -> Self {
        Self {
            inner: Arc::new(GraphInner {
                state: Mutex::new(GraphState::new(&config)),
                store,
                merge: MergeEngine::new(&config.merge),
                config,
            }),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, GraphState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &GraphConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.inner.store)
    }

    pub fn ptr_eq(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Install a collection and all of its mappings
    ///
    /// # Errors
    ///
    /// Returns the first schema error; the registry is unchanged on failure.
    pub fn register_collection(&self, def: &CollectionDefinition) -> Result<()> {
        let mut state = self.state();
        state.registry.register_collection(def)?;
        state.extend_resident_proxies();
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `CollectionNotFound` or `MappingNotFound`.
    pub fn mapping(&self, collection: &str, mapping: &str) -> Result<Mapping> {
        self.state().registry.mapping(collection, mapping).cloned()
    }

    /// Names of every registered collection
    pub fn collection_names(&self) -> Vec<String> {
        self.state()
            .registry
            .collections()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Construct a new, empty instance of a mapping
    ///
    /// # Errors
    ///
    /// Returns `MappingNotInstalled` unless all install phases completed,
    /// or `IdentityConflict` for a second instance of a singleton.
    pub fn new_instance(&self, collection: &str, mapping: &str) -> Result<Instance> {
        let key = MappingKey::new(collection, mapping);
        let local_id = self.state().create_entity(&key, None)?;
        Ok(Instance::new(self.clone(), local_id))
    }

    /// The resident instance with this local id, if any
    pub fn instance(&self, local_id: &LocalId) -> Option<Instance> {
        self.cache_get(&CacheQuery::local(local_id.clone()))
    }

    pub fn cache_get(&self, query: &CacheQuery) -> Option<Instance> {
        let local_id = self.state().cache.get(query)?;
        Some(Instance::new(self.clone(), local_id))
    }

    /// # Errors
    ///
    /// Returns `InvalidInput` if `remote` is not a valid remote identity.
    pub fn get_by_remote_id(
        &self,
        collection: &str,
        mapping: &str,
        remote: &Value,
    ) -> Result<Option<Instance>> {
        Ok(remote_key(remote)?.and_then(|remote| {
            self.cache_get(&CacheQuery::remote(MappingKey::new(collection, mapping), remote))
        }))
    }

    /// The singleton instance of a mapping, created on first access
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if the mapping is not a singleton.
    pub fn singleton(&self, collection: &str, mapping: &str) -> Result<Instance> {
        let key = MappingKey::new(collection, mapping);
        let local_id = self.state().singleton_id(&key)?;
        Ok(Instance::new(self.clone(), local_id))
    }

    pub fn resident_count(&self) -> usize {
        self.state().entities.len()
    }

    /// The resident instance with this local id, loading it from the store
    /// if necessary
    ///
    /// # Errors
    ///
    /// Returns `DocumentNotFound` if the store has no such document.
    pub async fn load(&self, local_id: &LocalId) -> Result<Instance> {
        if let Some(instance) = self.instance(local_id) {
            return Ok(instance);
        }
        let document = self
            .store()
            .get(local_id)
            .await?
            .ok_or_else(|| GraphError::DocumentNotFound {
                local_id: local_id.to_string(),
            })?;
        let local_id = self.state().materialize(document)?;
        Ok(Instance::new(self.clone(), local_id))
    }

    /// Record a change in the ledger without touching resident instances
    ///
    /// # Errors
    ///
    /// Returns `MissingField` if the change is incompletely named.
    pub fn register_change(&self, change: Change) -> Result<Arc<Change>> {
        self.state().ledger.register(change)
    }

    pub fn subscribe(&self, topic: Topic) -> broadcast::Receiver<Arc<Change>> {
        self.state().ledger.subscribe(topic)
    }

    pub fn pending_change_count(&self) -> usize {
        self.state().ledger.pending_count()
    }

    pub fn changes_for(&self, local_id: &LocalId) -> Vec<Arc<Change>> {
        self.state().ledger.changes_for(local_id)
    }

    pub fn pending_identities(&self) -> Vec<LocalId> {
        self.state().ledger.pending_identities()
    }

    /// Drop every pending change without persisting it
    ///
    /// Resident instances keep their current values.
    pub fn discard_changes(&self) {
        self.state().ledger.clear();
    }

    /// Replay a change onto the resident instance it names
    ///
    /// Mirrors are not updated and nothing is emitted; the change is
    /// assumed to have been recorded elsewhere along with its counterparts.
    ///
    /// # Errors
    ///
    /// Returns `ChangeConflict` if the instance does not hold the value the
    /// change expects.
    pub fn apply_change(&self, change: &Change) -> Result<()> {
        self.state().apply_change(change)
    }

    /// Map raw JSON data onto instances of a mapping
    ///
    /// Objects are records (`_id` names a local identity), strings and
    /// numbers are remote identities.
    ///
    /// # Errors
    ///
    /// Returns an error only if the whole operation could not run; per-item
    /// failures are reported in the result.
    pub async fn map(
        &self,
        collection: &str,
        mapping: &str,
        data: Vec<Value>,
    ) -> Result<MappingResult> {
        let key = MappingKey::new(collection, mapping);
        let items = data.into_iter().map(Datum::from_value).collect();
        self.run_mapping(key, items).await
    }

    /// Map already-classified data onto instances of a mapping
    ///
    /// # Errors
    ///
    /// Returns an error only if the whole operation could not run.
    pub async fn map_data(&self, key: MappingKey, data: Vec<Datum>) -> Result<MappingResult> {
        self.run_mapping(key, data.into_iter().map(Ok).collect())
            .await
    }

    async fn run_mapping(
        &self,
        key: MappingKey,
        items: Vec<Result<Datum>>,
    ) -> Result<MappingResult> {
        let start = Instant::now();
        let item_count = items.len();
        log_op_start!("map", collection = %key.collection, mapping = %key.mapping, item_count);
        let result = MappingOperation::new(self.clone(), key, items)
            .execute()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(mapped) => {
                log_op_end!(
                    "map",
                    duration_ms = duration_ms,
                    item_count,
                    error_count = mapped.error_count()
                );
            }
            Err(err) => log_op_error!("map", err.clone(), duration_ms = duration_ms),
        }
        result
    }

    /// Persist every pending change
    ///
    /// Merges are serialized: a merge requested while another is running
    /// starts once it completes.
    ///
    /// # Errors
    ///
    /// Returns `Store` on write failure, leaving the ledger untouched, or
    /// `ChangeConflict` if stored documents disagree with the changes.
    pub async fn merge_changes(&self) -> Result<MergeReport> {
        self.inner.merge.merge(self.clone()).await
    }
}

impl GraphState {
    /// Reverse relationships installed on an existing mapping are appended
    /// after its current slots; resident records gain an empty proxy for each.
    fn extend_resident_proxies(&mut self) {
        let registry = &self.registry;
        for record in self.entities.values_mut() {
            let Ok(mapping) = registry.mapping_by_key(&record.mapping) else {
                continue;
            };
            let specs = mapping.relationships();
            if record.proxies.len() < specs.len() {
                let added = specs[record.proxies.len()..]
                    .iter()
                    .map(|spec| RelationshipProxy::new(spec.is_sequence()));
                record.proxies.extend(added);
            }
        }
    }

    pub(crate) fn singleton_id(&mut self, key: &MappingKey) -> Result<LocalId> {
        let mapping = self.installed_mapping(key)?;
        if !mapping.is_singleton() {
            return Err(GraphError::InvalidInput {
                reason: format!("{} is not a singleton mapping", key),
            });
        }
        match self.cache.get(&CacheQuery::singleton(key.clone())) {
            Some(local_id) => Ok(local_id),
            None => {
                debug!(mapping = %key, "singleton created");
                self.create_entity(key, None)
            }
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("resident", &self.resident_count())
            .field("pending_changes", &self.pending_change_count())
            .finish()
    }
}
