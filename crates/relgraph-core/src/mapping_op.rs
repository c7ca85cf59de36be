//! Bulk mapping of raw data onto instances
//!
//! A mapping operation resolves each input item to an instance, maps the
//! values of every relationship field through a sub-operation against the
//! related mapping, then assembles attributes and relationships onto the
//! resolved instances. Lookup and sub-operations run concurrently; the
//! sub-operations are bounded by `mapping.max_concurrent_sub_operations`.
//!
//! Failures are reported per item. Only a failure of the operation as a
//! whole (an unknown mapping, say) is returned as an error.

use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::debug;

use crate::cache::{remote_key, CacheQuery};
use crate::errors::{GraphError, Result};
use crate::graph::{Graph, GraphState, Instance, RelationshipValue};
use crate::scheduler::{Operation, OperationQueue};
use crate::schema::{Mapping, MappingKey, LOCAL_ID_FIELD};
use crate::types::LocalId;

/// One input item
#[derive(Debug, Clone)]
pub enum Datum {
    /// Used as is
    Instance(Instance),
    /// A remote identity; looked up, or a new instance is created for it
    RemoteId(Value),
    /// Field values; `_id` names a local identity
    Record(Map<String, Value>),
}

impl Datum {
    /// Classify a JSON value
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for `null`, booleans and arrays.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Datum::Record(map)),
            Value::String(_) | Value::Number(_) => Ok(Datum::RemoteId(value)),
            other => Err(GraphError::InvalidInput {
                reason: format!("cannot map {} onto an instance", other),
            }),
        }
    }
}

/// Per-item outcome; `objects[i]` is set exactly when `errors[i]` is not
#[derive(Debug, Clone, Default)]
pub struct MappingResult {
    pub objects: Vec<Option<Instance>>,
    pub errors: Vec<Option<GraphError>>,
}

impl MappingResult {
    fn with_len(len: usize) -> Self {
        Self {
            objects: vec![None; len],
            errors: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_ok(&self) -> bool {
        self.error_count() == 0
    }

    /// Successfully mapped instances, in input order
    pub fn instances(&self) -> Vec<Instance> {
        self.objects.iter().flatten().cloned().collect()
    }

    pub fn first_error(&self) -> Option<&GraphError> {
        self.errors.iter().flatten().next()
    }

    fn local_id(&self, pos: usize) -> Result<LocalId> {
        match (self.objects.get(pos), self.errors.get(pos)) {
            (Some(Some(instance)), _) => Ok(instance.local_id().clone()),
            (_, Some(Some(err))) => Err(err.clone()),
            _ => Err(GraphError::Internal {
                message: format!("no mapping outcome for related item {}", pos),
            }),
        }
    }
}

enum Shape {
    Absent,
    Null,
    One(usize),
    Many(Range<usize>),
}

struct RelationshipPlan {
    field: String,
    related: MappingKey,
    shapes: Vec<Shape>,
    data: Vec<Result<Datum>>,
}

type Slots = Arc<Mutex<Vec<Option<Result<LocalId>>>>>;
type SubResult = Arc<Mutex<Option<Result<MappingResult>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MappingOperation {
    graph: Graph,
    mapping: MappingKey,
    items: Vec<Result<Datum>>,
}

impl MappingOperation {
    /// Items that are already `Err` are reported back unchanged
    pub fn new(graph: Graph, mapping: MappingKey, items: Vec<Result<Datum>>) -> Self {
        Self {
            graph,
            mapping,
            items,
        }
    }

    pub fn execute(self) -> BoxFuture<'static, Result<MappingResult>> {
        self.run().boxed()
    }

    async fn run(self) -> Result<MappingResult> {
        let mapping = self.graph.state().installed_mapping(&self.mapping)?;
        let item_count = self.items.len();
        let mut plans = plan_relationships(&mapping, &self.items);
        let items = Arc::new(self.items);
        let slots: Slots = Arc::new(Mutex::new(vec![None; item_count]));

        let lookup = lookup_operation(&self.graph, &mapping, &items, &slots);
        let barrier = Operation::new(format!("assemble {}", mapping.key()), || async { Ok(()) });
        barrier.add_dependency(&lookup, false)?;

        let queue = OperationQueue::new(
            format!("map {}", mapping.key()),
            self.graph.config().mapping.max_concurrent_sub_operations,
        );
        let mut sub_results: Vec<SubResult> = Vec::with_capacity(plans.len());
        for plan in &mut plans {
            let slot: SubResult = Arc::new(Mutex::new(None));
            sub_results.push(Arc::clone(&slot));
            let graph = self.graph.clone();
            let related = plan.related.clone();
            let data = std::mem::take(&mut plan.data);
            let op = Operation::new(
                format!("map {}.{}", mapping.key(), plan.field),
                move || async move {
                    let result = MappingOperation::new(graph, related, data)
                        .execute()
                        .await;
                    *lock(&slot) = Some(result);
                    Ok(())
                },
            );
            barrier.add_dependency(&op, false)?;
            queue.add_operation(op);
        }

        debug!(
            mapping = %mapping.key(),
            item_count,
            sub_operation_count = plans.len(),
            "mapping started"
        );
        queue.start();
        lookup.start();
        barrier.run_to_completion().await?;
        if let Some(err) = lookup.error() {
            return Err(err);
        }

        let slots = std::mem::take(&mut *lock(&slots));
        let sub_results: Vec<Result<MappingResult>> = sub_results
            .iter()
            .map(|slot| {
                lock(slot).take().unwrap_or_else(|| {
                    Err(GraphError::Internal {
                        message: "relationship sub-operation produced no result".to_string(),
                    })
                })
            })
            .collect();

        let mut state = self.graph.state();
        Ok(assemble(
            &self.graph,
            &mut state,
            &mapping,
            &items,
            slots,
            &plans,
            &sub_results,
        ))
    }
}

fn lookup_operation(
    graph: &Graph,
    mapping: &Mapping,
    items: &Arc<Vec<Result<Datum>>>,
    slots: &Slots,
) -> Operation {
    if mapping.is_singleton() {
        let (graph, key, items, slots) = (
            graph.clone(),
            mapping.key().clone(),
            Arc::clone(items),
            Arc::clone(slots),
        );
        return Operation::new(format!("singleton lookup {}", key), move || async move {
            let results = {
                let mut state = graph.state();
                let singleton = state.singleton_id(&key);
                items
                    .iter()
                    .map(|item| match item {
                        Err(err) => Err(err.clone()),
                        Ok(Datum::Instance(instance)) => check_instance(&state, &key, instance),
                        Ok(_) => singleton.clone(),
                    })
                    .collect::<Vec<_>>()
            };
            let mut slots = lock(&slots);
            for (i, result) in results.into_iter().enumerate() {
                slots[i] = Some(result);
            }
            Ok(())
        });
    }

    let local = {
        let (graph, key, items, slots) = (
            graph.clone(),
            mapping.key().clone(),
            Arc::clone(items),
            Arc::clone(slots),
        );
        Operation::new(format!("local lookup {}", key), move || {
            local_lookup(graph, key, items, slots)
        })
    };
    let remote = {
        let (graph, mapping, items, slots) = (
            graph.clone(),
            mapping.clone(),
            Arc::clone(items),
            Arc::clone(slots),
        );
        Operation::new(format!("remote lookup {}", mapping.key()), move || async move {
            remote_lookup(&graph, &mapping, &items, &slots);
            Ok(())
        })
    };
    Operation::composite(format!("lookup {}", mapping.key()), vec![local, remote])
}

fn check_instance(state: &GraphState, key: &MappingKey, instance: &Instance) -> Result<LocalId> {
    let record = state.record(instance.local_id())?;
    if record.mapping != *key {
        return Err(GraphError::InvalidInput {
            reason: format!(
                "instance {} is a {}, expected {}",
                instance.local_id(),
                record.mapping,
                key
            ),
        });
    }
    Ok(instance.local_id().clone())
}

/// Resolve items carrying `_id` from the cache, then the store in one batch
async fn local_lookup(
    graph: Graph,
    key: MappingKey,
    items: Arc<Vec<Result<Datum>>>,
    slots: Slots,
) -> Result<()> {
    let mut results: Vec<(usize, Result<LocalId>)> = Vec::new();
    let mut wanted: Vec<(usize, LocalId)> = Vec::new();
    for (i, item) in items.iter().enumerate() {
        let Ok(Datum::Record(map)) = item else {
            continue;
        };
        match map.get(LOCAL_ID_FIELD) {
            None => {}
            Some(Value::String(id)) => wanted.push((i, LocalId::from(id.as_str()))),
            Some(other) => results.push((
                i,
                Err(GraphError::InvalidInput {
                    reason: format!("{} must be a string, got {}", LOCAL_ID_FIELD, other),
                }),
            )),
        }
    }

    if !wanted.is_empty() {
        let mut missing: Vec<LocalId> = {
            let state = graph.state();
            wanted
                .iter()
                .map(|(_, id)| id)
                .filter(|id| !state.cache.contains(id))
                .cloned()
                .collect()
        };
        missing.sort();
        missing.dedup();

        let fetched = if missing.is_empty() {
            Ok(Vec::new())
        } else {
            graph.store().get_multiple(&missing).await
        };

        let mut state = graph.state();
        match fetched {
            Err(err) => {
                results.extend(wanted.into_iter().map(|(i, _)| (i, Err(err.clone()))));
            }
            Ok(documents) => {
                let mut failures = Vec::new();
                for (id, document) in missing.iter().zip(documents) {
                    if let Some(document) = document {
                        if let Err(err) = state.materialize(document) {
                            failures.push((id.clone(), err));
                        }
                    }
                }
                for (i, id) in wanted {
                    let result = match state.entities.get(&id) {
                        Some(record) if record.mapping == key => Ok(id),
                        Some(record) => Err(GraphError::InvalidInput {
                            reason: format!("{} is a {}, expected {}", id, record.mapping, key),
                        }),
                        None => Err(failures
                            .iter()
                            .find(|(failed, _)| *failed == id)
                            .map(|(_, err)| err.clone())
                            .unwrap_or_else(|| GraphError::DocumentNotFound {
                                local_id: id.to_string(),
                            })),
                    };
                    results.push((i, result));
                }
            }
        }
    }

    let mut slots = lock(&slots);
    for (i, result) in results {
        slots[i] = Some(result);
    }
    Ok(())
}

/// Resolve items by remote identity, creating instances for unknown ids
/// and for records carrying no identity at all
fn remote_lookup(graph: &Graph, mapping: &Mapping, items: &[Result<Datum>], slots: &Slots) {
    let results: Vec<(usize, Result<LocalId>)> = {
        let mut state = graph.state();
        items
            .iter()
            .enumerate()
            .filter_map(|(i, item)| {
                let result = match item {
                    Err(err) => Err(err.clone()),
                    Ok(Datum::Instance(instance)) => check_instance(&state, mapping.key(), instance),
                    Ok(Datum::RemoteId(remote)) => lookup_or_create(&mut state, mapping, remote),
                    Ok(Datum::Record(map)) if map.contains_key(LOCAL_ID_FIELD) => return None,
                    Ok(Datum::Record(map)) => match map.get(mapping.id_field()) {
                        Some(remote) if !remote.is_null() => {
                            lookup_or_create(&mut state, mapping, remote)
                        }
                        _ => state.create_entity(mapping.key(), None),
                    },
                };
                Some((i, result))
            })
            .collect()
    };
    let mut slots = lock(slots);
    for (i, result) in results {
        slots[i] = Some(result);
    }
}

fn lookup_or_create(state: &mut GraphState, mapping: &Mapping, remote: &Value) -> Result<LocalId> {
    let key = remote_key(remote)?.ok_or_else(|| GraphError::InvalidInput {
        reason: "remote identity must not be null".to_string(),
    })?;
    if let Some(local_id) = state
        .cache
        .get(&CacheQuery::remote(mapping.key().clone(), key))
    {
        return Ok(local_id);
    }
    let local_id = state.create_entity(mapping.key(), None)?;
    state.set_attribute(&local_id, mapping.id_field(), remote.clone())?;
    Ok(local_id)
}

/// One plan per relationship field present in at least one record; nested
/// values are flattened into a single sub-operation input
fn plan_relationships(mapping: &Mapping, items: &[Result<Datum>]) -> Vec<RelationshipPlan> {
    mapping
        .relationships()
        .iter()
        .filter(|spec| {
            items.iter().any(
                |item| matches!(item, Ok(Datum::Record(map)) if map.contains_key(&spec.name)),
            )
        })
        .map(|spec| {
            let mut data = Vec::new();
            let shapes = items
                .iter()
                .map(|item| {
                    let value = match item {
                        Ok(Datum::Record(map)) => map.get(&spec.name),
                        _ => None,
                    };
                    match value {
                        None => Shape::Absent,
                        Some(Value::Null) => Shape::Null,
                        Some(Value::Array(elements)) => {
                            let start = data.len();
                            data.extend(elements.iter().cloned().map(Datum::from_value));
                            Shape::Many(start..data.len())
                        }
                        Some(other) => {
                            data.push(Datum::from_value(other.clone()));
                            Shape::One(data.len() - 1)
                        }
                    }
                })
                .collect();
            RelationshipPlan {
                field: spec.name.clone(),
                related: spec.related.clone(),
                shapes,
                data,
            }
        })
        .collect()
}

fn assemble(
    graph: &Graph,
    state: &mut GraphState,
    mapping: &Mapping,
    items: &[Result<Datum>],
    slots: Vec<Option<Result<LocalId>>>,
    plans: &[RelationshipPlan],
    sub_results: &[Result<MappingResult>],
) -> MappingResult {
    let mut result = MappingResult::with_len(items.len());
    for (i, slot) in slots.into_iter().enumerate() {
        let local_id = match slot {
            Some(Ok(local_id)) => local_id,
            Some(Err(err)) => {
                result.errors[i] = Some(err);
                continue;
            }
            None => {
                result.errors[i] = Some(GraphError::Internal {
                    message: format!("item {} was never looked up", i),
                });
                continue;
            }
        };

        let mut first_error: Option<GraphError> = None;
        if let Ok(Datum::Record(map)) = &items[i] {
            for (field, value) in map {
                if field == LOCAL_ID_FIELD || mapping.attribute_slot(field).is_none() {
                    continue;
                }
                if let Err(err) = state.set_attribute(&local_id, field, value.clone()) {
                    first_error.get_or_insert(err);
                }
            }
        }

        for (plan, sub) in plans.iter().zip(sub_results) {
            let value = match (&plan.shapes[i], sub) {
                (Shape::Absent, _) => continue,
                (Shape::Null, _) => Ok(RelationshipValue::None),
                (_, Err(err)) => Err(err.clone()),
                (Shape::One(pos), Ok(sub)) => sub.local_id(*pos).map(RelationshipValue::One),
                (Shape::Many(range), Ok(sub)) => range
                    .clone()
                    .map(|pos| sub.local_id(pos))
                    .collect::<Result<Vec<_>>>()
                    .map(RelationshipValue::Many),
            };
            if let Err(err) =
                value.and_then(|value| state.set_relationship(&local_id, &plan.field, value))
            {
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => result.errors[i] = Some(err),
            None => result.objects[i] = Some(Instance::new(graph.clone(), local_id)),
        }
    }
    result
}
