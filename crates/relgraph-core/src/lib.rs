//! RelGraph Core - in-memory object graph over a document store
//!
//! This crate provides the object-graph mapper kernel, including:
//! - Declarative schemas with three-phase mapping installation
//! - An identity cache keeping one resident instance per identity
//! - Bidirectional relationships (one-to-one, one-to-many, many-to-many)
//!   with lazy fault resolution
//! - A change ledger recording field-level changes with notifications
//! - A task-graph scheduler for concurrent mapping work
//! - Bulk mapping of raw JSON onto instances
//! - A merge engine persisting pending changes through a [`DocumentStore`]

pub mod cache;
pub mod changes;
pub mod config;
pub mod errors;
pub mod graph;
pub mod logging_facility;
pub mod mapping_op;
pub mod merge;
pub mod scheduler;
pub mod schema;
pub mod store;

pub use relgraph_core_types as types;

// Re-export commonly used types
pub use cache::{CacheQuery, IdentityCache};
pub use changes::{Change, ChangeKind, ChangeTarget, Topic};
pub use config::GraphConfig;
pub use errors::{ErrorClass, ExError, ExErrorKind, GraphError, Result};
pub use graph::{Graph, Identity, Instance, RelatedInstances, Relationship, RelationshipValue};
pub use mapping_op::{Datum, MappingResult};
pub use merge::MergeReport;
pub use scheduler::{Operation, OperationQueue, OperationState};
pub use schema::{
    CollectionDefinition, Mapping, MappingDefinition, MappingKey, RelationshipDefinition,
    RelationshipKind,
};
pub use store::{Document, DocumentStore, MemoryDocumentStore, StoreNotification, WriteResult};
pub use types::LocalId;
