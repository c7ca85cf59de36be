//! Entity schema: declarative definitions, installed mappings and the
//! collection registry that resolves relationships between them.

pub mod definition;
pub mod mapping;
pub mod registry;

pub use definition::{
    CollectionDefinition, MappingDefinition, RelationshipDefinition, RelationshipKind,
};
pub use mapping::{Mapping, MappingKey, RelationshipSpec, Side};
pub use registry::{Collection, Registry};

/// Document key holding an entity's local identity
pub const LOCAL_ID_FIELD: &str = "_id";

/// Names that cannot be declared as attributes or relationships
pub(crate) const RESERVED_FIELDS: &[&str] = &[LOCAL_ID_FIELD, "collection", "type"];
