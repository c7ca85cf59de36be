//! Serializable schema definitions
//!
//! A collection definition is plain data (JSON or TOML) describing every
//! mapping in the collection. Installing it into a [`Registry`](super::Registry)
//! produces [`Mapping`](super::Mapping)s.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cardinality of a relationship, named from the declaring side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// Scalar on both sides
    OneToOne,
    /// Scalar on the declaring side, sequence on the reverse side
    OneToMany,
    /// Sequence on both sides
    ManyToMany,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDefinition {
    /// Target mapping name, or `Collection.Mapping` for another collection
    pub mapping: String,
    #[serde(rename = "type")]
    pub kind: RelationshipKind,
    /// Field name installed on the target; defaults to `reverse_<field>`
    #[serde(default)]
    pub reverse: Option<String>,
}

impl RelationshipDefinition {
    pub fn new(kind: RelationshipKind, mapping: impl Into<String>) -> Self {
        Self {
            mapping: mapping.into(),
            kind,
            reverse: None,
        }
    }

    pub fn one_to_one(mapping: impl Into<String>) -> Self {
        Self::new(RelationshipKind::OneToOne, mapping)
    }

    pub fn one_to_many(mapping: impl Into<String>) -> Self {
        Self::new(RelationshipKind::OneToMany, mapping)
    }

    pub fn many_to_many(mapping: impl Into<String>) -> Self {
        Self::new(RelationshipKind::ManyToMany, mapping)
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }
}

fn default_id_field() -> String {
    "id".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingDefinition {
    pub name: String,
    /// Attribute holding the remote identity
    #[serde(default = "default_id_field")]
    pub id: String,
    #[serde(default)]
    pub attributes: Vec<String>,
    #[serde(default)]
    pub relationships: BTreeMap<String, RelationshipDefinition>,
    #[serde(default)]
    pub singleton: bool,
}

impl MappingDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: default_id_field(),
            attributes: Vec::new(),
            relationships: BTreeMap::new(),
            singleton: false,
        }
    }

    pub fn id_field(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes.extend(attributes.into_iter().map(Into::into));
        self
    }

    pub fn relationship(mut self, name: impl Into<String>, def: RelationshipDefinition) -> Self {
        self.relationships.insert(name.into(), def);
        self
    }

    pub fn singleton(mut self) -> Self {
        self.singleton = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDefinition {
    pub name: String,
    #[serde(default)]
    pub mappings: Vec<MappingDefinition>,
}

impl CollectionDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mappings: Vec::new(),
        }
    }

    pub fn mapping(mut self, mapping: MappingDefinition) -> Self {
        self.mappings.push(mapping);
        self
    }

    /// Parse a collection definition from JSON
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the document does not match the schema.
    pub fn from_json(source: &str) -> crate::errors::Result<Self> {
        Ok(serde_json::from_str(source)?)
    }
}
