//! Installed entity mappings
//!
//! A [`Mapping`] goes through three install phases, each entered exactly
//! once and in order:
//!
//! 1. `install` validates the mapping's own attributes
//! 2. `install_relationships` resolves forward declarations against the
//!    registry (every mapping in the collection has finished phase 1)
//! 3. reverse relationships are written onto target mappings by the
//!    [`Registry`](super::Registry), which then marks phase 3 complete
//!
//! Attribute and relationship slots are positional; entity records store
//! their values in the same order.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::definition::{MappingDefinition, RelationshipDefinition, RelationshipKind};
use super::registry::Registry;
use super::RESERVED_FIELDS;
use crate::errors::{GraphError, Result};

/// Fully-qualified mapping name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingKey {
    pub collection: String,
    pub mapping: String,
}

impl MappingKey {
    pub fn new(collection: impl Into<String>, mapping: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            mapping: mapping.into(),
        }
    }

    /// Resolve `Mapping` or `Collection.Mapping` relative to `collection`
    pub fn parse_relative(collection: &str, reference: &str) -> Self {
        match reference.split_once('.') {
            Some((coll, mapping)) => Self::new(coll, mapping),
            None => Self::new(collection, reference),
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.collection, self.mapping)
    }
}

/// Which end of a declared relationship a field sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Forward,
    Reverse,
}

/// An installed relationship field
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipSpec {
    pub name: String,
    pub kind: RelationshipKind,
    pub side: Side,
    /// Mapping at the other end
    pub related: MappingKey,
    /// Field name at the other end
    pub counterpart: String,
}

impl RelationshipSpec {
    /// Whether this side holds a sequence of related instances
    pub fn is_sequence(&self) -> bool {
        match self.kind {
            RelationshipKind::OneToOne => false,
            RelationshipKind::OneToMany => self.side == Side::Reverse,
            RelationshipKind::ManyToMany => true,
        }
    }

    /// Whether the other end holds a sequence
    pub fn is_counterpart_sequence(&self) -> bool {
        match self.kind {
            RelationshipKind::OneToOne => false,
            RelationshipKind::OneToMany => self.side == Side::Forward,
            RelationshipKind::ManyToMany => true,
        }
    }

    fn reversed(&self, owner: &MappingKey) -> Self {
        Self {
            name: self.counterpart.clone(),
            kind: self.kind,
            side: Side::Reverse,
            related: owner.clone(),
            counterpart: self.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mapping {
    key: MappingKey,
    id_field: String,
    attributes: Vec<String>,
    relationships: Vec<RelationshipSpec>,
    declared: Vec<(String, RelationshipDefinition)>,
    singleton: bool,
    installed: bool,
    relationships_installed: bool,
    reverse_relationships_installed: bool,
}

impl Mapping {
    pub fn from_definition(collection: &str, def: &MappingDefinition) -> Self {
        Self {
            key: MappingKey::new(collection, def.name.clone()),
            id_field: def.id.clone(),
            attributes: def.attributes.clone(),
            relationships: Vec::new(),
            declared: def
                .relationships
                .iter()
                .map(|(name, rel)| (name.clone(), rel.clone()))
                .collect(),
            singleton: def.singleton,
            installed: false,
            relationships_installed: false,
            reverse_relationships_installed: false,
        }
    }

    pub fn key(&self) -> &MappingKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.mapping
    }

    pub fn collection(&self) -> &str {
        &self.key.collection
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn relationships(&self) -> &[RelationshipSpec] {
        &self.relationships
    }

    pub fn is_singleton(&self) -> bool {
        self.singleton
    }

    pub fn attribute_slot(&self, name: &str) -> Option<usize> {
        self.attributes.iter().position(|a| a == name)
    }

    pub fn id_slot(&self) -> Option<usize> {
        self.attribute_slot(&self.id_field)
    }

    pub fn relationship_slot(&self, name: &str) -> Option<usize> {
        self.relationships.iter().position(|r| r.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipSpec> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Look up a relationship, failing with `FieldNotFound`
    ///
    /// # Errors
    ///
    /// Returns `FieldNotFound` if no relationship is installed under `name`.
    pub fn require_relationship(&self, name: &str) -> Result<(usize, &RelationshipSpec)> {
        self.relationships
            .iter()
            .enumerate()
            .find(|(_, r)| r.name == name)
            .ok_or_else(|| GraphError::FieldNotFound {
                mapping: self.key.to_string(),
                field: name.to_string(),
            })
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.attribute_slot(name).is_some() || self.relationship_slot(name).is_some()
    }

    pub fn is_installed(&self) -> bool {
        self.installed && self.relationships_installed && self.reverse_relationships_installed
    }

    fn invalid(&self, reason: impl Into<String>) -> GraphError {
        GraphError::InvalidSchema {
            mapping: self.key.to_string(),
            reason: reason.into(),
        }
    }

    /// Phase 1: validate attributes
    ///
    /// # Errors
    ///
    /// Returns `MappingAlreadyInstalled` on re-entry and `InvalidSchema` for
    /// empty, duplicate or reserved names.
    pub fn install(&mut self) -> Result<()> {
        if self.installed {
            return Err(GraphError::MappingAlreadyInstalled {
                mapping: self.key.to_string(),
                phase: "attributes".to_string(),
            });
        }
        if self.key.mapping.is_empty() || self.key.mapping.contains('.') {
            return Err(self.invalid("mapping name must be non-empty and contain no '.'"));
        }
        if self.id_field.is_empty() {
            return Err(self.invalid("id field must be non-empty"));
        }
        if !self.attributes.contains(&self.id_field) {
            self.attributes.insert(0, self.id_field.clone());
        }
        for (i, attr) in self.attributes.iter().enumerate() {
            if attr.is_empty() || RESERVED_FIELDS.contains(&attr.as_str()) {
                return Err(self.invalid(format!("'{}' is not a valid attribute name", attr)));
            }
            if self.attributes[..i].contains(attr) {
                return Err(self.invalid(format!("attribute '{}' declared twice", attr)));
            }
            if self.declared.iter().any(|(name, _)| name == attr) {
                return Err(self.invalid(format!(
                    "'{}' declared as both attribute and relationship",
                    attr
                )));
            }
        }
        self.installed = true;
        Ok(())
    }

    /// Phase 2: resolve forward relationship declarations
    ///
    /// # Errors
    ///
    /// Returns `MappingAlreadyInstalled` on re-entry, `MappingNotInstalled`
    /// if phase 1 has not run, and `InvalidSchema` when a target mapping is
    /// unknown.
    pub fn install_relationships(&mut self, registry: &Registry) -> Result<()> {
        if self.relationships_installed {
            return Err(GraphError::MappingAlreadyInstalled {
                mapping: self.key.to_string(),
                phase: "relationships".to_string(),
            });
        }
        if !self.installed {
            return Err(GraphError::MappingNotInstalled {
                mapping: self.key.to_string(),
            });
        }
        let mut resolved = Vec::with_capacity(self.declared.len());
        for (name, def) in &self.declared {
            if name.is_empty() || RESERVED_FIELDS.contains(&name.as_str()) {
                return Err(self.invalid(format!("'{}' is not a valid relationship name", name)));
            }
            let related = MappingKey::parse_relative(&self.key.collection, &def.mapping);
            if registry.mapping_by_key(&related).is_err() {
                return Err(self.invalid(format!(
                    "relationship '{}' targets unknown mapping {}",
                    name, related
                )));
            }
            let counterpart = match &def.reverse {
                Some(reverse) if !reverse.is_empty() => reverse.clone(),
                Some(_) => return Err(self.invalid("reverse name must be non-empty")),
                None => format!("reverse_{}", name),
            };
            if related == self.key
                && counterpart == *name
                && def.kind == RelationshipKind::OneToMany
            {
                return Err(self.invalid(format!(
                    "one-to-many relationship '{}' cannot be its own reverse",
                    name
                )));
            }
            resolved.push(RelationshipSpec {
                name: name.clone(),
                kind: def.kind,
                side: Side::Forward,
                related,
                counterpart,
            });
        }
        self.relationships.extend(resolved);
        self.relationships_installed = true;
        Ok(())
    }

    /// Reverse specs to install, keyed by the mapping that receives them.
    /// A relationship whose counterpart is itself is skipped.
    pub(crate) fn pending_reverse_relationships(&self) -> Vec<(MappingKey, RelationshipSpec)> {
        self.relationships
            .iter()
            .filter(|r| r.side == Side::Forward)
            .filter(|r| !(r.related == self.key && r.counterpart == r.name))
            .map(|r| (r.related.clone(), r.reversed(&self.key)))
            .collect()
    }

    pub(crate) fn add_reverse_relationship(&mut self, spec: RelationshipSpec) -> Result<()> {
        if self.has_field(&spec.name) || self.declared.iter().any(|(n, _)| *n == spec.name) {
            return Err(self.invalid(format!(
                "reverse relationship '{}' from {} collides with an existing field",
                spec.name, spec.related
            )));
        }
        self.relationships.push(spec);
        Ok(())
    }

    /// Phase 3 bookkeeping; the registry installs the reverse specs first
    pub(crate) fn mark_reverse_relationships_installed(&mut self) -> Result<()> {
        if self.reverse_relationships_installed {
            return Err(GraphError::MappingAlreadyInstalled {
                mapping: self.key.to_string(),
                phase: "reverse_relationships".to_string(),
            });
        }
        if !self.relationships_installed {
            return Err(GraphError::MappingNotInstalled {
                mapping: self.key.to_string(),
            });
        }
        self.reverse_relationships_installed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definition::MappingDefinition;

    #[test]
    fn test_parse_relative_key() {
        assert_eq!(
            MappingKey::parse_relative("app", "User"),
            MappingKey::new("app", "User")
        );
        assert_eq!(
            MappingKey::parse_relative("app", "auth.Account"),
            MappingKey::new("auth", "Account")
        );
    }

    #[test]
    fn test_install_adds_id_field_first() {
        let def = MappingDefinition::new("User").attributes(["name"]);
        let mut mapping = Mapping::from_definition("app", &def);
        mapping.install().unwrap();
        assert_eq!(mapping.attributes(), &["id".to_string(), "name".to_string()]);
        assert_eq!(mapping.id_slot(), Some(0));
    }

    #[test]
    fn test_install_twice_fails() {
        let def = MappingDefinition::new("User");
        let mut mapping = Mapping::from_definition("app", &def);
        mapping.install().unwrap();
        let err = mapping.install().unwrap_err();
        assert!(matches!(err, GraphError::MappingAlreadyInstalled { .. }));
    }

    #[test]
    fn test_reserved_attribute_rejected() {
        let def = MappingDefinition::new("User").attributes(["_id"]);
        let mut mapping = Mapping::from_definition("app", &def);
        assert!(matches!(
            mapping.install(),
            Err(GraphError::InvalidSchema { .. })
        ));
    }

    #[test]
    fn test_sequence_sides() {
        let forward = RelationshipSpec {
            name: "owner".into(),
            kind: RelationshipKind::OneToMany,
            side: Side::Forward,
            related: MappingKey::new("app", "Person"),
            counterpart: "cars".into(),
        };
        assert!(!forward.is_sequence());
        assert!(forward.is_counterpart_sequence());

        let reverse = forward.reversed(&MappingKey::new("app", "Car"));
        assert!(reverse.is_sequence());
        assert_eq!(reverse.name, "cars");
        assert_eq!(reverse.counterpart, "owner");
        assert_eq!(reverse.related, MappingKey::new("app", "Car"));
    }
}
