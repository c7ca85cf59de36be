//! Collection registry
//!
//! Registering a collection runs the three mapping install phases across
//! all of its mappings. Registration is all-or-nothing: on any failure the
//! registry is left exactly as it was.

use std::collections::BTreeMap;

use tracing::debug;

use super::definition::CollectionDefinition;
use super::mapping::{Mapping, MappingKey};
use crate::errors::{GraphError, Result};

#[derive(Debug, Clone)]
pub struct Collection {
    name: String,
    mappings: BTreeMap<String, Mapping>,
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mapping(&self, name: &str) -> Option<&Mapping> {
        self.mappings.get(name)
    }

    pub fn mappings(&self) -> impl Iterator<Item = &Mapping> {
        self.mappings.values()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Registry {
    collections: BTreeMap<String, Collection>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install every mapping of `def`
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` for a duplicate collection or mapping name,
    /// or whatever the failing install phase reported.
    pub fn register_collection(&mut self, def: &CollectionDefinition) -> Result<()> {
        if def.name.is_empty() || def.name.contains('.') {
            return Err(GraphError::InvalidSchema {
                mapping: def.name.clone(),
                reason: "collection name must be non-empty and contain no '.'".to_string(),
            });
        }
        if self.collections.contains_key(&def.name) {
            return Err(GraphError::InvalidSchema {
                mapping: def.name.clone(),
                reason: "collection already registered".to_string(),
            });
        }

        let snapshot = self.clone();
        let result = self.install_collection(def);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn install_collection(&mut self, def: &CollectionDefinition) -> Result<()> {
        let mut mappings = BTreeMap::new();
        for mapping_def in &def.mappings {
            let mut mapping = Mapping::from_definition(&def.name, mapping_def);
            mapping.install()?;
            if mappings
                .insert(mapping_def.name.clone(), mapping)
                .is_some()
            {
                return Err(GraphError::InvalidSchema {
                    mapping: format!("{}.{}", def.name, mapping_def.name),
                    reason: "mapping declared twice".to_string(),
                });
            }
        }
        self.collections.insert(
            def.name.clone(),
            Collection {
                name: def.name.clone(),
                mappings,
            },
        );

        let keys: Vec<MappingKey> = def
            .mappings
            .iter()
            .map(|m| MappingKey::new(def.name.clone(), m.name.clone()))
            .collect();

        for key in &keys {
            let mut mapping = self.mapping_by_key(key)?.clone();
            mapping.install_relationships(self)?;
            *self.mapping_mut(key)? = mapping;
        }

        for key in &keys {
            let reverse = self.mapping_by_key(key)?.pending_reverse_relationships();
            for (target, spec) in reverse {
                self.mapping_mut(&target)?.add_reverse_relationship(spec)?;
            }
            self.mapping_mut(key)?.mark_reverse_relationships_installed()?;
        }

        debug!(
            collection = %def.name,
            mapping_count = keys.len(),
            "collection registered"
        );
        Ok(())
    }

    /// # Errors
    ///
    /// Returns `CollectionNotFound` if no collection is registered as `name`.
    pub fn collection(&self, name: &str) -> Result<&Collection> {
        self.collections
            .get(name)
            .ok_or_else(|| GraphError::CollectionNotFound {
                collection: name.to_string(),
            })
    }

    pub fn collections(&self) -> impl Iterator<Item = &Collection> {
        self.collections.values()
    }

    /// # Errors
    ///
    /// Returns `CollectionNotFound` or `MappingNotFound`.
    pub fn mapping(&self, collection: &str, mapping: &str) -> Result<&Mapping> {
        self.collection(collection)?
            .mappings
            .get(mapping)
            .ok_or_else(|| GraphError::MappingNotFound {
                collection: collection.to_string(),
                mapping: mapping.to_string(),
            })
    }

    /// # Errors
    ///
    /// Returns `CollectionNotFound` or `MappingNotFound`.
    pub fn mapping_by_key(&self, key: &MappingKey) -> Result<&Mapping> {
        self.mapping(&key.collection, &key.mapping)
    }

    fn mapping_mut(&mut self, key: &MappingKey) -> Result<&mut Mapping> {
        self.collections
            .get_mut(&key.collection)
            .and_then(|c| c.mappings.get_mut(&key.mapping))
            .ok_or_else(|| GraphError::MappingNotFound {
                collection: key.collection.clone(),
                mapping: key.mapping.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::definition::{MappingDefinition, RelationshipDefinition};
    use crate::schema::mapping::Side;

    fn garage() -> CollectionDefinition {
        CollectionDefinition::new("garage")
            .mapping(MappingDefinition::new("Person").attributes(["name"]))
            .mapping(
                MappingDefinition::new("Car")
                    .attributes(["colour"])
                    .relationship(
                        "owner",
                        RelationshipDefinition::one_to_many("Person").reverse("cars"),
                    ),
            )
    }

    #[test]
    fn test_reverse_installed_on_target() {
        let mut registry = Registry::new();
        registry.register_collection(&garage()).unwrap();

        let person = registry.mapping("garage", "Person").unwrap();
        let cars = person.relationship("cars").unwrap();
        assert_eq!(cars.side, Side::Reverse);
        assert!(cars.is_sequence());
        assert_eq!(cars.related, MappingKey::new("garage", "Car"));
        assert_eq!(cars.counterpart, "owner");
        assert!(person.is_installed());

        let car = registry.mapping("garage", "Car").unwrap();
        assert!(!car.relationship("owner").unwrap().is_sequence());
    }

    #[test]
    fn test_symmetric_relationship_installed_once() {
        let mut registry = Registry::new();
        registry
            .register_collection(&CollectionDefinition::new("social").mapping(
                MappingDefinition::new("User").relationship(
                    "bestFriend",
                    RelationshipDefinition::one_to_one("User").reverse("bestFriend"),
                ),
            ))
            .unwrap();

        let user = registry.mapping("social", "User").unwrap();
        assert_eq!(user.relationships().len(), 1);
    }

    #[test]
    fn test_self_reversed_one_to_many_rejected() {
        let mut registry = Registry::new();
        let bad = CollectionDefinition::new("tree").mapping(
            MappingDefinition::new("Node").relationship(
                "parent",
                RelationshipDefinition::one_to_many("Node").reverse("parent"),
            ),
        );
        let err = registry.register_collection(&bad).unwrap_err();
        assert!(matches!(err, GraphError::InvalidSchema { .. }));
        assert!(registry.collection("tree").is_err());
    }

    #[test]
    fn test_self_reversed_many_to_many_installed_once() {
        let mut registry = Registry::new();
        registry
            .register_collection(&CollectionDefinition::new("social").mapping(
                MappingDefinition::new("User").relationship(
                    "friends",
                    RelationshipDefinition::many_to_many("User").reverse("friends"),
                ),
            ))
            .unwrap();

        let user = registry.mapping("social", "User").unwrap();
        assert_eq!(user.relationships().len(), 1);
        assert!(user.relationship("friends").unwrap().is_sequence());
    }

    #[test]
    fn test_default_reverse_name() {
        let mut registry = Registry::new();
        registry
            .register_collection(
                &CollectionDefinition::new("c")
                    .mapping(MappingDefinition::new("A"))
                    .mapping(
                        MappingDefinition::new("B")
                            .relationship("a", RelationshipDefinition::one_to_one("A")),
                    ),
            )
            .unwrap();
        assert!(registry
            .mapping("c", "A")
            .unwrap()
            .relationship("reverse_a")
            .is_some());
    }

    #[test]
    fn test_cross_collection_target() {
        let mut registry = Registry::new();
        registry.register_collection(&garage()).unwrap();
        registry
            .register_collection(&CollectionDefinition::new("fleet").mapping(
                MappingDefinition::new("Depot").relationship(
                    "vehicles",
                    RelationshipDefinition::many_to_many("garage.Car").reverse("depots"),
                ),
            ))
            .unwrap();

        let car = registry.mapping("garage", "Car").unwrap();
        let depots = car.relationship("depots").unwrap();
        assert_eq!(depots.related, MappingKey::new("fleet", "Depot"));
    }

    #[test]
    fn test_failed_registration_rolls_back() {
        let mut registry = Registry::new();
        let bad = CollectionDefinition::new("c").mapping(
            MappingDefinition::new("A")
                .relationship("b", RelationshipDefinition::one_to_one("Missing")),
        );
        let err = registry.register_collection(&bad).unwrap_err();
        assert!(matches!(err, GraphError::InvalidSchema { .. }));
        assert!(registry.collection("c").is_err());
    }

    #[test]
    fn test_reverse_collision_rejected() {
        let mut registry = Registry::new();
        let bad = CollectionDefinition::new("c")
            .mapping(MappingDefinition::new("A").attributes(["owner_of"]))
            .mapping(MappingDefinition::new("B").relationship(
                "a",
                RelationshipDefinition::one_to_one("A").reverse("owner_of"),
            ));
        assert!(registry.register_collection(&bad).is_err());
        assert!(registry.collections().next().is_none());
    }

    #[test]
    fn test_duplicate_collection_rejected() {
        let mut registry = Registry::new();
        registry.register_collection(&garage()).unwrap();
        assert!(registry.register_collection(&garage()).is_err());
    }
}
