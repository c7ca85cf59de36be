use std::sync::Arc;

use relgraph_core::{
    CollectionDefinition, Graph, GraphConfig, MappingDefinition, MemoryDocumentStore,
    RelationshipDefinition,
};

/// Users with a symmetric best friend and a many-to-many friend list
#[allow(dead_code)]
pub fn social() -> CollectionDefinition {
    CollectionDefinition::new("social").mapping(
        MappingDefinition::new("User")
            .attributes(["name"])
            .relationship(
                "bestFriend",
                RelationshipDefinition::one_to_one("User").reverse("bestFriend"),
            )
            .relationship(
                "friends",
                RelationshipDefinition::many_to_many("User").reverse("friendOf"),
            ),
    )
}

/// People owning cars, plus a singleton settings mapping
#[allow(dead_code)]
pub fn garage() -> CollectionDefinition {
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
        .mapping(
            MappingDefinition::new("Settings")
                .attributes(["theme"])
                .singleton(),
        )
}

/// A graph over a fresh memory store with both test collections installed
#[allow(dead_code)]
pub fn new_graph() -> (Graph, Arc<MemoryDocumentStore>) {
    graph_over(Arc::new(MemoryDocumentStore::new()), GraphConfig::default())
}

#[allow(dead_code)]
pub fn graph_over(store: Arc<MemoryDocumentStore>, config: GraphConfig) -> (Graph, Arc<MemoryDocumentStore>) {
    let graph = Graph::with_config(store.clone(), config);
    graph
        .register_collection(&social())
        .expect("social collection should install");
    graph
        .register_collection(&garage())
        .expect("garage collection should install");
    (graph, store)
}
