// Integration tests for the object graph over SQLite
// A graph merges into the database and a later graph reads it back

use std::sync::Arc;

use relgraph_core::{
    CollectionDefinition, Graph, MappingDefinition, RelationshipDefinition,
};
use relgraph_store::SqliteDocumentStore;
use serde_json::{json, Map};

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

fn graph_over(store: Arc<SqliteDocumentStore>) -> Graph {
    let graph = Graph::new(store);
    graph.register_collection(&garage()).unwrap();
    graph
}

#[tokio::test]
async fn test_mapped_graph_round_trips_through_sqlite() {
    // Given: Cars and their owner mapped into a graph over a database file
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("graph.db");
    let store = Arc::new(SqliteDocumentStore::open(&path).unwrap());
    let graph = graph_over(store.clone());
    let result = graph
        .map(
            "garage",
            "Car",
            vec![
                json!({"id": "c1", "colour": "red", "owner": {"id": "p1", "name": "Ann"}}),
                json!({"id": "c2", "colour": "blue", "owner": "p1"}),
            ],
        )
        .await
        .unwrap();
    assert!(result.is_ok());
    let car_id = result.objects[0].as_ref().unwrap().local_id().clone();

    // When: The ledger is merged
    let report = graph.merge_changes().await.unwrap();

    // Then: Every document was written
    assert_eq!(report.document_count(), 3);
    assert_eq!(store.count().unwrap(), 3);

    // And: A fresh graph reads the owner back through the car
    let reopened = graph_over(Arc::new(SqliteDocumentStore::open(&path).unwrap()));
    let car = reopened.load(&car_id).await.unwrap();
    assert_eq!(car.get("colour").unwrap(), json!("red"));
    let owner = car
        .relationship("owner")
        .unwrap()
        .get()
        .await
        .unwrap()
        .as_one()
        .cloned()
        .unwrap();
    assert_eq!(owner.get("name").unwrap(), json!("Ann"));
    let cars = owner.relationship("cars").unwrap().get().await.unwrap();
    assert_eq!(cars.len(), 2);

    // And: The owner is found by field query
    let mut filter = Map::new();
    filter.insert("name".into(), json!("Ann"));
    let people = store.query("garage", Some("Person"), &filter).unwrap();
    assert_eq!(people.len(), 1);
    assert_eq!(&people[0].id, owner.local_id());
}
