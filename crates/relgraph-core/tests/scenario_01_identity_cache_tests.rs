/// Scenario 1: Identity Cache
///
/// One resident instance per local identity, remote identity and singleton.
mod common;

use relgraph_core::errors::{ErrorClass, GraphError};
use relgraph_core::CacheQuery;
use serde_json::json;

#[tokio::test]
async fn test_scenario_01_happy_same_remote_id_maps_to_same_instance() {
    // GIVEN a graph with User installed
    let (graph, _store) = common::new_graph();

    // WHEN the same remote id is mapped twice
    let first = graph
        .map("social", "User", vec![json!("u1")])
        .await
        .unwrap();
    let second = graph
        .map("social", "User", vec![json!({"id": "u1", "name": "Ada"})])
        .await
        .unwrap();

    // THEN both resolve to one instance
    assert_eq!(first.instances(), second.instances());
    assert_eq!(graph.resident_count(), 1);
    assert_eq!(first.instances()[0].get("name").unwrap(), json!("Ada"));
}

#[tokio::test]
async fn test_scenario_01_happy_lookup_by_local_id() {
    let (graph, _store) = common::new_graph();
    let user = graph.new_instance("social", "User").unwrap();

    let found = graph
        .cache_get(&CacheQuery::local(user.local_id().clone()))
        .expect("resident instance should be cached");

    assert_eq!(found, user);
}

#[tokio::test]
async fn test_scenario_01_error_remote_id_claimed_twice() {
    // GIVEN two users, one holding remote id u1
    let (graph, _store) = common::new_graph();
    let holder = graph.new_instance("social", "User").unwrap();
    holder.set("id", "u1").unwrap();
    let other = graph.new_instance("social", "User").unwrap();

    // WHEN the other user claims u1
    let err = other.set("id", "u1").unwrap_err();

    // THEN it is an identity conflict and the other user is unchanged
    assert!(matches!(err, GraphError::IdentityConflict { .. }));
    assert_eq!(err.class(), ErrorClass::Consistency);
    assert_eq!(other.remote_id().unwrap(), json!(null));
    assert_eq!(
        graph
            .get_by_remote_id("social", "User", &json!("u1"))
            .unwrap(),
        Some(holder)
    );
}

#[tokio::test]
async fn test_scenario_01_happy_changing_remote_id_moves_cache_slot() {
    let (graph, _store) = common::new_graph();
    let user = graph.new_instance("social", "User").unwrap();
    user.set("id", "u1").unwrap();

    user.set("id", "u2").unwrap();

    assert_eq!(
        graph.get_by_remote_id("social", "User", &json!("u1")).unwrap(),
        None
    );
    assert_eq!(
        graph.get_by_remote_id("social", "User", &json!("u2")).unwrap(),
        Some(user)
    );
}

#[tokio::test]
async fn test_scenario_01_happy_singleton_is_shared() {
    // GIVEN the Settings singleton mapping
    let (graph, _store) = common::new_graph();

    // WHEN settings are mapped twice and fetched directly
    let mapped = graph
        .map(
            "garage",
            "Settings",
            vec![json!({"theme": "dark"}), json!({"theme": "light"})],
        )
        .await
        .unwrap();
    let direct = graph.singleton("garage", "Settings").unwrap();

    // THEN all three are the same instance, holding the last write
    let instances = mapped.instances();
    assert_eq!(instances[0], instances[1]);
    assert_eq!(instances[0], direct);
    assert_eq!(direct.get("theme").unwrap(), json!("light"));

    // AND a second instance cannot be constructed
    assert!(matches!(
        graph.new_instance("garage", "Settings"),
        Err(GraphError::IdentityConflict { .. })
    ));
}

#[tokio::test]
async fn test_scenario_01_error_singleton_access_on_regular_mapping() {
    let (graph, _store) = common::new_graph();
    assert!(matches!(
        graph.singleton("social", "User"),
        Err(GraphError::InvalidInput { .. })
    ));
}
