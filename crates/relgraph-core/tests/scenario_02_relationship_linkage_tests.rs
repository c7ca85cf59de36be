/// Scenario 2: Relationship Linkage
///
/// Setting one side of a relationship keeps the other side consistent and
/// records exactly one change per side that changed.
mod common;

use relgraph_core::errors::GraphError;
use relgraph_core::{
    ChangeKind, CollectionDefinition, Document, LocalId, MappingDefinition, RelationshipDefinition,
    RelationshipValue,
};
use serde_json::json;

fn id_value(local_id: &LocalId) -> serde_json::Value {
    json!(local_id.to_string())
}

#[tokio::test]
async fn test_scenario_02_happy_one_to_one_mirrors_and_records_one_change_per_side() {
    // GIVEN two users
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();

    // WHEN a.bestFriend is set to b
    a.relationship("bestFriend").unwrap().set(&b).unwrap();

    // THEN b.bestFriend is a
    let back = b.relationship("bestFriend").unwrap().related().unwrap();
    assert_eq!(back.as_one(), Some(&a));

    // AND each side recorded exactly one Set
    let a_changes = graph.changes_for(a.local_id());
    let b_changes = graph.changes_for(b.local_id());
    assert_eq!(a_changes.len(), 1);
    assert_eq!(b_changes.len(), 1);
    assert_eq!(
        a_changes[0].kind,
        ChangeKind::Set {
            old: json!(null),
            new: id_value(b.local_id())
        }
    );
    assert_eq!(b_changes[0].field, "bestFriend");

    a.relationship("bestFriend").unwrap().check().unwrap();
    b.relationship("bestFriend").unwrap().check().unwrap();
}

#[tokio::test]
async fn test_scenario_02_happy_one_to_one_steal_clears_previous_partner() {
    // GIVEN a and b are best friends
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();
    let c = graph.new_instance("social", "User").unwrap();
    a.relationship("bestFriend").unwrap().set(&b).unwrap();

    // WHEN c claims b
    c.relationship("bestFriend").unwrap().set(&b).unwrap();

    // THEN a is left without a best friend
    let a_best = a.relationship("bestFriend").unwrap();
    assert_eq!(a_best.related().unwrap().as_one(), None);
    let last = graph.changes_for(a.local_id()).pop().unwrap();
    assert_eq!(
        last.kind,
        ChangeKind::Set {
            old: id_value(b.local_id()),
            new: json!(null)
        }
    );

    // AND b and c point at each other
    assert_eq!(
        b.relationship("bestFriend").unwrap().related().unwrap().as_one(),
        Some(&c)
    );
}

#[tokio::test]
async fn test_scenario_02_happy_one_to_many_reassignment() {
    // GIVEN a car owned by p1
    let (graph, _store) = common::new_graph();
    let p1 = graph.new_instance("garage", "Person").unwrap();
    let p2 = graph.new_instance("garage", "Person").unwrap();
    let car = graph.new_instance("garage", "Car").unwrap();
    car.relationship("owner").unwrap().set(&p1).unwrap();
    assert_eq!(
        p1.relationship("cars").unwrap().related().unwrap().into_vec(),
        vec![car.clone()]
    );

    // WHEN ownership moves to p2 from the many side
    p2.relationship("cars")
        .unwrap()
        .set(vec![car.clone()])
        .unwrap();

    // THEN the car's owner is p2 and p1 no longer lists it
    assert_eq!(
        car.relationship("owner").unwrap().related().unwrap().as_one(),
        Some(&p2)
    );
    assert!(p1.relationship("cars").unwrap().related().unwrap().is_empty());

    // AND p1 recorded a splice removing the car
    let last = graph.changes_for(p1.local_id()).pop().unwrap();
    assert_eq!(
        last.kind,
        ChangeKind::Splice {
            index: 0,
            expected_len: 1,
            removed: vec![id_value(car.local_id())],
            added: vec![],
        }
    );
}

#[tokio::test]
async fn test_scenario_02_happy_many_to_many_set_diffs_membership() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();
    let c = graph.new_instance("social", "User").unwrap();
    let friends = a.relationship("friends").unwrap();
    friends.set(vec![b.clone(), c.clone()]).unwrap();

    // WHEN b is dropped from the list
    friends.set(vec![c.clone()]).unwrap();

    // THEN only b's reverse side lost a
    assert!(b.relationship("friendOf").unwrap().related().unwrap().is_empty());
    assert_eq!(
        c.relationship("friendOf").unwrap().related().unwrap().into_vec(),
        vec![a.clone()]
    );
    // c was untouched by the second set
    assert_eq!(graph.changes_for(c.local_id()).len(), 1);
    friends.check().unwrap();
}

#[tokio::test]
async fn test_scenario_02_happy_setting_same_value_records_nothing() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();
    let best = a.relationship("bestFriend").unwrap();
    best.set(&b).unwrap();
    let before = graph.pending_change_count();

    best.set(&b).unwrap();

    assert_eq!(graph.pending_change_count(), before);
}

#[tokio::test]
async fn test_scenario_02_error_wrong_shape_rejected_without_side_effects() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();

    let err = a
        .relationship("bestFriend")
        .unwrap()
        .set(vec![b.clone()])
        .unwrap_err();
    assert!(matches!(err, GraphError::InvalidRelationshipValue { .. }));

    let err = a.relationship("friends").unwrap().set(&b).unwrap_err();
    assert!(matches!(err, GraphError::InvalidRelationshipValue { .. }));

    assert_eq!(graph.pending_change_count(), 0);
}

#[tokio::test]
async fn test_scenario_02_error_wrong_target_mapping() {
    let (graph, _store) = common::new_graph();
    let car = graph.new_instance("garage", "Car").unwrap();
    let other_car = graph.new_instance("garage", "Car").unwrap();

    let err = car
        .relationship("owner")
        .unwrap()
        .set(&other_car)
        .unwrap_err();

    assert!(matches!(err, GraphError::WrongTargetMapping { .. }));
}

#[tokio::test]
async fn test_scenario_02_error_duplicate_in_sequence() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();

    let err = a
        .relationship("friends")
        .unwrap()
        .set(RelationshipValue::Many(vec![
            b.local_id().clone(),
            b.local_id().clone(),
        ]))
        .unwrap_err();

    assert!(matches!(err, GraphError::DuplicateRelated { .. }));
}

#[tokio::test]
async fn test_scenario_02_happy_non_resident_reverse_recorded_in_ledger() {
    // GIVEN a stored person p owning stored car c, with only c resident
    let (graph, store) = common::new_graph();
    let p = LocalId::from("person-1");
    let c = LocalId::from("car-1");
    let mut person = Document::empty(p.clone(), "garage", "Person");
    person.fields.insert("cars".into(), json!([c.to_string()]));
    let mut car = Document::empty(c.clone(), "garage", "Car");
    car.fields.insert("owner".into(), json!(p.to_string()));
    store.insert(person);
    store.insert(car);
    let car = graph.load(&c).await.unwrap();

    // WHEN the car's owner is cleared without resolving the fault
    let owner = car.relationship("owner").unwrap();
    assert!(owner.is_fault().unwrap());
    owner.set(RelationshipValue::None).unwrap();

    // THEN the person's side is recorded as a Remove in the ledger
    assert!(graph.instance(&p).is_none());
    let person_changes = graph.changes_for(&p);
    assert_eq!(person_changes.len(), 1);
    assert_eq!(
        person_changes[0].kind,
        ChangeKind::Remove {
            removed: vec![json!(c.to_string())]
        }
    );

    // AND merging applies it to the stored person
    graph.merge_changes().await.unwrap();
    assert_eq!(store.document(&p).unwrap().get("cars"), Some(&json!([])));
    assert_eq!(store.document(&c).unwrap().get("owner"), Some(&json!(null)));
}

#[tokio::test]
async fn test_scenario_02_happy_subscribers_see_registered_changes() {
    let (graph, _store) = common::new_graph();
    let mut users = graph.subscribe(relgraph_core::Topic::mapping("social", "User"));
    let mut cars = graph.subscribe(relgraph_core::Topic::mapping("garage", "Car"));
    let user = graph.new_instance("social", "User").unwrap();

    user.set("name", "Ada").unwrap();

    let change = users.try_recv().unwrap();
    assert_eq!(change.local_id, *user.local_id());
    assert_eq!(change.field, "name");
    assert!(cars.try_recv().is_err());
}

#[tokio::test]
async fn test_scenario_02_happy_later_collection_extends_resident_instances() {
    // GIVEN a resident car
    let (graph, _store) = common::new_graph();
    let car = graph.new_instance("garage", "Car").unwrap();

    // WHEN a collection relating to cars is registered afterwards
    graph
        .register_collection(&CollectionDefinition::new("fleet").mapping(
            MappingDefinition::new("Depot").relationship(
                "vehicles",
                RelationshipDefinition::many_to_many("garage.Car").reverse("depots"),
            ),
        ))
        .unwrap();
    let depot = graph.new_instance("fleet", "Depot").unwrap();
    depot
        .relationship("vehicles")
        .unwrap()
        .set(vec![car.clone()])
        .unwrap();

    // THEN the existing car gained the reverse side and it is linked
    let depots = car.relationship("depots").unwrap();
    assert_eq!(depots.get().await.unwrap().into_vec(), vec![depot.clone()]);
    depots.check().unwrap();
    let document = car.to_document().unwrap();
    assert_eq!(document.fields["depots"], json!([depot.local_id().to_string()]));
}
