/// Scenario 3: Positional Edits of To-Many Relationships
///
/// Splices address a position in the related sequence and record a single
/// splice change carrying the length they expected; edits are diffed into
/// one splice.
mod common;

use relgraph_core::errors::GraphError;
use relgraph_core::{ChangeKind, Document, LocalId};
use serde_json::json;

#[tokio::test]
async fn test_scenario_03_happy_splice_into_empty_sequence() {
    // GIVEN a user with no friends
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let x = graph.new_instance("social", "User").unwrap();
    let friends = a.relationship("friends").unwrap();

    // WHEN x is spliced in at the front
    let removed = friends.splice(0, 0, &[x.clone()]).unwrap();

    // THEN nothing was removed and a single splice was recorded
    assert!(removed.is_empty());
    let changes = graph.changes_for(a.local_id());
    assert_eq!(changes.len(), 1);
    assert_eq!(
        changes[0].kind,
        ChangeKind::Splice {
            index: 0,
            expected_len: 0,
            removed: vec![],
            added: vec![json!(x.local_id().to_string())],
        }
    );

    // AND the relationship is resolved with x mirrored
    assert!(!friends.is_fault().unwrap());
    assert_eq!(friends.related().unwrap().into_vec(), vec![x.clone()]);
    assert_eq!(
        x.relationship("friendOf").unwrap().related().unwrap().into_vec(),
        vec![a]
    );
}

#[tokio::test]
async fn test_scenario_03_happy_splice_replaces_middle() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let users: Vec<_> = (0..4)
        .map(|_| graph.new_instance("social", "User").unwrap())
        .collect();
    let friends = a.relationship("friends").unwrap();
    friends.set(users[..3].to_vec()).unwrap();

    // WHEN the middle friend is replaced
    let removed = friends.splice(1, 1, &[users[3].clone()]).unwrap();

    // THEN the removed id is returned and mirrors follow
    assert_eq!(removed, vec![users[1].local_id().clone()]);
    assert_eq!(
        friends.related().unwrap().into_vec(),
        vec![users[0].clone(), users[3].clone(), users[2].clone()]
    );
    assert!(users[1]
        .relationship("friendOf")
        .unwrap()
        .related()
        .unwrap()
        .is_empty());
    friends.check().unwrap();
}

#[tokio::test]
async fn test_scenario_03_error_splice_rejects_already_related() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();
    let friends = a.relationship("friends").unwrap();
    friends.set(vec![b.clone()]).unwrap();
    let before = graph.pending_change_count();

    let err = friends.splice(1, 0, &[b.clone()]).unwrap_err();

    assert!(matches!(err, GraphError::DuplicateRelated { .. }));
    assert_eq!(graph.pending_change_count(), before);
}

#[tokio::test]
async fn test_scenario_03_error_splice_out_of_bounds() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();
    let friends = a.relationship("friends").unwrap();

    let err = friends.splice(1, 0, &[b.clone()]).unwrap_err();
    assert!(matches!(
        err,
        GraphError::SpliceOutOfBounds { index: 1, len: 0, .. }
    ));

    let err = friends.splice(0, 1, &[]).unwrap_err();
    assert!(matches!(err, GraphError::SpliceOutOfBounds { .. }));
}

#[tokio::test]
async fn test_scenario_03_error_splice_on_to_one() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let b = graph.new_instance("social", "User").unwrap();

    let err = a
        .relationship("bestFriend")
        .unwrap()
        .splice(0, 0, &[b])
        .unwrap_err();

    assert!(matches!(err, GraphError::InvalidRelationshipValue { .. }));
}

#[tokio::test]
async fn test_scenario_03_happy_splice_on_fault_keeps_it_faulted() {
    // GIVEN a stored user whose friend list is not resolved
    let (graph, store) = common::new_graph();
    let a_id = LocalId::from("user-a");
    let mut a = Document::empty(a_id.clone(), "social", "User");
    a.fields.insert("friends".into(), json!(["user-b"]));
    store.insert(a);
    let a = graph.load(&a_id).await.unwrap();
    let x = graph.new_instance("social", "User").unwrap();
    let friends = a.relationship("friends").unwrap();
    assert!(friends.is_fault().unwrap());

    // WHEN a resident user is appended
    friends.splice(1, 0, &[x.clone()]).unwrap();

    // THEN the identity grew while the relationship stays faulted
    assert!(friends.is_fault().unwrap());
    assert_eq!(
        friends.identity().unwrap().ids(),
        vec![LocalId::from("user-b"), x.local_id().clone()]
    );
    assert!(matches!(
        friends.related().unwrap_err(),
        GraphError::RelationshipFaulted { .. }
    ));
}

#[tokio::test]
async fn test_scenario_03_happy_edit_records_single_splice() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();
    let users: Vec<_> = (0..3)
        .map(|_| graph.new_instance("social", "User").unwrap())
        .collect();
    let friends = a.relationship("friends").unwrap();
    friends.set(users[..2].to_vec()).unwrap();
    let before = graph.changes_for(a.local_id()).len();

    // WHEN the first friend is dropped and a new one appended in one edit
    let newcomer = users[2].local_id().clone();
    friends
        .edit(|ids| {
            ids.remove(0);
            ids.push(newcomer);
        })
        .unwrap();

    // THEN one splice covers the whole edit
    let changes = graph.changes_for(a.local_id());
    assert_eq!(changes.len(), before + 1);
    assert!(matches!(
        changes[before].kind,
        ChangeKind::Splice { index: 0, expected_len: 2, .. }
    ));
    assert_eq!(
        friends.related().unwrap().into_vec(),
        vec![users[1].clone(), users[2].clone()]
    );
    friends.check().unwrap();
}

#[tokio::test]
async fn test_scenario_03_happy_edit_without_difference_records_nothing() {
    let (graph, _store) = common::new_graph();
    let a = graph.new_instance("social", "User").unwrap();

    a.relationship("friends").unwrap().edit(|_| {}).unwrap();

    assert_eq!(graph.pending_change_count(), 0);
}

#[tokio::test]
async fn test_scenario_03_error_edit_on_fault() {
    let (graph, store) = common::new_graph();
    let a_id = LocalId::from("user-a");
    let mut a = Document::empty(a_id.clone(), "social", "User");
    a.fields.insert("friends".into(), json!(["user-b"]));
    store.insert(a);
    let a = graph.load(&a_id).await.unwrap();

    let err = a
        .relationship("friends")
        .unwrap()
        .edit(|ids| ids.clear())
        .unwrap_err();

    assert!(matches!(err, GraphError::RelationshipFaulted { .. }));
}
