use std::sync::Arc;

use tempfile::TempDir;
use tokio::time::{timeout, Duration};
use waypoint_bus::{EventBus, Topic};
use waypoint_revision::{LockPolicy, RevisionConfig, RevisionEngine, RevisionError};
use waypoint_schema::{
    Actor, AgentKind, BusMessage, ChangeOperation, ChangeScope, ChangeSet, Day, Itinerary,
    ItineraryDraft, Node, NodeKind, NodePatch,
};

fn engine_with(policy: LockPolicy) -> (RevisionEngine, Arc<EventBus>) {
    let bus = Arc::new(EventBus::default());
    let engine = RevisionEngine::in_memory(
        RevisionConfig {
            lock_policy: policy,
        },
        bus.clone(),
    )
    .unwrap();
    (engine, bus)
}

fn draft(ids: &[&str]) -> ItineraryDraft {
    let mut day = Day::new(1);
    day.nodes = ids
        .iter()
        .map(|id| Node::new(*id, NodeKind::Attraction, format!("Visit {id}")))
        .collect();
    ItineraryDraft {
        id: Some("trip-1".into()),
        title: "Lisbon long weekend".into(),
        days: vec![day],
        ..ItineraryDraft::default()
    }
}

fn user_edit(op: ChangeOperation) -> ChangeSet {
    ChangeSet::new(ChangeScope::Trip, Actor::user("u1")).with_op(op)
}

fn delete(id: &str) -> ChangeOperation {
    ChangeOperation::Delete {
        node_id: id.to_string(),
    }
}

fn node_ids(doc: &Itinerary) -> Vec<String> {
    doc.days[0].node_ids()
}

/// Fresh document (v1) brought to v3 by two title edits.
async fn at_version_3(engine: &RevisionEngine) -> Itinerary {
    engine.create_itinerary(draft(&["A", "B", "C"])).await.unwrap();
    for title in ["Morning", "Afternoon"] {
        engine
            .apply_change_set(
                "trip-1",
                user_edit(ChangeOperation::Update {
                    node_id: "A".into(),
                    patch: NodePatch {
                        title: Some(title.into()),
                        ..NodePatch::default()
                    },
                }),
            )
            .await
            .unwrap();
    }
    let doc = engine.get("trip-1").await.unwrap();
    assert_eq!(doc.version, 3);
    doc
}

#[tokio::test]
async fn delete_then_stale_conflict() {
    let (engine, bus) = engine_with(LockPolicy::default());
    let mut patches = bus.subscribe(Topic::ItineraryPatched).await;
    at_version_3(&engine).await;
    // Drain the two setup patches.
    for _ in 0..2 {
        patches.recv().await.unwrap();
    }

    let outcome = engine
        .apply_change_set("trip-1", user_edit(delete("B")).based_on(3))
        .await
        .unwrap();
    assert_eq!(outcome.from_version, 3);
    assert_eq!(outcome.to_version, 4);
    assert_eq!(outcome.diff.removed_ids(), vec!["B"]);
    assert!(outcome.diff.added.is_empty());
    assert!(outcome.diff.updated.is_empty());

    let doc = engine.get("trip-1").await.unwrap();
    assert_eq!(node_ids(&doc), vec!["A", "C"]);

    let err = engine
        .apply_change_set("trip-1", user_edit(delete("C")).based_on(3))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RevisionError::VersionConflict {
            expected: 3,
            current: 4
        }
    ));
    assert_eq!(err.current_version(), Some(4));

    let unchanged = engine.get("trip-1").await.unwrap();
    assert_eq!(unchanged.version, 4);
    assert_eq!(node_ids(&unchanged), vec!["A", "C"]);

    let msg = timeout(Duration::from_millis(100), patches.recv())
        .await
        .unwrap()
        .unwrap();
    match msg {
        BusMessage::ItineraryPatched { event } => {
            assert_eq!(event.itinerary_id, "trip-1");
            assert_eq!((event.from_version, event.to_version), (3, 4));
            assert_eq!(event.diff.removed_ids(), vec!["B"]);
            assert_eq!(event.updated_by, Actor::user("u1"));
        }
        other => panic!("unexpected message {other:?}"),
    }
    // The rejected change set emitted nothing.
    assert!(timeout(Duration::from_millis(50), patches.recv()).await.is_err());
}

#[tokio::test]
async fn failed_operation_rolls_back_everything() {
    let (engine, _bus) = engine_with(LockPolicy::default());
    engine.create_itinerary(draft(&["A", "B", "C"])).await.unwrap();

    let err = engine
        .apply_change_set(
            "trip-1",
            ChangeSet::new(ChangeScope::Trip, Actor::user("u1"))
                .with_op(delete("A"))
                .with_op(ChangeOperation::Reorder {
                    day: Some(1),
                    node_ids: vec!["C".into()],
                }),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RevisionError::InvalidOperation {
            index: Some(1),
            current_version: 1,
            ..
        }
    ));

    let doc = engine.get("trip-1").await.unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(node_ids(&doc), vec!["A", "B", "C"]);
    assert!(doc.revisions.is_empty());
}

#[tokio::test]
async fn agent_edits_skip_locked_nodes() {
    let (engine, _bus) = engine_with(LockPolicy::RejectOperation);
    let mut d = draft(&["A", "B", "C"]);
    d.days[0].nodes[0].locked = true;
    engine.create_itinerary(d).await.unwrap();

    let agent = Actor::Agent {
        kind: AgentKind::Planner,
        task_id: None,
    };
    let outcome = engine
        .apply_change_set(
            "trip-1",
            ChangeSet::new(ChangeScope::Trip, agent.clone())
                .with_op(delete("A"))
                .with_op(delete("B")),
        )
        .await
        .unwrap();
    assert_eq!(outcome.to_version, 2);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].node_id, "A");
    assert_eq!(outcome.diff.removed_ids(), vec!["B"]);

    let err = engine
        .apply_change_set(
            "trip-1",
            ChangeSet::new(ChangeScope::Trip, agent).with_op(delete("A")),
        )
        .await
        .unwrap_err();
    match err {
        RevisionError::LockedElementRejected {
            rejected,
            current_version,
        } => {
            assert_eq!(rejected.len(), 1);
            assert_eq!(current_version, 2);
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(engine.get("trip-1").await.unwrap().version, 2);
}

#[tokio::test]
async fn whole_change_set_policy_rejects_partial_lock_hits() {
    let (engine, _bus) = engine_with(LockPolicy::RejectChangeSet);
    let mut d = draft(&["A", "B"]);
    d.days[0].nodes[0].locked = true;
    engine.create_itinerary(d).await.unwrap();

    let err = engine
        .apply_change_set(
            "trip-1",
            ChangeSet::new(ChangeScope::Trip, Actor::agent(AgentKind::Editor))
                .with_op(delete("A"))
                .with_op(delete("B")),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RevisionError::LockedElementRejected { .. }));
    assert_eq!(node_ids(&engine.get("trip-1").await.unwrap()), vec!["A", "B"]);
}

#[tokio::test]
async fn undo_restores_nodes_as_a_new_version() {
    let (engine, _bus) = engine_with(LockPolicy::default());
    let before = at_version_3(&engine).await;

    let deleted = engine
        .apply_change_set("trip-1", user_edit(delete("B")).based_on(3))
        .await
        .unwrap();
    let undone = engine
        .undo("trip-1", deleted.revision_id, Actor::user("u1"))
        .await
        .unwrap();

    assert_eq!(undone.from_version, 4);
    assert_eq!(undone.to_version, 5);
    assert_eq!(undone.diff.added_ids(), vec!["B"]);

    let doc = engine.get("trip-1").await.unwrap();
    assert_eq!(doc.days, before.days);
    assert_eq!(doc.revisions.len(), 4);
    assert_eq!(doc.revisions[3].undo_of, Some(deleted.revision_id));
    // History is append-only: the undone revision is still there.
    assert_eq!(doc.revisions[2].revision_id, deleted.revision_id);
}

#[tokio::test]
async fn idempotency_key_replays_outcome() {
    let (engine, _bus) = engine_with(LockPolicy::default());
    engine.create_itinerary(draft(&["A", "B"])).await.unwrap();

    let edit = user_edit(delete("B")).with_idempotency_key("task-7:0");
    let first = engine.apply_change_set("trip-1", edit.clone()).await.unwrap();
    let second = engine.apply_change_set("trip-1", edit).await.unwrap();

    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(first.revision_id, second.revision_id);
    assert_eq!(second.to_version, 2);
    assert_eq!(engine.get("trip-1").await.unwrap().version, 2);
}

#[tokio::test]
async fn concurrent_same_base_only_one_wins() {
    let (engine, _bus) = engine_with(LockPolicy::default());
    let engine = Arc::new(engine);
    engine
        .create_itinerary(draft(&["A", "B", "C", "D"]))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for id in ["A", "B", "C", "D"] {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .apply_change_set("trip-1", user_edit(delete(id)).based_on(1))
                .await
        }));
    }

    let mut wins = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(outcome) => {
                assert_eq!(outcome.to_version, 2);
                wins += 1;
            }
            Err(RevisionError::VersionConflict { .. }) => conflicts += 1,
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!((wins, conflicts), (1, 3));
    assert_eq!(engine.get("trip-1").await.unwrap().node_count(), 3);
}

#[tokio::test]
async fn documents_survive_reopen() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("itineraries.db");
    {
        let engine = RevisionEngine::open(
            &path,
            RevisionConfig::default(),
            Arc::new(EventBus::default()),
        )
        .unwrap();
        engine.create_itinerary(draft(&["A", "B"])).await.unwrap();
        engine
            .apply_change_set("trip-1", user_edit(delete("A")))
            .await
            .unwrap();
    }

    let engine = RevisionEngine::open(
        &path,
        RevisionConfig::default(),
        Arc::new(EventBus::default()),
    )
    .unwrap();
    let doc = engine.get("trip-1").await.unwrap();
    assert_eq!(doc.version, 2);
    assert_eq!(node_ids(&doc), vec!["B"]);
    assert_eq!(engine.history("trip-1").await.unwrap().len(), 1);
}
