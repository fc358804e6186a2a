mod common;

use chrono::{TimeZone, Utc};
use common::*;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use stepwise::runtime::{ChannelNotifier, Notification, TracingNotifier, WorkflowHistory};
use stepwise::workflow::{UpdateSettings, WorkflowLocks};
use stepwise::{CreateOutcome, Error, IntegrityFault, NoOpReason, Rejection};

fn values(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("not an object: {}", other),
    }
}

/// Three live steps that all carry the same stale marker
async fn uniformly_stale(history: &WorkflowHistory) -> (i64, i64, Vec<i64>, i64) {
    let (workflow_id, tab_id, ids) = seeded(history, &["pastecsv", "filter", "sort"]).await;
    let touch = applied(
        history
            .change_parameters(workflow_id, ids[0], values(json!({"csv": "a,b"})))
            .await
            .unwrap(),
    );
    for id in &ids {
        assert_eq!(marker_of(history, *id).await, Some(touch.id));
    }
    (workflow_id, tab_id, ids, touch.id)
}

#[tokio::test]
async fn insert_marks_downstream_stale_and_undo_restores() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids, v1) = uniformly_stale(&history).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let add = applied(
        history
            .add_step(workflow_id, tab_id, "loadurl", 1, json!({"url": ""}))
            .await
            .unwrap(),
    );
    let d = add.kind.step_id().unwrap();
    assert_eq!(add.describe(), format!("Add step {} (loadurl) at 1", d));

    let steps = live_steps(&history, tab_id).await;
    assert_eq!(steps.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a, d, b, c]);
    assert_eq!(steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
    assert_eq!(marker_of(&history, a).await, Some(v1));
    for id in [d, b, c] {
        assert_eq!(marker_of(&history, id).await, Some(add.id));
    }

    let undone = history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(undone.id, add.id);

    let steps = live_steps(&history, tab_id).await;
    assert_eq!(steps.iter().map(|s| s.id).collect::<Vec<_>>(), vec![a, b, c]);
    assert_eq!(steps.iter().map(|s| s.order).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(steps.iter().all(|s| s.stale_marker == Some(v1)));
    assert!(history.storage().get_step(d).await.unwrap().unwrap().is_deleted);
}

#[tokio::test]
async fn deleting_the_selected_step_selects_its_predecessor() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids, v1) = uniformly_stale(&history).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    assert_eq!(history.select_step(workflow_id, tab_id, Some(1)).await.unwrap(), Some(1));

    let steps_before = history.storage().all_steps(tab_id).await.unwrap();
    let tab_before = history.storage().get_tab(tab_id).await.unwrap();

    let delete = applied(history.delete_step(workflow_id, b).await.unwrap());

    let steps = live_steps(&history, tab_id).await;
    assert_eq!(steps.iter().map(|s| (s.id, s.order)).collect::<Vec<_>>(), vec![(a, 0), (c, 1)]);
    assert_eq!(marker_of(&history, a).await, Some(v1));
    assert_eq!(marker_of(&history, c).await, Some(delete.id));
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(0));

    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(history.storage().all_steps(tab_id).await.unwrap(), steps_before);
    assert_eq!(history.storage().get_tab(tab_id).await.unwrap(), tab_before);
}

#[tokio::test]
async fn reorder_undo_redo_round_trips() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids, _) = uniformly_stale(&history).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);
    let before = history.storage().all_steps(tab_id).await.unwrap();

    let reorder = applied(history.reorder_steps(workflow_id, tab_id, vec![a, c, b]).await.unwrap());
    let after = history.storage().all_steps(tab_id).await.unwrap();
    assert_eq!(live_ids(&history, tab_id).await, vec![a, c, b]);
    assert_ne!(marker_of(&history, a).await, Some(reorder.id));
    assert_eq!(marker_of(&history, c).await, Some(reorder.id));
    assert_eq!(marker_of(&history, b).await, Some(reorder.id));

    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(history.storage().all_steps(tab_id).await.unwrap(), before);

    let redone = history.redo(workflow_id).await.unwrap().unwrap();
    assert_eq!(redone.id, reorder.id);
    assert_eq!(history.storage().all_steps(tab_id).await.unwrap(), after);
}

#[tokio::test]
async fn invalid_reorders_change_nothing() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b", "c"]).await;
    let (a, b, c) = (ids[0], ids[1], ids[2]);

    let other_tab = history.storage().create_tab(workflow_id, "Tab 2").await.unwrap();
    let foreign = applied(
        history
            .add_step(workflow_id, other_tab.id, "pastecsv", 0, json!({}))
            .await
            .unwrap(),
    )
    .kind
    .step_id()
    .unwrap();

    let commands_before = history.list_commands(workflow_id).await.unwrap();
    let steps_before = history.storage().all_steps(tab_id).await.unwrap();

    let attempts = [
        (vec![a, b], CreateOutcome::Rejected(Rejection::StepSetMismatch)),
        (vec![a, b, foreign], CreateOutcome::Rejected(Rejection::StepSetMismatch)),
        (vec![a, b, c, foreign], CreateOutcome::Rejected(Rejection::StepSetMismatch)),
        (vec![a, b, b], CreateOutcome::Rejected(Rejection::DuplicateStep { step_id: b })),
        (vec![a, b, c], CreateOutcome::NoOp(NoOpReason::OrderUnchanged)),
    ];
    for (step_ids, expected) in attempts {
        let outcome = history.reorder_steps(workflow_id, tab_id, step_ids).await.unwrap();
        assert_eq!(outcome, expected);
    }

    assert_eq!(
        history.reorder_steps(workflow_id, 9999, vec![a]).await.unwrap(),
        CreateOutcome::Rejected(Rejection::UnknownTab { tab_id: 9999 })
    );

    assert_eq!(history.list_commands(workflow_id).await.unwrap(), commands_before);
    assert_eq!(history.storage().all_steps(tab_id).await.unwrap(), steps_before);
}

#[tokio::test]
async fn new_command_discards_redo_branch_and_its_steps() {
    let history = memory_history().await;
    let (workflow_id, _, ids) = seeded(&history, &["a", "b"]).await;
    let (a, b) = (ids[0], ids[1]);

    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(redo_chain_len(&history, workflow_id).await, 1);

    applied(
        history
            .change_notes(workflow_id, a, Some("first".to_string()))
            .await
            .unwrap(),
    );

    assert_eq!(redo_chain_len(&history, workflow_id).await, 0);
    assert!(history.redo(workflow_id).await.unwrap().is_none());
    assert!(history.storage().get_step(b).await.unwrap().is_none());

    // init, add a, change notes
    assert_eq!(history.list_commands(workflow_id).await.unwrap().len(), 3);
    assert!(history.audit(workflow_id).await.unwrap().is_healthy());
}

#[tokio::test]
async fn discarded_branch_is_destroyed_newest_first() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a"]).await;
    let a = ids[0];

    let added = applied(history.add_step(workflow_id, tab_id, "b", 1, json!({})).await.unwrap());
    let b = added.kind.step_id().unwrap();
    applied(history.delete_step(workflow_id, b).await.unwrap());

    history.undo(workflow_id).await.unwrap().unwrap();
    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(redo_chain_len(&history, workflow_id).await, 2);

    // The DeleteStep that references b must go before the AddStep that created it
    applied(history.change_notes(workflow_id, a, None).await.unwrap());

    assert_eq!(redo_chain_len(&history, workflow_id).await, 0);
    assert!(history.storage().get_step(b).await.unwrap().is_none());
    assert_eq!(live_ids(&history, tab_id).await, vec![a]);
}

#[tokio::test]
async fn undo_and_redo_stop_at_the_ends() {
    let history = memory_history().await;
    let workflow = history.init_workflow("empty").await.unwrap();
    assert!(history.undo(workflow.id).await.unwrap().is_none());
    assert!(history.redo(workflow.id).await.unwrap().is_none());

    let (workflow_id, tab_id, ids) = seeded(&history, &["a"]).await;
    assert!(history.undo(workflow_id).await.unwrap().is_some());
    assert!(history.undo(workflow_id).await.unwrap().is_none());
    assert!(live_ids(&history, tab_id).await.is_empty());

    assert!(history.redo(workflow_id).await.unwrap().is_some());
    assert!(history.redo(workflow_id).await.unwrap().is_none());
    assert_eq!(live_ids(&history, tab_id).await, ids);
}

#[tokio::test]
async fn concurrent_deletes_apply_once() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b"]).await;

    let (first, second) = tokio::join!(
        history.delete_step(workflow_id, ids[1]),
        history.delete_step(workflow_id, ids[1])
    );
    let outcomes = [first.unwrap(), second.unwrap()];

    assert_eq!(outcomes.iter().filter(|o| o.command().is_some()).count(), 1);
    assert!(outcomes
        .iter()
        .any(|o| *o == CreateOutcome::NoOp(NoOpReason::StepAlreadyDeleted)));
    assert_eq!(live_ids(&history, tab_id).await, vec![ids[0]]);
    assert!(history.audit(workflow_id).await.unwrap().is_healthy());
}

#[tokio::test]
async fn value_commands_are_reversible() {
    let history = memory_history().await;
    let (workflow_id, _, ids) = seeded(&history, &["loadurl", "filter"]).await;
    let (a, b) = (ids[0], ids[1]);

    applied(
        history
            .change_parameters(workflow_id, a, values(json!({"url": "http://example.org"})))
            .await
            .unwrap(),
    );
    let merge = applied(
        history
            .change_parameters(workflow_id, a, values(json!({"has_header": true})))
            .await
            .unwrap(),
    );
    let step = history.storage().get_step(a).await.unwrap().unwrap();
    assert_eq!(step.params, json!({"url": "http://example.org", "has_header": true}));
    assert_eq!(marker_of(&history, b).await, Some(merge.id));
    history.undo(workflow_id).await.unwrap().unwrap();
    let step = history.storage().get_step(a).await.unwrap().unwrap();
    assert_eq!(step.params, json!({"url": "http://example.org"}));

    let a_marker = marker_of(&history, a).await;
    let b_marker = marker_of(&history, b).await;
    let notes = applied(history.change_notes(workflow_id, b, Some("check".into())).await.unwrap());
    assert_eq!(marker_of(&history, a).await, a_marker);
    assert_eq!(marker_of(&history, b).await, Some(notes.id));
    history.undo(workflow_id).await.unwrap().unwrap();
    let step = history.storage().get_step(b).await.unwrap().unwrap();
    assert_eq!(step.notes, None);
    assert_eq!(step.stale_marker, b_marker);

    let settings = UpdateSettings {
        auto_update_data: true,
        next_update: None,
        update_interval: 600,
    };
    let update = applied(history.change_update_settings(workflow_id, a, settings.clone()).await.unwrap());
    assert_eq!(update.describe(), format!("Update step {} automatically every 600s", a));
    assert_eq!(history.storage().get_step(a).await.unwrap().unwrap().update_settings, settings);
    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(
        history.storage().get_step(a).await.unwrap().unwrap().update_settings,
        UpdateSettings::default()
    );

    let version = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
    applied(history.change_data_version(workflow_id, a, version).await.unwrap());
    assert_eq!(history.storage().get_step(a).await.unwrap().unwrap().stored_data_version, Some(version));
    history.undo(workflow_id).await.unwrap().unwrap();
    assert_eq!(history.storage().get_step(a).await.unwrap().unwrap().stored_data_version, None);
}

#[tokio::test]
async fn edits_to_missing_steps_are_not_applied() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b"]).await;
    applied(history.delete_step(workflow_id, ids[1]).await.unwrap());

    assert_eq!(
        history.change_notes(workflow_id, ids[1], Some("late".into())).await.unwrap(),
        CreateOutcome::NoOp(NoOpReason::StepAlreadyDeleted)
    );
    assert_eq!(
        history.delete_step(workflow_id, 9999).await.unwrap(),
        CreateOutcome::Rejected(Rejection::UnknownStep { step_id: 9999 })
    );

    let steps_before = history.storage().all_steps(tab_id).await.unwrap();
    assert_eq!(
        history.add_step(workflow_id, tab_id, "x", 5, json!({})).await.unwrap(),
        CreateOutcome::Rejected(Rejection::PositionOutOfRange { position: 5, live_count: 1 })
    );
    assert_eq!(history.storage().all_steps(tab_id).await.unwrap(), steps_before);
}

#[tokio::test]
async fn data_version_renders_lazily_unless_someone_is_notified() {
    let notifier = Arc::new(ChannelNotifier::new(64));
    let history = memory_history_with(notifier.clone()).await;
    let (workflow_id, _, ids) = seeded(&history, &["loadurl"]).await;
    let mut rx = notifier.subscribe();

    let first = applied(
        history
            .change_data_version(workflow_id, ids[0], Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap())
            .await
            .unwrap(),
    );
    match rx.try_recv().unwrap() {
        Notification::Listeners { payload, .. } => {
            assert_eq!(payload["type"], "apply_delta");
            assert_eq!(payload["direction"], "forward");
            assert_eq!(payload["command_id"], first.id);
        }
        other => panic!("unexpected {:?}", other),
    }
    match rx.try_recv().unwrap() {
        Notification::Listeners { payload, .. } => assert_eq!(payload["type"], "queue_render_if_listening"),
        other => panic!("unexpected {:?}", other),
    }
    assert!(rx.try_recv().is_err());

    history.set_step_notifications(workflow_id, ids[0], true).await.unwrap();
    let second = applied(
        history
            .change_data_version(workflow_id, ids[0], Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap())
            .await
            .unwrap(),
    );
    assert!(matches!(rx.try_recv().unwrap(), Notification::Listeners { .. }));
    assert_eq!(
        rx.try_recv().unwrap(),
        Notification::Render { workflow_id, command_id: second.id }
    );

    history.undo(workflow_id).await.unwrap().unwrap();
    match rx.try_recv().unwrap() {
        Notification::Listeners { payload, .. } => assert_eq!(payload["direction"], "backward"),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        rx.try_recv().unwrap(),
        Notification::Render { workflow_id, command_id: first.id }
    );
}

#[tokio::test]
async fn stalled_lock_holder_is_fatal() {
    let history = memory_history().await;
    let (workflow_id, _, _) = seeded(&history, &["a"]).await;

    let locks = Arc::new(WorkflowLocks::new(Duration::from_millis(20)));
    let impatient = WorkflowHistory::new(history.storage().clone(), locks.clone(), Arc::new(TracingNotifier));
    let _held = locks.acquire(workflow_id).await.unwrap();

    let err = impatient.undo(workflow_id).await.unwrap_err();
    assert!(matches!(err, Error::LockTimeout { .. }));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn missing_current_command_is_an_integrity_fault() {
    let history = memory_history().await;
    let (workflow_id, _, _) = seeded(&history, &["a"]).await;

    sqlx::query("UPDATE workflows SET current_command_id = NULL WHERE id = ?")
        .bind(workflow_id)
        .execute(history.storage().pool())
        .await
        .unwrap();

    let err = history.undo(workflow_id).await.unwrap_err();
    assert!(matches!(err, Error::Integrity(IntegrityFault::MissingRoot { .. })));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn add_step_redo_restores_steps_and_selection() {
    let history = memory_history().await;
    let (workflow_id, tab_id, _) = seeded(&history, &["a", "b", "c"]).await;

    applied(history.add_step(workflow_id, tab_id, "d", 3, json!({})).await.unwrap());
    assert_eq!(history.select_step(workflow_id, tab_id, Some(3)).await.unwrap(), Some(3));
    let applied_state = tab_state(&history, tab_id).await;

    history.undo(workflow_id).await.unwrap().unwrap();
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(2));

    history.redo(workflow_id).await.unwrap().unwrap();
    assert_eq!(tab_state(&history, tab_id).await, applied_state);
}

#[tokio::test]
async fn delete_step_redo_restores_steps_and_selection() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b", "c"]).await;
    history.select_step(workflow_id, tab_id, Some(2)).await.unwrap();

    applied(history.delete_step(workflow_id, ids[1]).await.unwrap());
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(1));
    history.select_step(workflow_id, tab_id, Some(0)).await.unwrap();
    let applied_state = tab_state(&history, tab_id).await;

    history.undo(workflow_id).await.unwrap().unwrap();
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(2));

    history.redo(workflow_id).await.unwrap().unwrap();
    assert_eq!(tab_state(&history, tab_id).await, applied_state);
}

#[tokio::test]
async fn value_command_redo_restores_exact_state() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["loadurl", "filter"]).await;
    let (a, b) = (ids[0], ids[1]);

    applied(
        history
            .change_data_version(workflow_id, a, Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap())
            .await
            .unwrap(),
    );
    assert_redo_restores(&history, workflow_id, tab_id).await;

    applied(
        history
            .change_parameters(workflow_id, a, values(json!({"url": "http://example.org"})))
            .await
            .unwrap(),
    );
    assert_redo_restores(&history, workflow_id, tab_id).await;

    applied(history.change_notes(workflow_id, b, Some("sorted?".into())).await.unwrap());
    assert_redo_restores(&history, workflow_id, tab_id).await;

    let settings = UpdateSettings {
        auto_update_data: true,
        next_update: Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap()),
        update_interval: 3600,
    };
    applied(history.change_update_settings(workflow_id, a, settings).await.unwrap());
    assert_redo_restores(&history, workflow_id, tab_id).await;
}

#[tokio::test]
async fn insert_at_either_end_keeps_orders_contiguous() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b"]).await;
    let (a, b) = (ids[0], ids[1]);

    let first = applied(history.add_step(workflow_id, tab_id, "x", 0, json!({})).await.unwrap());
    let x = first.kind.step_id().unwrap();
    let steps = live_steps(&history, tab_id).await;
    assert_eq!(steps.iter().map(|s| (s.id, s.order)).collect::<Vec<_>>(), vec![(x, 0), (a, 1), (b, 2)]);
    assert!(steps.iter().all(|s| s.stale_marker == Some(first.id)));

    let last = applied(history.add_step(workflow_id, tab_id, "y", 3, json!({})).await.unwrap());
    let y = last.kind.step_id().unwrap();
    let steps = live_steps(&history, tab_id).await;
    assert_eq!(
        steps.iter().map(|s| (s.id, s.order)).collect::<Vec<_>>(),
        vec![(x, 0), (a, 1), (b, 2), (y, 3)]
    );
    assert_eq!(marker_of(&history, b).await, Some(first.id));
    assert_eq!(marker_of(&history, y).await, Some(last.id));
}

#[tokio::test]
async fn deleting_the_only_step_clears_the_selection() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a"]).await;
    history.select_step(workflow_id, tab_id, Some(0)).await.unwrap();

    applied(history.delete_step(workflow_id, ids[0]).await.unwrap());
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, None);

    history.undo(workflow_id).await.unwrap().unwrap();
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(0));
}

#[tokio::test]
async fn selection_stays_within_live_steps() {
    let history = memory_history().await;
    let (workflow_id, tab_id, ids) = seeded(&history, &["a", "b"]).await;

    assert_eq!(history.select_step(workflow_id, tab_id, Some(42)).await.unwrap(), Some(1));
    assert_eq!(history.select_step(workflow_id, tab_id, Some(-3)).await.unwrap(), Some(0));

    history.select_step(workflow_id, tab_id, Some(42)).await.unwrap();
    applied(history.delete_step(workflow_id, ids[0]).await.unwrap());
    let tab = history.storage().get_tab(tab_id).await.unwrap().unwrap();
    assert_eq!(tab.selected_step_position, Some(0));

    let empty = history.storage().create_tab(workflow_id, "Tab 2").await.unwrap();
    assert_eq!(history.select_step(workflow_id, empty.id, Some(0)).await.unwrap(), None);

    assert!(matches!(
        history.select_step(workflow_id, 9999, Some(0)).await,
        Err(Error::TabNotFound(9999))
    ));
    assert!(matches!(
        history.set_step_notifications(workflow_id, 9999, true).await,
        Err(Error::StepNotFound(9999))
    ));
}

#[tokio::test]
async fn redo_refuses_a_branched_history() {
    let history = memory_history().await;
    let (workflow_id, tab_id, _) = seeded(&history, &["a"]).await;
    history.undo(workflow_id).await.unwrap().unwrap();
    let root_id = history.list_commands(workflow_id).await.unwrap()[0].id;

    // A second child of the root, as if an append had bypassed the lock
    sqlx::query(
        "INSERT INTO commands (workflow_id, prev_id, next_id, step_id, kind, payload, pre_image, created_at) \
         VALUES (?, ?, NULL, NULL, 'reorder_steps', ?, NULL, '2024-01-01T00:00:00Z')",
    )
    .bind(workflow_id)
    .bind(root_id)
    .bind(json!({"kind": "reorder_steps", "tab_id": tab_id, "prev_order": [], "next_order": []}).to_string())
    .execute(history.storage().pool())
    .await
    .unwrap();

    let err = history.redo(workflow_id).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Integrity(IntegrityFault::Branched { parent_id, children: 2, .. }) if parent_id == root_id
    ));
    assert!(err.is_fatal());
    assert!(live_ids(&history, tab_id).await.is_empty());
}
