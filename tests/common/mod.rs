//! Shared fixtures for history integration tests
#![allow(dead_code)]

use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use stepwise::runtime::{Notifier, TracingNotifier, WorkflowHistory};
use stepwise::workflow::{WorkflowLocks, WorkflowStorage};
use stepwise::{Command, CreateOutcome, Step, Tab};

/// History service over a fresh in-memory database
pub async fn memory_history() -> WorkflowHistory {
    memory_history_with(Arc::new(TracingNotifier)).await
}

pub async fn memory_history_with(notifier: Arc<dyn Notifier>) -> WorkflowHistory {
    // A single never-recycled connection: each in-memory connection is its own database
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .unwrap();

    let storage = WorkflowStorage::new(pool);
    storage.init_schema().await.unwrap();
    let locks = Arc::new(WorkflowLocks::new(Duration::from_secs(5)));
    WorkflowHistory::new(storage, locks, notifier)
}

pub fn applied(outcome: CreateOutcome) -> Command {
    match outcome {
        CreateOutcome::Applied(command) => command,
        other => panic!("expected an applied command, got {:?}", other),
    }
}

/// Workflow whose first tab holds one live step per module, in order.
///
/// Returns `(workflow_id, tab_id, step_ids)`.
pub async fn seeded(history: &WorkflowHistory, modules: &[&str]) -> (i64, i64, Vec<i64>) {
    let workflow = history.init_workflow("test workflow").await.unwrap();
    let tab_id = history.storage().list_tabs(workflow.id).await.unwrap()[0].id;

    let mut step_ids = Vec::new();
    for (position, module) in modules.iter().enumerate() {
        let command = applied(
            history
                .add_step(workflow.id, tab_id, module, position as i64, json!({}))
                .await
                .unwrap(),
        );
        step_ids.push(command.kind.step_id().unwrap());
    }
    (workflow.id, tab_id, step_ids)
}

pub async fn live_ids(history: &WorkflowHistory, tab_id: i64) -> Vec<i64> {
    live_steps(history, tab_id).await.iter().map(|s| s.id).collect()
}

pub async fn live_steps(history: &WorkflowHistory, tab_id: i64) -> Vec<Step> {
    history.storage().live_steps(tab_id).await.unwrap()
}

/// Every step row of the tab, deleted or not, plus the tab itself
pub async fn tab_state(history: &WorkflowHistory, tab_id: i64) -> (Vec<Step>, Option<Tab>) {
    (
        history.storage().all_steps(tab_id).await.unwrap(),
        history.storage().get_tab(tab_id).await.unwrap(),
    )
}

/// Undo then redo the current command; the tab must come back exactly
pub async fn assert_redo_restores(history: &WorkflowHistory, workflow_id: i64, tab_id: i64) {
    let applied_state = tab_state(history, tab_id).await;
    let undone = history.undo(workflow_id).await.unwrap().unwrap();
    let redone = history.redo(workflow_id).await.unwrap().unwrap();
    assert_eq!(redone.id, undone.id);
    assert_eq!(tab_state(history, tab_id).await, applied_state, "after redoing {}", redone.describe());
}

pub async fn marker_of(history: &WorkflowHistory, step_id: i64) -> Option<i64> {
    history.storage().get_step(step_id).await.unwrap().unwrap().stale_marker
}

/// Commands reachable by following `next_id` from the workflow's current command
pub async fn redo_chain_len(history: &WorkflowHistory, workflow_id: i64) -> usize {
    let workflow = history.storage().get_workflow(workflow_id).await.unwrap().unwrap();
    let commands = history.list_commands(workflow_id).await.unwrap();
    let mut cursor = commands
        .iter()
        .find(|c| Some(c.id) == workflow.current_command_id)
        .and_then(|c| c.next_id);
    let mut count = 0;
    while let Some(id) = cursor {
        count += 1;
        cursor = commands.iter().find(|c| c.id == id).and_then(|c| c.next_id);
    }
    count
}
