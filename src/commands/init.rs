//! InitWorkflow: the history root
//!
//! Written together with its workflow and first tab in one transaction.
//! It has no effect to apply or revert and is never undone.

use super::{log, Command};
use crate::error::Result;
use crate::workflow::storage;
use chrono::Utc;
use sqlx::SqliteConnection;

/// Insert a workflow with one empty tab and its InitWorkflow root
pub(crate) async fn create_workflow(conn: &mut SqliteConnection, name: &str) -> Result<(i64, Command)> {
    let workflow_id = storage::insert_workflow(conn, name, Utc::now()).await?;
    storage::insert_tab(conn, workflow_id, "Tab 1", 0).await?;
    let root = log::insert_root(conn, workflow_id).await?;
    Ok((workflow_id, root))
}

pub(crate) fn describe() -> String {
    "Create workflow".to_string()
}
