//! Command log persistence
//!
//! Stores history nodes and maintains the `prev_id`/`next_id` links. The
//! active history is the path from the workflow's current command back to
//! its InitWorkflow root; anything hanging off the current command is the
//! redo branch, which is destroyed as soon as new history is written.

use super::{Command, CommandKind};
use crate::error::{Error, IntegrityFault, Result};
use crate::workflow::storage;
use crate::workflow::types::{StaleEntry, Workflow};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

const COMMAND_COLUMNS: &str = "id, workflow_id, prev_id, next_id, kind, payload, pre_image, created_at";

fn command_from_row(row: &SqliteRow) -> Result<Command> {
    let payload: String = row.try_get("payload")?;
    let pre_image: Option<String> = row.try_get("pre_image")?;
    Ok(Command {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        prev_id: row.try_get("prev_id")?,
        next_id: row.try_get("next_id")?,
        created_at: row.try_get("created_at")?,
        kind: serde_json::from_str(&payload)?,
        pre_image: pre_image.as_deref().map(serde_json::from_str).transpose()?,
    })
}

async fn insert_command(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    prev_id: Option<i64>,
    kind: CommandKind,
) -> Result<Command> {
    let created_at = Utc::now();
    let payload = serde_json::to_string(&kind)?;

    let result = sqlx::query(
        "INSERT INTO commands (workflow_id, prev_id, next_id, step_id, kind, payload, pre_image, created_at) \
         VALUES (?, ?, NULL, ?, ?, ?, NULL, ?)",
    )
    .bind(workflow_id)
    .bind(prev_id)
    .bind(kind.step_id())
    .bind(kind.tag())
    .bind(payload)
    .bind(created_at)
    .execute(&mut *conn)
    .await?;

    Ok(Command {
        id: result.last_insert_rowid(),
        workflow_id,
        prev_id,
        next_id: None,
        created_at,
        kind,
        pre_image: None,
    })
}

/// Write the InitWorkflow root and point the workflow at it
pub(crate) async fn insert_root(conn: &mut SqliteConnection, workflow_id: i64) -> Result<Command> {
    let root = insert_command(conn, workflow_id, None, CommandKind::InitWorkflow).await?;
    storage::set_current_command(conn, workflow_id, Some(root.id)).await?;
    Ok(root)
}

/// Append a node after the workflow's current command and make it current.
///
/// Any redo branch beyond the current command is destroyed first. The caller
/// still has to run `forward` on the returned command.
pub(crate) async fn append(conn: &mut SqliteConnection, workflow: &Workflow, kind: CommandKind) -> Result<Command> {
    let current_id = workflow.current_command_id.ok_or(IntegrityFault::MissingRoot {
        workflow_id: workflow.id,
    })?;

    let destroyed = destroy_redo_branch(conn, workflow.id, current_id).await?;
    if !destroyed.is_empty() {
        tracing::info!(
            "Workflow {}: discarded {} redo command(s) {:?}",
            workflow.id,
            destroyed.len(),
            destroyed
        );
    }

    let command = insert_command(conn, workflow.id, Some(current_id), kind).await?;
    set_next(conn, current_id, Some(command.id)).await?;
    storage::set_current_command(conn, workflow.id, Some(command.id)).await?;
    Ok(command)
}

/// Read a command by id, in any workflow
pub(crate) async fn fetch_command(conn: &mut SqliteConnection, id: i64) -> Result<Option<Command>> {
    let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(command_from_row).transpose()
}

/// Load a command that must exist and belong to `workflow_id`
pub(crate) async fn load_command(conn: &mut SqliteConnection, workflow_id: i64, id: i64) -> Result<Command> {
    let command = fetch_command(conn, id).await?.ok_or(Error::CommandNotFound(id))?;
    if command.workflow_id != workflow_id {
        return Err(IntegrityFault::ForeignCommand {
            command_id: id,
            expected: workflow_id,
            actual: command.workflow_id,
        }
        .into());
    }
    Ok(command)
}

/// Ids of every command whose `prev_id` is `parent_id`
pub(crate) async fn child_ids(conn: &mut SqliteConnection, workflow_id: i64, parent_id: i64) -> Result<Vec<i64>> {
    let rows = sqlx::query("SELECT id FROM commands WHERE workflow_id = ? AND prev_id = ? ORDER BY id")
        .bind(workflow_id)
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get("id")?);
    }
    Ok(ids)
}

/// Rewrite a command's forward link
pub(crate) async fn set_next(conn: &mut SqliteConnection, id: i64, next_id: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE commands SET next_id = ? WHERE id = ?")
        .bind(next_id)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Every command of a workflow, oldest first, active or redo-pending
pub(crate) async fn list_commands(conn: &mut SqliteConnection, workflow_id: i64) -> Result<Vec<Command>> {
    let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE workflow_id = ? ORDER BY id");
    let rows = sqlx::query(&sql).bind(workflow_id).fetch_all(&mut *conn).await?;
    rows.iter().map(command_from_row).collect()
}

/// Overwrite the stale markers captured by the command's latest `forward`
pub(crate) async fn store_pre_image(conn: &mut SqliteConnection, command_id: i64, entries: &[StaleEntry]) -> Result<()> {
    sqlx::query("UPDATE commands SET pre_image = ? WHERE id = ?")
        .bind(serde_json::to_string(entries)?)
        .bind(command_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// `None` if the command has never been applied
pub(crate) async fn load_pre_image(conn: &mut SqliteConnection, command_id: i64) -> Result<Option<Vec<StaleEntry>>> {
    let row = sqlx::query("SELECT pre_image FROM commands WHERE id = ?")
        .bind(command_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::CommandNotFound(command_id))?;

    let pre_image: Option<String> = row.try_get("pre_image")?;
    Ok(pre_image.as_deref().map(serde_json::from_str).transpose()?)
}

/// Remember the tab selection a command's `backward` found, for its next `forward`
pub(crate) async fn store_undo_selection(
    conn: &mut SqliteConnection,
    command_id: i64,
    selected: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE commands SET undo_selection = ? WHERE id = ?")
        .bind(serde_json::to_string(&selected)?)
        .bind(command_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// `None` if the command has never been undone
pub(crate) async fn load_undo_selection(conn: &mut SqliteConnection, command_id: i64) -> Result<Option<Option<i64>>> {
    let row = sqlx::query("SELECT undo_selection FROM commands WHERE id = ?")
        .bind(command_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(Error::CommandNotFound(command_id))?;

    let saved: Option<String> = row.try_get("undo_selection")?;
    Ok(saved.as_deref().map(serde_json::from_str).transpose()?)
}

/// Physically delete every command descending from `current_id`.
///
/// Nodes go newest-first, since older nodes' payloads assume the steps that
/// newer nodes reference still exist. Each deletion runs its cleanup hook.
/// Returns the destroyed ids.
pub(crate) async fn destroy_redo_branch(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    current_id: i64,
) -> Result<Vec<i64>> {
    let rows = sqlx::query(
        r#"
        WITH RECURSIVE branch(id) AS (
            SELECT id FROM commands WHERE workflow_id = ? AND prev_id = ?
            UNION
            SELECT c.id FROM commands c JOIN branch b ON c.prev_id = b.id
        )
        SELECT id FROM branch ORDER BY id DESC
        "#,
    )
    .bind(workflow_id)
    .bind(current_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut branch: Vec<i64> = Vec::with_capacity(rows.len());
    for row in rows {
        branch.push(row.try_get("id")?);
    }
    if branch.is_empty() {
        return Ok(branch);
    }

    // Unlink first so no surviving row points into the branch
    set_next(conn, current_id, None).await?;
    for id in &branch {
        set_next(conn, *id, None).await?;
    }

    for id in &branch {
        let command = load_command(conn, workflow_id, *id).await?;
        sqlx::query("DELETE FROM commands WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        on_destroyed(conn, &command).await?;
    }

    Ok(branch)
}

/// Cleanup hook run synchronously after a command row is deleted.
///
/// An AddStep that is being destroyed must have been undone, so its step is
/// soft-deleted and nothing surviving can bring it back: hard-delete it.
async fn on_destroyed(conn: &mut SqliteConnection, command: &Command) -> Result<()> {
    let CommandKind::AddStep(add) = &command.kind else {
        return Ok(());
    };

    let Some(step) = storage::fetch_step(conn, add.step_id).await? else {
        return Ok(());
    };
    if !step.is_deleted {
        tracing::warn!(
            "Destroyed command {} created step {} which is still live; keeping it",
            command.id,
            step.id
        );
        return Ok(());
    }

    let references: i64 = sqlx::query("SELECT COUNT(*) AS n FROM commands WHERE step_id = ?")
        .bind(step.id)
        .fetch_one(&mut *conn)
        .await?
        .try_get("n")?;
    if references > 0 {
        return Err(IntegrityFault::StepStillReferenced {
            step_id: step.id,
            references,
        }
        .into());
    }

    storage::delete_step_row(conn, step.id).await?;
    tracing::debug!("Hard-deleted step {} with its creating command {}", step.id, command.id);
    Ok(())
}
