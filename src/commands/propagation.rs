//! Dependency propagation of stale markers
//!
//! Steps in a tab form a linear pipeline: changing step `s` invalidates `s`
//! and everything after it. `forward` snapshots the affected steps' markers
//! onto the command and stamps them with the command id; `backward` writes
//! that snapshot back verbatim. The snapshot, not a recomputation, drives
//! undo because the live tab may look different by then.
//!
//! Snapshots are only valid if commands are undone newest-first. That is a
//! protocol rule of the history driver, not something checked here.

use super::log;
use crate::error::{IntegrityFault, Result};
use crate::workflow::storage;
use crate::workflow::types::StaleEntry;
use sqlx::SqliteConnection;

/// Mark live steps of `tab_id` at or after `from_order` stale by `command_id`.
///
/// Returns the new `(step, marker)` pairs.
pub(crate) async fn forward(
    conn: &mut SqliteConnection,
    command_id: i64,
    tab_id: i64,
    from_order: i64,
) -> Result<Vec<StaleEntry>> {
    let before = storage::live_stale_markers_from(conn, tab_id, from_order).await?;
    log::store_pre_image(conn, command_id, &before).await?;

    let stamped = storage::stamp_live_steps_from(conn, tab_id, from_order, command_id).await?;
    tracing::debug!(
        "Command {} stamped {} step(s) stale in tab {} from order {}",
        command_id,
        stamped,
        tab_id,
        from_order
    );

    Ok(before
        .into_iter()
        .map(|entry| StaleEntry {
            step_id: entry.step_id,
            stale_marker: Some(command_id),
        })
        .collect())
}

/// Restore the markers captured by the command's last `forward`.
pub(crate) async fn backward(conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
    let pre_image = log::load_pre_image(conn, command_id)
        .await?
        .ok_or(IntegrityFault::MissingPreImage { command_id })?;

    for entry in &pre_image {
        if storage::set_stale_marker(conn, entry.step_id, entry.stale_marker).await? == 0 {
            return Err(IntegrityFault::MissingStep {
                command_id,
                step_id: entry.step_id,
            }
            .into());
        }
    }
    tracing::debug!("Command {} restored {} stale marker(s)", command_id, pre_image.len());

    Ok(pre_image)
}
