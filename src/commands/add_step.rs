//! AddStep: insert a step into a tab
//!
//! The step row is created up front, soft-deleted, so later commands can
//! refer to its id whether or not this command is currently applied. Undo
//! hides it again; only destroying this command removes the row.

use super::{
    clamp_tab_selection, propagation, require_step, restore_selection, save_selection, CommandKind, Prepared, Rejection,
};
use crate::error::Result;
use crate::workflow::storage::{self, NewStep};
use crate::workflow::types::StaleEntry;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqliteConnection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddStep {
    pub step_id: i64,
    pub tab_id: i64,
    pub module_id_name: String,
    pub position: i64,
}

/// Validate the tab and position, then insert the new step hidden
pub(crate) async fn prepare(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    tab_id: i64,
    module_id_name: String,
    position: i64,
    params: Value,
) -> Result<Prepared> {
    match storage::fetch_tab(conn, tab_id).await? {
        Some(tab) if tab.workflow_id == workflow_id => {}
        _ => return Ok(Prepared::Rejected(Rejection::UnknownTab { tab_id })),
    }

    let live_count = storage::count_live_steps(conn, tab_id).await?;
    if position < 0 || position > live_count {
        return Ok(Prepared::Rejected(Rejection::PositionOutOfRange { position, live_count }));
    }

    let params = if params.is_null() { Value::Object(Default::default()) } else { params };
    let step_id = storage::insert_step_row(
        conn,
        NewStep {
            tab_id,
            module_id_name: &module_id_name,
            order: position,
            params: &params,
        },
    )
    .await?;

    Ok(Prepared::Ready(CommandKind::AddStep(AddStep {
        step_id,
        tab_id,
        module_id_name,
        position,
    })))
}

impl AddStep {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let step = require_step(conn, command_id, self.step_id).await?;

        // Move subsequent steps over to make way for this one
        storage::shift_live_orders(conn, self.tab_id, step.order, 1, self.step_id).await?;
        storage::set_step_deleted(conn, self.step_id, false).await?;

        let stamped = propagation::forward(conn, command_id, self.tab_id, step.order).await?;
        // On redo, go back to what was selected before the undo clamped it
        restore_selection(conn, command_id, self.tab_id).await?;
        Ok(stamped)
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let step = require_step(conn, command_id, self.step_id).await?;
        save_selection(conn, command_id, self.tab_id).await?;
        let restored = propagation::backward(conn, command_id).await?;

        storage::set_step_deleted(conn, self.step_id, true).await?;
        // Close the gap left behind
        storage::shift_live_orders(conn, self.tab_id, step.order + 1, -1, self.step_id).await?;
        clamp_tab_selection(conn, self.tab_id).await?;

        Ok(restored)
    }

    pub fn describe(&self) -> String {
        format!(
            "Add step {} ({}) at {}",
            self.step_id, self.module_id_name, self.position
        )
    }
}
