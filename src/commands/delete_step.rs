//! DeleteStep: soft-delete a step from its tab
//!
//! The row is never destroyed here. Older commands assume the step exists;
//! only the AddStep that created it may hard-delete it.

use super::{load_target, propagation, require_step, restore_selection, save_selection, CommandKind, Prepared, Target};
use crate::error::Result;
use crate::workflow::storage;
use crate::workflow::types::StaleEntry;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteStep {
    pub step_id: i64,
    pub tab_id: i64,
    pub module_id_name: String,
    /// Tab selection when the command was created; restored on undo.
    /// Redo goes back to the selection the undo replaced.
    pub selected_step_position: Option<i64>,
}

/// Two editors deleting the same step race here: the lock makes the second
/// one see the step already deleted, and it becomes a no-op.
pub(crate) async fn prepare(conn: &mut SqliteConnection, workflow_id: i64, step_id: i64) -> Result<Prepared> {
    let step = match load_target(conn, workflow_id, step_id).await? {
        Target::Live(step) => step,
        Target::Skip(outcome) => return Ok(outcome),
    };
    let selected_step_position = storage::fetch_tab(conn, step.tab_id)
        .await?
        .and_then(|tab| tab.selected_step_position);

    Ok(Prepared::Ready(CommandKind::DeleteStep(DeleteStep {
        step_id,
        tab_id: step.tab_id,
        module_id_name: step.module_id_name,
        selected_step_position,
    })))
}

/// Selection after removing the step at `deleted_order`
fn selection_after_delete(selected: Option<i64>, deleted_order: i64, live_count: i64) -> Option<i64> {
    if live_count == 0 {
        return None;
    }
    match selected {
        Some(s) if s == deleted_order => Some((deleted_order - 1).max(0)),
        Some(s) if s > deleted_order => Some(s - 1),
        other => other,
    }
}

impl DeleteStep {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let step = require_step(conn, command_id, self.step_id).await?;

        storage::set_step_deleted(conn, self.step_id, true).await?;
        storage::shift_live_orders(conn, self.tab_id, step.order + 1, -1, self.step_id).await?;

        // The deleted step is excluded now; its successor takes its order
        let stamped = propagation::forward(conn, command_id, self.tab_id, step.order).await?;

        if restore_selection(conn, command_id, self.tab_id).await? {
            return Ok(stamped);
        }
        if let Some(tab) = storage::fetch_tab(conn, self.tab_id).await? {
            let live_count = storage::count_live_steps(conn, self.tab_id).await?;
            let selected = selection_after_delete(tab.selected_step_position, step.order, live_count);
            if selected != tab.selected_step_position {
                storage::set_tab_selection(conn, self.tab_id, selected).await?;
            }
        }

        Ok(stamped)
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let step = require_step(conn, command_id, self.step_id).await?;
        save_selection(conn, command_id, self.tab_id).await?;
        let restored = propagation::backward(conn, command_id).await?;

        storage::shift_live_orders(conn, self.tab_id, step.order, 1, self.step_id).await?;
        storage::set_step_deleted(conn, self.step_id, false).await?;
        storage::set_tab_selection(conn, self.tab_id, self.selected_step_position).await?;

        Ok(restored)
    }

    pub fn describe(&self) -> String {
        format!("Delete step {} ({})", self.step_id, self.module_id_name)
    }
}

#[cfg(test)]
mod tests {
    use super::selection_after_delete;

    #[test]
    fn selection_follows_the_deleted_step() {
        // deleting the selected step selects its predecessor
        assert_eq!(selection_after_delete(Some(1), 1, 2), Some(0));
        assert_eq!(selection_after_delete(Some(0), 0, 2), Some(0));
        // later selections shift down with their step
        assert_eq!(selection_after_delete(Some(2), 1, 2), Some(1));
        // earlier selections are untouched
        assert_eq!(selection_after_delete(Some(0), 2, 2), Some(0));
        assert_eq!(selection_after_delete(None, 0, 2), None);
        // empty tab
        assert_eq!(selection_after_delete(Some(0), 0, 0), None);
    }
}
