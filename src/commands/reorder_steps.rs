//! ReorderSteps: permute the live steps of one tab

use super::{propagation, CommandKind, NoOpReason, Prepared, Rejection};
use crate::error::{IntegrityFault, Result};
use crate::workflow::storage;
use crate::workflow::types::StaleEntry;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderSteps {
    pub tab_id: i64,
    /// Live step ids in order before the command
    pub prev_order: Vec<i64>,
    /// Live step ids in order after the command
    pub next_order: Vec<i64>,
}

/// Accept only a permutation of exactly the tab's current live steps.
///
/// Anything else is a reorder racing an add or delete (or a forged list
/// naming steps from another tab) and is rejected without side effects.
pub(crate) async fn prepare(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    tab_id: i64,
    step_ids: Vec<i64>,
) -> Result<Prepared> {
    match storage::fetch_tab(conn, tab_id).await? {
        Some(tab) if tab.workflow_id == workflow_id => {}
        _ => return Ok(Prepared::Rejected(Rejection::UnknownTab { tab_id })),
    }

    let prev_order: Vec<i64> = storage::live_step_orders(conn, tab_id)
        .await?
        .into_iter()
        .map(|(id, _)| id)
        .collect();

    let mut seen = HashSet::with_capacity(step_ids.len());
    for id in &step_ids {
        if !seen.insert(*id) {
            return Ok(Prepared::Rejected(Rejection::DuplicateStep { step_id: *id }));
        }
    }

    let live: HashSet<i64> = prev_order.iter().copied().collect();
    if live != seen || prev_order.len() != step_ids.len() {
        tracing::warn!("Rejected reorder of tab {}: {:?} is not a permutation of {:?}", tab_id, step_ids, prev_order);
        return Ok(Prepared::Rejected(Rejection::StepSetMismatch));
    }

    if prev_order == step_ids {
        return Ok(Prepared::NoOp(NoOpReason::OrderUnchanged));
    }

    Ok(Prepared::Ready(CommandKind::ReorderSteps(ReorderSteps {
        tab_id,
        prev_order,
        next_order: step_ids,
    })))
}

impl ReorderSteps {
    /// First position where the two orders disagree. Steps before it keep
    /// both their order and their inputs, so they stay fresh.
    fn first_affected_order(&self) -> i64 {
        self.prev_order
            .iter()
            .zip(&self.next_order)
            .position(|(prev, next)| prev != next)
            .unwrap_or(self.next_order.len()) as i64
    }

    /// Write `order` for each step whose position changed
    async fn apply_order(&self, conn: &mut SqliteConnection, command_id: i64, step_ids: &[i64]) -> Result<()> {
        let current: HashMap<i64, i64> = storage::live_step_orders(conn, self.tab_id).await?.into_iter().collect();

        for (position, step_id) in step_ids.iter().enumerate() {
            let position = position as i64;
            let current_position = current.get(step_id).ok_or(IntegrityFault::MissingStep {
                command_id,
                step_id: *step_id,
            })?;
            if *current_position != position {
                storage::set_step_order(conn, *step_id, position).await?;
            }
        }
        Ok(())
    }

    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        self.apply_order(conn, command_id, &self.next_order).await?;
        propagation::forward(conn, command_id, self.tab_id, self.first_affected_order()).await
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        self.apply_order(conn, command_id, &self.prev_order).await?;
        propagation::backward(conn, command_id).await
    }

    pub fn describe(&self) -> String {
        format!("Reorder steps to {:?}", self.next_order)
    }
}
