//! Single-step value edits
//!
//! Each variant captures `(old, new)` for one step under the lock. `forward`
//! writes the new value and marks the step and its successors stale;
//! `backward` restores the markers and then the old value.

use super::{load_target, propagation, require_step, CommandKind, Prepared, Target};
use crate::error::Result;
use crate::workflow::storage;
use crate::workflow::types::{StaleEntry, UpdateSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

/// Point a step at a different version of its fetched data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeDataVersion {
    pub step_id: i64,
    /// A step that never fetched has no previous version
    pub old_version: Option<DateTime<Utc>>,
    pub new_version: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeParameters {
    pub step_id: i64,
    pub old_params: Value,
    pub new_params: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotes {
    pub step_id: i64,
    pub old_notes: Option<String>,
    pub new_notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeUpdateSettings {
    pub step_id: i64,
    pub old_settings: UpdateSettings,
    pub new_settings: UpdateSettings,
}

/// Capture the step's current data version
pub(crate) async fn prepare_data_version(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    step_id: i64,
    version: DateTime<Utc>,
) -> Result<Prepared> {
    let step = match load_target(conn, workflow_id, step_id).await? {
        Target::Live(step) => step,
        Target::Skip(outcome) => return Ok(outcome),
    };
    Ok(Prepared::Ready(CommandKind::ChangeDataVersion(ChangeDataVersion {
        step_id,
        old_version: step.stored_data_version,
        new_version: version,
    })))
}

/// `values` is merged over the step's current parameters; keys not
/// mentioned keep their value.
pub(crate) async fn prepare_parameters(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    step_id: i64,
    values: Map<String, Value>,
) -> Result<Prepared> {
    let step = match load_target(conn, workflow_id, step_id).await? {
        Target::Live(step) => step,
        Target::Skip(outcome) => return Ok(outcome),
    };

    let mut merged = match &step.params {
        Value::Object(existing) => existing.clone(),
        _ => Map::new(),
    };
    merged.extend(values);

    Ok(Prepared::Ready(CommandKind::ChangeParameters(ChangeParameters {
        step_id,
        old_params: step.params,
        new_params: Value::Object(merged),
    })))
}

pub(crate) async fn prepare_notes(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    step_id: i64,
    notes: Option<String>,
) -> Result<Prepared> {
    let step = match load_target(conn, workflow_id, step_id).await? {
        Target::Live(step) => step,
        Target::Skip(outcome) => return Ok(outcome),
    };
    Ok(Prepared::Ready(CommandKind::ChangeNotes(ChangeNotes {
        step_id,
        old_notes: step.notes,
        new_notes: notes,
    })))
}

/// Capture the step's current update schedule
pub(crate) async fn prepare_update_settings(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    step_id: i64,
    settings: UpdateSettings,
) -> Result<Prepared> {
    let step = match load_target(conn, workflow_id, step_id).await? {
        Target::Live(step) => step,
        Target::Skip(outcome) => return Ok(outcome),
    };
    Ok(Prepared::Ready(CommandKind::ChangeUpdateSettings(ChangeUpdateSettings {
        step_id,
        old_settings: step.update_settings,
        new_settings: settings,
    })))
}

/// Propagate from the step's current position in its tab
async fn stamp_from_step(conn: &mut SqliteConnection, command_id: i64, step_id: i64) -> Result<Vec<StaleEntry>> {
    let step = require_step(conn, command_id, step_id).await?;
    propagation::forward(conn, command_id, step.tab_id, step.order).await
}

impl ChangeDataVersion {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        storage::set_step_data_version(conn, self.step_id, Some(self.new_version)).await?;
        stamp_from_step(conn, command_id, self.step_id).await
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let restored = propagation::backward(conn, command_id).await?;
        storage::set_step_data_version(conn, self.step_id, self.old_version).await?;
        Ok(restored)
    }

    pub fn describe(&self) -> String {
        format!(
            "Change step {} data version to {}",
            self.step_id,
            self.new_version.to_rfc3339()
        )
    }
}

impl ChangeParameters {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        storage::set_step_params(conn, self.step_id, &self.new_params).await?;
        stamp_from_step(conn, command_id, self.step_id).await
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let restored = propagation::backward(conn, command_id).await?;
        storage::set_step_params(conn, self.step_id, &self.old_params).await?;
        Ok(restored)
    }

    pub fn describe(&self) -> String {
        let changed: Vec<&str> = match (&self.old_params, &self.new_params) {
            (Value::Object(old), Value::Object(new)) => new
                .iter()
                .filter(|(key, value)| old.get(key.as_str()) != Some(value))
                .map(|(key, _)| key.as_str())
                .collect(),
            _ => Vec::new(),
        };
        format!("Change parameters of step {} {:?}", self.step_id, changed)
    }
}

impl ChangeNotes {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        storage::set_step_notes(conn, self.step_id, self.new_notes.as_deref()).await?;
        stamp_from_step(conn, command_id, self.step_id).await
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let restored = propagation::backward(conn, command_id).await?;
        storage::set_step_notes(conn, self.step_id, self.old_notes.as_deref()).await?;
        Ok(restored)
    }

    pub fn describe(&self) -> String {
        format!("Change notes of step {}", self.step_id)
    }
}

impl ChangeUpdateSettings {
    pub(crate) async fn forward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        storage::set_step_update_settings(conn, self.step_id, &self.new_settings).await?;
        stamp_from_step(conn, command_id, self.step_id).await
    }

    pub(crate) async fn backward(&self, conn: &mut SqliteConnection, command_id: i64) -> Result<Vec<StaleEntry>> {
        let restored = propagation::backward(conn, command_id).await?;
        storage::set_step_update_settings(conn, self.step_id, &self.old_settings).await?;
        Ok(restored)
    }

    pub fn describe(&self) -> String {
        if self.new_settings.auto_update_data {
            format!(
                "Update step {} automatically every {}s",
                self.step_id, self.new_settings.update_interval
            )
        } else {
            format!("Update step {} manually", self.step_id)
        }
    }
}
