//! Reversible Command Layer
//!
//! A workflow's history is a doubly linked chain of `Command` nodes rooted at
//! an `InitWorkflow`. Each node carries a `CommandKind`, a closed set of
//! reversible edits whose `forward` and `backward` are exact inverses:
//! - Step structure: AddStep, DeleteStep, ReorderSteps
//! - Step values: ChangeDataVersion, ChangeParameters, ChangeNotes, ChangeUpdateSettings
//!
//! Nothing here takes the workflow lock itself. Callers in `runtime::history`
//! hold it and pass in the open transaction.

// History chain persistence: append, link, prune
pub mod log;

// Stale-marker propagation shared by every variant that changes output
pub mod propagation;

pub mod add_step;
pub mod change_step;
pub mod delete_step;
pub mod init;
pub mod reorder_steps;

pub use add_step::AddStep;
pub use change_step::{ChangeDataVersion, ChangeNotes, ChangeParameters, ChangeUpdateSettings};
pub use delete_step::DeleteStep;
pub use reorder_steps::ReorderSteps;

use crate::error::{IntegrityFault, Result};
use crate::workflow::storage;
use crate::workflow::types::{StaleEntry, Step, UpdateSettings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqliteConnection;

/// One node in a workflow's history chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Monotonically increasing, never reused
    pub id: i64,
    pub workflow_id: i64,
    /// Previous node; `None` only for the InitWorkflow root
    pub prev_id: Option<i64>,
    /// Next node, which may be on the redo branch
    pub next_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub kind: CommandKind,
    /// Stale markers captured by the most recent `forward`, if any
    pub pre_image: Option<Vec<StaleEntry>>,
}

/// Closed set of reversible edits, persisted as tagged JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandKind {
    /// History root written with the workflow; never applied or undone
    InitWorkflow,
    /// Insert a step at a position in a tab
    AddStep(AddStep),
    /// Soft-delete a step
    DeleteStep(DeleteStep),
    /// Permute a tab's live steps
    ReorderSteps(ReorderSteps),
    /// Switch a step to another fetched data version
    ChangeDataVersion(ChangeDataVersion),
    /// Merge new values into a step's parameters
    ChangeParameters(ChangeParameters),
    ChangeNotes(ChangeNotes),
    /// Change a step's automatic fetch schedule
    ChangeUpdateSettings(ChangeUpdateSettings),
}

/// Raw request for a new command, before pre-conditions are checked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandArgs {
    AddStep {
        tab_id: i64,
        module_id_name: String,
        position: i64,
        #[serde(default)]
        params: Value,
    },
    DeleteStep {
        step_id: i64,
    },
    ReorderSteps {
        tab_id: i64,
        step_ids: Vec<i64>,
    },
    ChangeDataVersion {
        step_id: i64,
        version: DateTime<Utc>,
    },
    ChangeParameters {
        step_id: i64,
        values: Map<String, Value>,
    },
    ChangeNotes {
        step_id: i64,
        notes: Option<String>,
    },
    ChangeUpdateSettings {
        step_id: i64,
        settings: UpdateSettings,
    },
}

/// Result of trying to create a command
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// A new node was appended and applied
    Applied(Command),
    /// Someone else already made the change; nothing happened
    NoOp(NoOpReason),
    /// The request was malformed for the current state; nothing happened
    Rejected(Rejection),
}

impl CreateOutcome {
    pub fn command(&self) -> Option<&Command> {
        match self {
            CreateOutcome::Applied(command) => Some(command),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoOpReason {
    /// Target step was soft-deleted by a concurrent edit
    StepAlreadyDeleted,
    /// Reorder requested the order the tab already has
    OrderUnchanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Tab does not exist in this workflow
    UnknownTab { tab_id: i64 },
    /// Step does not exist in this workflow
    UnknownStep { step_id: i64 },
    /// Insert position outside `0..=live_count`
    PositionOutOfRange { position: i64, live_count: i64 },
    /// Reorder ids are not exactly the tab's live steps
    StepSetMismatch,
    /// Reorder lists a step more than once
    DuplicateStep { step_id: i64 },
}

/// Whether collaborators should re-render after a command is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderPolicy {
    Skip,
    /// Render now
    Full,
    /// Only ask live viewers to request a render if they care
    LazyIfListening,
}

/// Outcome of a variant's pre-condition capture
#[derive(Debug)]
pub(crate) enum Prepared {
    Ready(CommandKind),
    NoOp(NoOpReason),
    Rejected(Rejection),
}

impl CommandKind {
    /// Column value stored next to the JSON payload
    pub fn tag(&self) -> &'static str {
        match self {
            CommandKind::InitWorkflow => "init_workflow",
            CommandKind::AddStep(_) => "add_step",
            CommandKind::DeleteStep(_) => "delete_step",
            CommandKind::ReorderSteps(_) => "reorder_steps",
            CommandKind::ChangeDataVersion(_) => "change_data_version",
            CommandKind::ChangeParameters(_) => "change_parameters",
            CommandKind::ChangeNotes(_) => "change_notes",
            CommandKind::ChangeUpdateSettings(_) => "change_update_settings",
        }
    }

    /// Step this command is about, if it targets exactly one
    pub fn step_id(&self) -> Option<i64> {
        match self {
            CommandKind::InitWorkflow | CommandKind::ReorderSteps(_) => None,
            CommandKind::AddStep(c) => Some(c.step_id),
            CommandKind::DeleteStep(c) => Some(c.step_id),
            CommandKind::ChangeDataVersion(c) => Some(c.step_id),
            CommandKind::ChangeParameters(c) => Some(c.step_id),
            CommandKind::ChangeNotes(c) => Some(c.step_id),
            CommandKind::ChangeUpdateSettings(c) => Some(c.step_id),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CommandKind::InitWorkflow => init::describe(),
            CommandKind::AddStep(c) => c.describe(),
            CommandKind::DeleteStep(c) => c.describe(),
            CommandKind::ReorderSteps(c) => c.describe(),
            CommandKind::ChangeDataVersion(c) => c.describe(),
            CommandKind::ChangeParameters(c) => c.describe(),
            CommandKind::ChangeNotes(c) => c.describe(),
            CommandKind::ChangeUpdateSettings(c) => c.describe(),
        }
    }

    pub(crate) async fn render_policy(&self, conn: &mut SqliteConnection, workflow_id: i64) -> Result<RenderPolicy> {
        Ok(match self {
            CommandKind::InitWorkflow => RenderPolicy::Skip,
            // Fetches (often cron-driven) are the heaviest renders, so only
            // render eagerly when someone asked to be told about changes.
            CommandKind::ChangeDataVersion(_) => {
                if storage::workflow_has_notifying_steps(conn, workflow_id).await? {
                    RenderPolicy::Full
                } else {
                    RenderPolicy::LazyIfListening
                }
            }
            _ => RenderPolicy::Full,
        })
    }
}

impl Command {
    /// Human-readable label for UIs and audit logs
    pub fn describe(&self) -> String {
        self.kind.describe()
    }

    /// Apply this command. Returns the stale markers it wrote.
    ///
    /// Must run inside the workflow's lock and transaction. Any error here is
    /// an integrity fault: correct sequencing never fails.
    pub async fn forward(&self, conn: &mut SqliteConnection) -> Result<Vec<StaleEntry>> {
        tracing::debug!("Forward command {} ({})", self.id, self.kind.tag());
        match &self.kind {
            CommandKind::InitWorkflow => Ok(Vec::new()),
            CommandKind::AddStep(c) => c.forward(conn, self.id).await,
            CommandKind::DeleteStep(c) => c.forward(conn, self.id).await,
            CommandKind::ReorderSteps(c) => c.forward(conn, self.id).await,
            CommandKind::ChangeDataVersion(c) => c.forward(conn, self.id).await,
            CommandKind::ChangeParameters(c) => c.forward(conn, self.id).await,
            CommandKind::ChangeNotes(c) => c.forward(conn, self.id).await,
            CommandKind::ChangeUpdateSettings(c) => c.forward(conn, self.id).await,
        }
    }

    /// Revert this command. Returns the stale markers it restored.
    ///
    /// Only valid while this command is the workflow's current position:
    /// commands are undone strictly newest-first.
    pub async fn backward(&self, conn: &mut SqliteConnection) -> Result<Vec<StaleEntry>> {
        tracing::debug!("Backward command {} ({})", self.id, self.kind.tag());
        match &self.kind {
            CommandKind::InitWorkflow => Ok(Vec::new()),
            CommandKind::AddStep(c) => c.backward(conn, self.id).await,
            CommandKind::DeleteStep(c) => c.backward(conn, self.id).await,
            CommandKind::ReorderSteps(c) => c.backward(conn, self.id).await,
            CommandKind::ChangeDataVersion(c) => c.backward(conn, self.id).await,
            CommandKind::ChangeParameters(c) => c.backward(conn, self.id).await,
            CommandKind::ChangeNotes(c) => c.backward(conn, self.id).await,
            CommandKind::ChangeUpdateSettings(c) => c.backward(conn, self.id).await,
        }
    }
}

/// Run the variant's pre-condition check and capture its payload.
///
/// May write rows (AddStep inserts its step hidden), but only when it
/// returns `Prepared::Ready`.
pub(crate) async fn prepare(conn: &mut SqliteConnection, workflow_id: i64, args: CommandArgs) -> Result<Prepared> {
    match args {
        CommandArgs::AddStep {
            tab_id,
            module_id_name,
            position,
            params,
        } => add_step::prepare(conn, workflow_id, tab_id, module_id_name, position, params).await,
        CommandArgs::DeleteStep { step_id } => delete_step::prepare(conn, workflow_id, step_id).await,
        CommandArgs::ReorderSteps { tab_id, step_ids } => {
            reorder_steps::prepare(conn, workflow_id, tab_id, step_ids).await
        }
        CommandArgs::ChangeDataVersion { step_id, version } => {
            change_step::prepare_data_version(conn, workflow_id, step_id, version).await
        }
        CommandArgs::ChangeParameters { step_id, values } => {
            change_step::prepare_parameters(conn, workflow_id, step_id, values).await
        }
        CommandArgs::ChangeNotes { step_id, notes } => {
            change_step::prepare_notes(conn, workflow_id, step_id, notes).await
        }
        CommandArgs::ChangeUpdateSettings { step_id, settings } => {
            change_step::prepare_update_settings(conn, workflow_id, step_id, settings).await
        }
    }
}

/// A step a new command wants to edit, or the reason not to
pub(crate) enum Target {
    Live(Step),
    Skip(Prepared),
}

/// Reload the step under the lock so concurrent deletes are seen
pub(crate) async fn load_target(conn: &mut SqliteConnection, workflow_id: i64, step_id: i64) -> Result<Target> {
    match storage::fetch_step_in_workflow(conn, workflow_id, step_id).await? {
        None => Ok(Target::Skip(Prepared::Rejected(Rejection::UnknownStep { step_id }))),
        Some(step) if step.is_deleted => {
            tracing::warn!("Step {} already deleted; ignoring edit", step_id);
            Ok(Target::Skip(Prepared::NoOp(NoOpReason::StepAlreadyDeleted)))
        }
        Some(step) => Ok(Target::Live(step)),
    }
}

/// Load a step a persisted command refers to; absence means corruption
pub(crate) async fn require_step(conn: &mut SqliteConnection, command_id: i64, step_id: i64) -> Result<Step> {
    storage::fetch_step(conn, step_id)
        .await?
        .ok_or_else(|| IntegrityFault::MissingStep { command_id, step_id }.into())
}

/// Pull a selection into `0..live`, or `None` when the tab has no live steps
pub(crate) fn clamp_selection(selected: Option<i64>, live: i64) -> Option<i64> {
    match selected {
        _ if live <= 0 => None,
        Some(s) => Some(s.clamp(0, live - 1)),
        None => None,
    }
}

/// Keep a tab's selection pointing at a live step, or at nothing if empty
pub(crate) async fn clamp_tab_selection(conn: &mut SqliteConnection, tab_id: i64) -> Result<()> {
    let Some(tab) = storage::fetch_tab(conn, tab_id).await? else {
        return Ok(());
    };
    let live = storage::count_live_steps(conn, tab_id).await?;
    let clamped = clamp_selection(tab.selected_step_position, live);
    if clamped != tab.selected_step_position {
        storage::set_tab_selection(conn, tab_id, clamped).await?;
    }
    Ok(())
}

/// Record the tab's selection on the command before `backward` moves it
pub(crate) async fn save_selection(conn: &mut SqliteConnection, command_id: i64, tab_id: i64) -> Result<()> {
    let selected = storage::fetch_tab(conn, tab_id)
        .await?
        .and_then(|tab| tab.selected_step_position);
    log::store_undo_selection(conn, command_id, selected).await
}

/// Put back the selection saved by the command's last `backward`.
///
/// Returns false if the command was never undone.
pub(crate) async fn restore_selection(conn: &mut SqliteConnection, command_id: i64, tab_id: i64) -> Result<bool> {
    match log::load_undo_selection(conn, command_id).await? {
        Some(selected) => {
            storage::set_tab_selection(conn, tab_id, selected).await?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::clamp_selection;

    #[test]
    fn selection_is_clamped_to_live_steps() {
        assert_eq!(clamp_selection(Some(42), 2), Some(1));
        assert_eq!(clamp_selection(Some(-3), 2), Some(0));
        assert_eq!(clamp_selection(Some(1), 2), Some(1));
        assert_eq!(clamp_selection(None, 2), None);
        assert_eq!(clamp_selection(Some(0), 0), None);
    }
}
