//! Workflow history service: create, undo, redo
//!
//! Every mutation follows the same shape:
//! 1. take the workflow's cooperative lock
//! 2. open a transaction and claim the workflow row
//! 3. check pre-conditions / walk the chain, apply forward or backward
//! 4. commit, release the lock
//! 5. notify collaborators (fire-and-forget)
//!
//! Any error before the commit drops the transaction, which rolls it back,
//! and the lock guard is released on the way out.

use crate::commands::{
    self, init, log, Command, CommandArgs, CommandKind, CreateOutcome, Prepared, RenderPolicy,
};
use crate::config::Config;
use crate::error::{Error, IntegrityFault, Result};
use crate::runtime::audit::{self, AuditReport};
use crate::runtime::notify::Notifier;
use crate::workflow::storage;
use crate::workflow::types::{StaleEntry, UpdateSettings, Workflow};
use crate::workflow::{WorkflowLocks, WorkflowStorage};
use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::Arc;

/// Which way a command was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Backward => "backward",
        }
    }
}

/// Entry point for editing workflows through the reversible command log
#[derive(Clone)]
pub struct WorkflowHistory {
    storage: WorkflowStorage,
    locks: Arc<WorkflowLocks>,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for WorkflowHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHistory")
            .field("storage", &self.storage)
            .field("locks", &self.locks)
            .finish_non_exhaustive()
    }
}

impl WorkflowHistory {
    pub fn new(storage: WorkflowStorage, locks: Arc<WorkflowLocks>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            storage,
            locks,
            notifier,
        }
    }

    /// Open the configured database, apply the schema and build the service
    pub async fn from_config(config: &Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
        if let Some(path) = config.database.url.strip_prefix("sqlite://") {
            if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::Config(format!("failed to create data directory '{}': {}", parent.display(), e))
                })?;
            }
        }

        let storage = WorkflowStorage::connect(&config.database).await?;
        storage.init_schema().await?;
        let locks = Arc::new(WorkflowLocks::new(config.lock_timeout()));
        Ok(Self::new(storage, locks, notifier))
    }

    pub fn storage(&self) -> &WorkflowStorage {
        &self.storage
    }

    /// Create a workflow, its first tab and its InitWorkflow root atomically
    pub async fn init_workflow(&self, name: &str) -> Result<Workflow> {
        let mut tx = self.storage.pool().begin().await?;
        let (workflow_id, root) = init::create_workflow(&mut tx, name).await?;
        let workflow = storage::fetch_workflow(&mut tx, workflow_id)
            .await?
            .ok_or(Error::WorkflowNotFound(workflow_id))?;
        tx.commit().await?;

        tracing::info!("Created workflow {} ({}) with root command {}", workflow_id, name, root.id);
        Ok(workflow)
    }

    /// Check pre-conditions, append a command and apply it, all under the lock.
    ///
    /// `NoOp` and `Rejected` outcomes leave the database untouched.
    pub async fn create(&self, workflow_id: i64, args: CommandArgs) -> Result<CreateOutcome> {
        let lock = self.locks.acquire(workflow_id).await?;
        let mut tx = self.storage.pool().begin().await?;
        let workflow = storage::lock_workflow_row(&mut tx, workflow_id).await?;

        let kind = match commands::prepare(&mut tx, workflow_id, args).await? {
            Prepared::Ready(kind) => kind,
            Prepared::NoOp(reason) => {
                tracing::info!("Workflow {}: command skipped ({:?})", workflow_id, reason);
                return Ok(CreateOutcome::NoOp(reason));
            }
            Prepared::Rejected(rejection) => {
                tracing::warn!("Workflow {}: command rejected ({:?})", workflow_id, rejection);
                return Ok(CreateOutcome::Rejected(rejection));
            }
        };

        let appended = log::append(&mut tx, &workflow, kind)
            .await
            .map_err(|e| surface(workflow_id, "append", e))?;
        let stamped = appended
            .forward(&mut tx)
            .await
            .map_err(|e| surface(workflow_id, "forward", e))?;
        let render = appended.kind.render_policy(&mut tx, workflow_id).await?;
        let command = log::load_command(&mut tx, workflow_id, appended.id).await?;
        tx.commit().await?;
        drop(lock);

        tracing::info!(
            "Workflow {}: applied command {} ({})",
            workflow_id,
            command.id,
            command.describe()
        );
        self.announce(workflow_id, &command, Direction::Forward, command.id, &stamped, render);
        Ok(CreateOutcome::Applied(command))
    }

    /// Revert the current command and step back to its predecessor.
    ///
    /// Returns the reverted command, or `None` at the InitWorkflow root.
    pub async fn undo(&self, workflow_id: i64) -> Result<Option<Command>> {
        let lock = self.locks.acquire(workflow_id).await?;
        let mut tx = self.storage.pool().begin().await?;
        let workflow = storage::lock_workflow_row(&mut tx, workflow_id).await?;

        let current_id = workflow
            .current_command_id
            .ok_or(IntegrityFault::MissingRoot { workflow_id })
            .map_err(|e| surface(workflow_id, "undo", e.into()))?;
        let command = log::load_command(&mut tx, workflow_id, current_id).await?;

        if command.kind == CommandKind::InitWorkflow {
            tracing::debug!("Workflow {}: nothing to undo", workflow_id);
            return Ok(None);
        }

        let prev_id = match command.prev_id {
            Some(prev_id) => prev_id,
            None => {
                let fault = IntegrityFault::BadRoot {
                    workflow_id,
                    command_id: command.id,
                };
                return Err(surface(workflow_id, "undo", fault.into()));
            }
        };
        let prev = log::load_command(&mut tx, workflow_id, prev_id).await?;
        if prev.next_id != Some(command.id) {
            let fault = IntegrityFault::BrokenLink {
                workflow_id,
                command_id: command.id,
                prev_id: Some(prev_id),
            };
            return Err(surface(workflow_id, "undo", fault.into()));
        }

        let restored = command
            .backward(&mut tx)
            .await
            .map_err(|e| surface(workflow_id, "backward", e))?;
        storage::set_current_command(&mut tx, workflow_id, Some(prev_id)).await?;
        let render = command.kind.render_policy(&mut tx, workflow_id).await?;
        tx.commit().await?;
        drop(lock);

        tracing::info!("Workflow {}: undid command {} ({})", workflow_id, command.id, command.describe());
        self.announce(workflow_id, &command, Direction::Backward, prev_id, &restored, render);
        Ok(Some(command))
    }

    /// Re-apply the single command after the current one.
    ///
    /// Returns the re-applied command, or `None` if there is nothing to redo.
    pub async fn redo(&self, workflow_id: i64) -> Result<Option<Command>> {
        let lock = self.locks.acquire(workflow_id).await?;
        let mut tx = self.storage.pool().begin().await?;
        let workflow = storage::lock_workflow_row(&mut tx, workflow_id).await?;

        let current_id = workflow
            .current_command_id
            .ok_or(IntegrityFault::MissingRoot { workflow_id })
            .map_err(|e| surface(workflow_id, "redo", e.into()))?;

        let children = log::child_ids(&mut tx, workflow_id, current_id).await?;
        let next_id = match children.as_slice() {
            [] => {
                tracing::debug!("Workflow {}: nothing to redo", workflow_id);
                return Ok(None);
            }
            [only] => *only,
            many => {
                let fault = IntegrityFault::Branched {
                    workflow_id,
                    parent_id: current_id,
                    children: many.len(),
                };
                return Err(surface(workflow_id, "redo", fault.into()));
            }
        };

        let current = log::load_command(&mut tx, workflow_id, current_id).await?;
        if current.next_id != Some(next_id) {
            let fault = IntegrityFault::BrokenLink {
                workflow_id,
                command_id: next_id,
                prev_id: Some(current_id),
            };
            return Err(surface(workflow_id, "redo", fault.into()));
        }

        let command = log::load_command(&mut tx, workflow_id, next_id).await?;
        let stamped = command
            .forward(&mut tx)
            .await
            .map_err(|e| surface(workflow_id, "forward", e))?;
        storage::set_current_command(&mut tx, workflow_id, Some(next_id)).await?;
        let render = command.kind.render_policy(&mut tx, workflow_id).await?;
        tx.commit().await?;
        drop(lock);

        tracing::info!("Workflow {}: redid command {} ({})", workflow_id, command.id, command.describe());
        self.announce(workflow_id, &command, Direction::Forward, next_id, &stamped, render);
        Ok(Some(command))
    }

    pub async fn add_step(
        &self,
        workflow_id: i64,
        tab_id: i64,
        module_id_name: &str,
        position: i64,
        params: Value,
    ) -> Result<CreateOutcome> {
        self.create(
            workflow_id,
            CommandArgs::AddStep {
                tab_id,
                module_id_name: module_id_name.to_string(),
                position,
                params,
            },
        )
        .await
    }

    pub async fn delete_step(&self, workflow_id: i64, step_id: i64) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::DeleteStep { step_id }).await
    }

    pub async fn reorder_steps(&self, workflow_id: i64, tab_id: i64, step_ids: Vec<i64>) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::ReorderSteps { tab_id, step_ids }).await
    }

    /// Typically called by a fetch once it has stored a new data version
    pub async fn change_data_version(
        &self,
        workflow_id: i64,
        step_id: i64,
        version: DateTime<Utc>,
    ) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::ChangeDataVersion { step_id, version })
            .await
    }

    pub async fn change_parameters(
        &self,
        workflow_id: i64,
        step_id: i64,
        values: Map<String, Value>,
    ) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::ChangeParameters { step_id, values })
            .await
    }

    pub async fn change_notes(&self, workflow_id: i64, step_id: i64, notes: Option<String>) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::ChangeNotes { step_id, notes }).await
    }

    pub async fn change_update_settings(
        &self,
        workflow_id: i64,
        step_id: i64,
        settings: UpdateSettings,
    ) -> Result<CreateOutcome> {
        self.create(workflow_id, CommandArgs::ChangeUpdateSettings { step_id, settings })
            .await
    }

    /// Select a step of a tab by its order, or clear the selection.
    ///
    /// Selection is not part of the undo history, but it is written under the
    /// workflow lock so it never interleaves with a command. Positions outside
    /// the tab's live steps are clamped; returns what was stored.
    pub async fn select_step(&self, workflow_id: i64, tab_id: i64, position: Option<i64>) -> Result<Option<i64>> {
        let _lock = self.locks.acquire(workflow_id).await?;
        let mut tx = self.storage.pool().begin().await?;
        storage::lock_workflow_row(&mut tx, workflow_id).await?;

        match storage::fetch_tab(&mut tx, tab_id).await? {
            Some(tab) if tab.workflow_id == workflow_id => {}
            _ => return Err(Error::TabNotFound(tab_id)),
        }
        let live = storage::count_live_steps(&mut tx, tab_id).await?;
        let selected = commands::clamp_selection(position, live);
        if selected != position {
            tracing::debug!("Tab {}: selection {:?} clamped to {:?}", tab_id, position, selected);
        }
        storage::set_tab_selection(&mut tx, tab_id, selected).await?;
        tx.commit().await?;
        Ok(selected)
    }

    /// Toggle whether a step's owner wants change notifications.
    ///
    /// Not undoable; it only steers how data version changes render.
    pub async fn set_step_notifications(&self, workflow_id: i64, step_id: i64, enabled: bool) -> Result<()> {
        let _lock = self.locks.acquire(workflow_id).await?;
        let mut tx = self.storage.pool().begin().await?;
        storage::lock_workflow_row(&mut tx, workflow_id).await?;

        if storage::fetch_step_in_workflow(&mut tx, workflow_id, step_id).await?.is_none() {
            return Err(Error::StepNotFound(step_id));
        }
        storage::set_step_notifications(&mut tx, step_id, enabled).await?;
        tx.commit().await?;

        tracing::info!("Step {}: notifications {}", step_id, if enabled { "on" } else { "off" });
        Ok(())
    }

    /// Every stored command of the workflow, oldest first
    pub async fn list_commands(&self, workflow_id: i64) -> Result<Vec<Command>> {
        let mut conn = self.storage.pool().acquire().await?;
        log::list_commands(&mut conn, workflow_id).await
    }

    /// Check the workflow's chain and step orders without changing anything
    pub async fn audit(&self, workflow_id: i64) -> Result<AuditReport> {
        let mut tx = self.storage.pool().begin().await?;
        let report = audit::audit_workflow(&mut tx, workflow_id).await?;
        tx.rollback().await?;
        Ok(report)
    }

    /// Tell collaborators what changed. Called only after commit and unlock.
    fn announce(
        &self,
        workflow_id: i64,
        command: &Command,
        direction: Direction,
        current_command_id: i64,
        stale: &[StaleEntry],
        render: RenderPolicy,
    ) {
        self.notifier.notify_listeners(
            workflow_id,
            json!({
                "type": "apply_delta",
                "command_id": command.id,
                "current_command_id": current_command_id,
                "direction": direction.as_str(),
                "description": command.describe(),
                "stale_steps": stale,
            }),
        );

        match render {
            RenderPolicy::Skip => {}
            RenderPolicy::Full => self.notifier.schedule_render(workflow_id, current_command_id),
            RenderPolicy::LazyIfListening => self.notifier.notify_listeners(
                workflow_id,
                json!({
                    "type": "queue_render_if_listening",
                    "current_command_id": current_command_id,
                }),
            ),
        }
    }
}

/// Log fatal errors loudly before they propagate
fn surface(workflow_id: i64, operation: &str, error: Error) -> Error {
    if error.is_fatal() {
        tracing::error!("Workflow {}: {} failed: {}", workflow_id, operation, error);
    }
    error
}
