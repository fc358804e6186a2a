//! Core workflow type definitions
//!
//! Defines workflows, tabs and steps as they are persisted in SQLite.
//! These are plain snapshots: the authoritative state lives in the database
//! and is only mutated through the command log while the workflow is locked.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Root aggregate owning tabs, steps and the history chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier
    pub id: i64,
    /// Human-readable workflow name
    pub name: String,
    /// Tip of the active history path. Every well-formed workflow has one:
    /// at minimum its InitWorkflow root.
    pub current_command_id: Option<i64>,
    /// Position of the tab the user has selected
    pub selected_tab_position: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordered container of steps inside a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tab {
    pub id: i64,
    pub workflow_id: i64,
    pub name: String,
    /// Unique per workflow
    pub position: i64,
    /// Order of the selected live step, if any
    pub selected_step_position: Option<i64>,
}

/// A pipeline step (module instance) within a tab
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub tab_id: i64,
    /// Which module this step runs (e.g., "pastecsv", "loadurl")
    pub module_id_name: String,
    /// Dense zero-based position among the tab's live steps.
    /// Soft-deleted steps keep the order they had when removed.
    pub order: i64,
    /// Soft-delete flag; deleted steps are invisible to ordering and selection
    pub is_deleted: bool,
    /// Id of the last command that invalidated this step's cached output
    pub stale_marker: Option<i64>,
    /// Parameter values as a JSON object
    pub params: Value,
    pub notes: Option<String>,
    /// Version of fetched data this step currently reads
    pub stored_data_version: Option<DateTime<Utc>>,
    /// Whether the owner wants to be notified when this step's output changes
    pub notifications: bool,
    pub update_settings: UpdateSettings,
}

/// Automatic re-fetch schedule of a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSettings {
    pub auto_update_data: bool,
    pub next_update: Option<DateTime<Utc>>,
    /// Seconds between automatic fetches
    pub update_interval: i64,
}

impl Default for UpdateSettings {
    fn default() -> Self {
        Self {
            auto_update_data: false,
            next_update: None,
            update_interval: 0,
        }
    }
}

/// One `(step_id, stale_marker)` pair.
///
/// A command persists these as its pre-image before stamping steps, and
/// restores them verbatim when undone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleEntry {
    pub step_id: i64,
    pub stale_marker: Option<i64>,
}
