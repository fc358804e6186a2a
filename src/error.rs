//! Error taxonomy for the history engine
//!
//! Integrity faults and lock timeouts are fatal and bubble up untouched.
//! Benign races and validation failures are NOT errors: they come back as
//! `CreateOutcome::NoOp` / `CreateOutcome::Rejected` values instead.

use thiserror::Error;

/// Structural corruption of a workflow's history or step ordering.
///
/// None of these are expected in correct operation. They are surfaced
/// loudly and never repaired in place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFault {
    #[error("workflow {workflow_id} has no current command (missing InitWorkflow root)")]
    MissingRoot { workflow_id: i64 },

    #[error("workflow {workflow_id}: command {parent_id} has {children} children; history is a tree, not a stack")]
    Branched {
        workflow_id: i64,
        parent_id: i64,
        children: usize,
    },

    #[error("workflow {workflow_id}: cycle in history at command {command_id}")]
    Cycle { workflow_id: i64, command_id: i64 },

    #[error("workflow {workflow_id}: command {command_id} is not linked from its predecessor {prev_id:?}")]
    BrokenLink {
        workflow_id: i64,
        command_id: i64,
        prev_id: Option<i64>,
    },

    #[error("workflow {workflow_id}: history root {command_id} is not an InitWorkflow command")]
    BadRoot { workflow_id: i64, command_id: i64 },

    #[error("command {command_id} has no captured stale markers to restore")]
    MissingPreImage { command_id: i64 },

    #[error("command {command_id} belongs to workflow {actual}, not {expected}")]
    ForeignCommand {
        command_id: i64,
        expected: i64,
        actual: i64,
    },

    #[error("step {step_id} referenced by command {command_id} no longer exists")]
    MissingStep { command_id: i64, step_id: i64 },

    #[error("step {step_id} is still referenced by {references} surviving command(s)")]
    StepStillReferenced { step_id: i64, references: i64 },

    #[error("tab {tab_id}: live step orders {orders:?} are not contiguous from zero")]
    OrderGap { tab_id: i64, orders: Vec<i64> },
}

/// Library error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("integrity fault: {0}")]
    Integrity(#[from] IntegrityFault),

    #[error("timed out after {waited_ms}ms waiting for the lock on workflow {workflow_id}")]
    LockTimeout { workflow_id: i64, waited_ms: u64 },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(i64),

    #[error("command not found: {0}")]
    CommandNotFound(i64),

    #[error("tab not found: {0}")]
    TabNotFound(i64),

    #[error("step not found: {0}")]
    StepNotFound(i64),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for faults that indicate corrupted state or a stalled lock holder
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Integrity(_) | Error::LockTimeout { .. })
    }
}

/// Result type alias for history operations
pub type Result<T> = std::result::Result<T, Error>;
