//! Stepwise: reversible edit history for step-based data workflows
//!
//! Every edit to a workflow is recorded as a command in a linear,
//! doubly linked chain that can be undone and redone exactly, while
//! downstream steps are marked stale for re-rendering.

// Environment-driven configuration
pub mod config;

// Error types shared across the crate
pub mod error;

// Workflow aggregate - workflows, tabs, steps, storage and locking
pub mod workflow;

// Reversible command variants and the history chain
pub mod commands;

// History service, notifications and integrity audit
pub mod runtime;

// Re-export commonly used types for external consumers
pub use commands::{Command, CommandArgs, CommandKind, CreateOutcome, NoOpReason, Rejection};
pub use error::{Error, IntegrityFault, Result};
pub use runtime::{AuditReport, WorkflowHistory};
pub use workflow::{Step, Tab, Workflow};
