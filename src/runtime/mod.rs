//! History Runtime
//!
//! This module drives a workflow's command log at run time:
//! - Creating commands and walking undo/redo under the workflow lock
//! - Post-commit notification of renderers and live viewers
//! - Read-only integrity audits of the history chain

// Create / undo / redo service
pub mod history;

// Render and viewer notification sinks
pub mod notify;

// Structural checks over a workflow's history
pub mod audit;

// Re-export main types
pub use audit::AuditReport;
pub use history::{Direction, WorkflowHistory};
pub use notify::{ChannelNotifier, Notification, Notifier, TracingNotifier};
