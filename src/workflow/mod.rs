//! Workflow Management Layer
//!
//! This module handles the persisted workflow aggregate:
//! - Type definitions (Workflow, Tab, Step)
//! - SQLite persistence with sqlx
//! - Per-workflow cooperative locking

// Core workflow type definitions
pub mod types;

// SQLite persistence layer for workflows, tabs and steps
pub mod storage;

// Cooperative lock serialising every history mutation of one workflow
pub mod lock;

// Re-export commonly used types
pub use lock::{WorkflowLock, WorkflowLocks};
pub use storage::WorkflowStorage;
pub use types::{StaleEntry, Step, Tab, UpdateSettings, Workflow};
