//! Workflow integrity audit
//!
//! Read-only check of the structural invariants the history driver relies
//! on: a single cycle-free path from the current command to an InitWorkflow
//! root, no command with two children, `next_id` links agreeing with
//! `prev_id` links, and dense `0..n-1` step orders in every tab.

use crate::commands::{log, Command, CommandKind};
use crate::error::{Error, IntegrityFault, Result};
use crate::workflow::storage;
use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet, VecDeque};

/// Findings for one workflow
#[derive(Debug, Clone, PartialEq)]
pub struct AuditReport {
    pub workflow_id: i64,
    /// Commands on the path from the root to the current command
    pub active_commands: usize,
    /// Commands reachable beyond the current command
    pub redo_commands: usize,
    pub faults: Vec<IntegrityFault>,
}

impl AuditReport {
    pub fn is_healthy(&self) -> bool {
        self.faults.is_empty()
    }
}

pub(crate) async fn audit_workflow(conn: &mut SqliteConnection, workflow_id: i64) -> Result<AuditReport> {
    let workflow = storage::fetch_workflow(conn, workflow_id)
        .await?
        .ok_or(Error::WorkflowNotFound(workflow_id))?;

    let commands = log::list_commands(conn, workflow_id).await?;
    let by_id: HashMap<i64, &Command> = commands.iter().map(|c| (c.id, c)).collect();
    let mut children: HashMap<i64, Vec<i64>> = HashMap::new();
    for command in &commands {
        if let Some(prev_id) = command.prev_id {
            children.entry(prev_id).or_default().push(command.id);
        }
    }

    let mut faults = Vec::new();
    let check_children = |id: i64, faults: &mut Vec<IntegrityFault>| {
        let kids = children.get(&id).map(Vec::as_slice).unwrap_or_default();
        let Some(command) = by_id.get(&id) else {
            return kids.to_vec();
        };
        if kids.len() > 1 {
            faults.push(IntegrityFault::Branched {
                workflow_id,
                parent_id: id,
                children: kids.len(),
            });
        }
        let expected_next = kids.first().copied();
        if kids.len() <= 1 && command.next_id != expected_next {
            faults.push(IntegrityFault::BrokenLink {
                workflow_id,
                command_id: expected_next.or(command.next_id).unwrap_or(id),
                prev_id: Some(id),
            });
        }
        kids.to_vec()
    };

    // Walk back from the current command to the root
    let mut active = HashSet::new();
    match workflow.current_command_id {
        None => faults.push(IntegrityFault::MissingRoot { workflow_id }),
        Some(current_id) => {
            let mut cursor = Some(current_id);
            let mut child_of_cursor: Option<i64> = None;
            while let Some(id) = cursor {
                let Some(command) = by_id.get(&id) else {
                    faults.push(IntegrityFault::BrokenLink {
                        workflow_id,
                        command_id: child_of_cursor.unwrap_or(id),
                        prev_id: Some(id),
                    });
                    break;
                };
                if !active.insert(id) {
                    faults.push(IntegrityFault::Cycle { workflow_id, command_id: id });
                    break;
                }
                if id != current_id {
                    check_children(id, &mut faults);
                }
                if command.prev_id.is_none() && command.kind != CommandKind::InitWorkflow {
                    faults.push(IntegrityFault::BadRoot { workflow_id, command_id: id });
                }
                child_of_cursor = Some(id);
                cursor = command.prev_id;
            }
        }
    }

    // Everything hanging off the current command is the redo branch
    let mut redo = HashSet::new();
    if let Some(current_id) = workflow.current_command_id.filter(|id| by_id.contains_key(id)) {
        let mut queue = VecDeque::from([current_id]);
        while let Some(id) = queue.pop_front() {
            for kid in check_children(id, &mut faults) {
                if !active.contains(&kid) && redo.insert(kid) {
                    queue.push_back(kid);
                }
            }
        }
    }

    for tab_id in storage::tab_ids(conn, workflow_id).await? {
        let orders: Vec<i64> = storage::live_step_orders(conn, tab_id)
            .await?
            .into_iter()
            .map(|(_, order)| order)
            .collect();
        if orders.iter().copied().ne(0..orders.len() as i64) {
            faults.push(IntegrityFault::OrderGap { tab_id, orders });
        }
    }

    for fault in &faults {
        tracing::error!("Audit of workflow {}: {}", workflow_id, fault);
    }

    Ok(AuditReport {
        workflow_id,
        active_commands: active.len(),
        redo_commands: redo.len(),
        faults,
    })
}
