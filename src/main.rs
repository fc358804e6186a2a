//! Stepwise integrity audit
//!
//! Opens the configured database and audits the history chain of every
//! workflow in it. Exits non-zero if any workflow is corrupt.

use anyhow::bail;
use std::sync::Arc;
use stepwise::config::Config;
use stepwise::runtime::{TracingNotifier, WorkflowHistory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = Config::default();
    tracing::info!("Auditing {}", config.database.url);

    let history = WorkflowHistory::from_config(&config, Arc::new(TracingNotifier)).await?;

    let mut unhealthy = Vec::new();
    for workflow_id in history.storage().list_workflow_ids().await? {
        let report = history.audit(workflow_id).await?;
        if report.is_healthy() {
            tracing::info!(
                "Workflow {}: ok ({} active, {} redo)",
                workflow_id,
                report.active_commands,
                report.redo_commands
            );
        } else {
            unhealthy.push(workflow_id);
        }
    }

    if !unhealthy.is_empty() {
        bail!("{} workflow(s) failed the integrity audit: {:?}", unhealthy.len(), unhealthy);
    }

    tracing::info!("All workflows passed");
    Ok(())
}
