//! Cooperative per-workflow locking
//!
//! Every history mutation (create, forward, backward, undo, redo) of one
//! workflow runs while holding that workflow's lock. Different workflows never
//! contend. The guard releases on drop, so early returns and `?` paths unlock
//! too.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Registry of per-workflow mutexes
///
/// LAZY: a workflow's mutex is created the first time anyone locks it.
/// Idle mutexes are dropped whenever a new workflow is added, so the map
/// only tracks workflows that are locked or being waited on.
#[derive(Debug)]
pub struct WorkflowLocks {
    locks: RwLock<HashMap<i64, Arc<Mutex<()>>>>,
    timeout: Duration,
}

/// Exclusive hold on one workflow
#[derive(Debug)]
pub struct WorkflowLock {
    workflow_id: i64,
    _guard: OwnedMutexGuard<()>,
}

impl WorkflowLock {
    pub fn workflow_id(&self) -> i64 {
        self.workflow_id
    }
}

impl WorkflowLocks {
    /// Create a registry whose acquisitions give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the workflow's lock, waiting at most the configured timeout.
    ///
    /// A timeout means some holder stalled mid-mutation. It is reported as
    /// fatal; the caller must not retry blindly.
    pub async fn acquire(&self, workflow_id: i64) -> Result<WorkflowLock> {
        let mutex = self.mutex_for(workflow_id).await;

        match tokio::time::timeout(self.timeout, mutex.lock_owned()).await {
            Ok(guard) => {
                tracing::trace!("Locked workflow {}", workflow_id);
                Ok(WorkflowLock {
                    workflow_id,
                    _guard: guard,
                })
            }
            Err(_) => {
                let waited_ms = self.timeout.as_millis() as u64;
                tracing::error!(
                    "Lock on workflow {} not released within {}ms; holder presumed stalled",
                    workflow_id,
                    waited_ms
                );
                Err(Error::LockTimeout {
                    workflow_id,
                    waited_ms,
                })
            }
        }
    }

    async fn mutex_for(&self, workflow_id: i64) -> Arc<Mutex<()>> {
        // Try read lock first (fast path for known workflows)
        {
            let locks = self.locks.read().await;
            if let Some(mutex) = locks.get(&workflow_id) {
                return Arc::clone(mutex);
            }
        }

        // Double-check: another task may have inserted it meanwhile
        let mut locks = self.locks.write().await;
        if !locks.contains_key(&workflow_id) {
            // Only the map holds an idle mutex: no guard, no waiter
            locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        }
        Arc::clone(
            locks
                .entry(workflow_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Number of workflows with a mutex in the registry
    pub async fn tracked(&self) -> usize {
        self.locks.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = WorkflowLocks::new(Duration::from_millis(30));
        let held = locks.acquire(1).await.unwrap();
        assert_eq!(held.workflow_id(), 1);

        let err = locks.acquire(1).await.unwrap_err();
        assert!(matches!(err, Error::LockTimeout { workflow_id: 1, waited_ms: 30 }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn workflows_do_not_contend() {
        let locks = WorkflowLocks::new(Duration::from_millis(30));
        let _a = locks.acquire(1).await.unwrap();
        let _b = locks.acquire(2).await.unwrap();
        assert_eq!(locks.tracked().await, 2);
    }

    #[tokio::test]
    async fn idle_workflows_leave_the_registry() {
        let locks = WorkflowLocks::new(Duration::from_millis(30));
        drop(locks.acquire(1).await.unwrap());
        drop(locks.acquire(404).await.unwrap());
        let _held = locks.acquire(2).await.unwrap();
        assert_eq!(locks.tracked().await, 1);

        let _also = locks.acquire(3).await.unwrap();
        assert_eq!(locks.tracked().await, 2);
    }

    #[tokio::test]
    async fn dropping_the_guard_releases() {
        let locks = Arc::new(WorkflowLocks::new(Duration::from_secs(1)));
        let held = locks.acquire(7).await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire(7).await.map(|l| l.workflow_id()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);

        assert_eq!(waiter.await.unwrap().unwrap(), 7);
    }
}
