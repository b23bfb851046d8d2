//! Sink traits for status snapshots and sub-DAG lookups.
//!
//! The execution core is polymorphic over where snapshots go: an attempt
//! store on disk, a daemon API, or a coordinator RPC stream. Implement
//! [`StatusWriter`] to receive a full [`DagRunStatus`] after every progress
//! event; the writer is responsible for idempotence and ordering on its sink.
//!
//! [`Database`] is the lookup interface the sub-DAG executor polls to learn a
//! child run's status.

use crate::error::{ModelError, Result};
use crate::status::{DagRunRef, DagRunStatus};
use async_trait::async_trait;
use parking_lot::RwLock;

/// Receives full status snapshots as a run progresses.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    /// Persist or forward one snapshot. Snapshots for one run arrive in
    /// emission order; the latest snapshot supersedes earlier ones.
    async fn write(&self, status: &DagRunStatus) -> Result<()>;
}

/// Status lookups for child DAG runs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Fetch the latest status of a child run under `parent`.
    async fn get_child_run_status(
        &self,
        parent: &DagRunRef,
        child_run_id: &str,
    ) -> Result<DagRunStatus>;
}

/// In-memory [`StatusWriter`] keeping every snapshot, newest last.
///
/// Intended for tests and for embedding callers that only need the final
/// snapshot.
#[derive(Default)]
pub struct InMemoryStatusWriter {
    snapshots: RwLock<Vec<DagRunStatus>>,
}

impl InMemoryStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent snapshot, if any was written.
    pub fn latest(&self) -> Option<DagRunStatus> {
        self.snapshots.read().last().cloned()
    }

    /// All snapshots written so far, in order.
    pub fn all(&self) -> Vec<DagRunStatus> {
        self.snapshots.read().clone()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }
}

#[async_trait]
impl StatusWriter for InMemoryStatusWriter {
    async fn write(&self, status: &DagRunStatus) -> Result<()> {
        self.snapshots.write().push(status.clone());
        Ok(())
    }
}

/// In-memory [`Database`] storing child-run snapshots keyed by run ID.
#[derive(Default)]
pub struct InMemoryDatabase {
    runs: RwLock<Vec<DagRunStatus>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a child-run snapshot.
    pub fn put(&self, status: DagRunStatus) {
        let mut runs = self.runs.write();
        runs.retain(|r| r.dag_run_id != status.dag_run_id);
        runs.push(status);
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn get_child_run_status(
        &self,
        _parent: &DagRunRef,
        child_run_id: &str,
    ) -> Result<DagRunStatus> {
        self.runs
            .read()
            .iter()
            .find(|r| r.dag_run_id == child_run_id)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(format!("child run '{}'", child_run_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RunStatus;

    #[tokio::test]
    async fn memory_writer_keeps_snapshots_in_order() {
        let writer = InMemoryStatusWriter::new();
        for (i, status) in [RunStatus::Running, RunStatus::Succeeded].iter().enumerate() {
            let snap = DagRunStatus {
                dag_run_id: "run-1".to_string(),
                attempt_id: format!("att-{}", i),
                status: *status,
                ..Default::default()
            };
            writer.write(&snap).await.unwrap();
        }
        assert_eq!(writer.len(), 2);
        assert_eq!(writer.latest().unwrap().status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn memory_database_lookup() {
        let db = InMemoryDatabase::new();
        db.put(DagRunStatus {
            dag_run_id: "child-1".to_string(),
            status: RunStatus::Running,
            ..Default::default()
        });

        let parent = DagRunRef::new("parent", "run-0");
        let found = db.get_child_run_status(&parent, "child-1").await.unwrap();
        assert_eq!(found.status, RunStatus::Running);

        let missing = db.get_child_run_status(&parent, "child-2").await;
        assert!(matches!(missing, Err(ModelError::NotFound(_))));
    }
}
