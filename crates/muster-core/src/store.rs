//! Persistence boundary for Task, Squad, and Approval records.
//!
//! The orchestration engine never talks to a database directly: it goes
//! through these traits. Updates carry the caller's expected version and
//! fail with [`StoreError::VersionConflict`] when the record moved
//! underneath them -- a lost race is surfaced, never silently
//! overwritten. [`MemoryStore`] is the reference implementation used by
//! the daemon and the test suites.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::types::{ApprovalRecord, ApprovalStatus, Squad, Task, TaskStatus};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Uuid),

    #[error("duplicate record id: {0}")]
    Duplicate(Uuid),

    #[error("version conflict on {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: Uuid,
        expected: u64,
        actual: u64,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Store traits
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    async fn create_task(&self, task: Task) -> Result<Task>;

    async fn get_task(&self, id: Uuid) -> Result<Task>;

    /// Persist `task` if the stored version still equals
    /// `expected_version`; bumps the version on success.
    async fn update_task(&self, task: Task, expected_version: u64) -> Result<Task>;

    /// Snapshot of tasks, optionally filtered by status, taken at call
    /// time.
    async fn tasks_by_status(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;
}

#[async_trait::async_trait]
pub trait SquadStore: Send + Sync {
    async fn create_squad(&self, squad: Squad) -> Result<Squad>;

    async fn get_squad(&self, id: Uuid) -> Result<Squad>;

    async fn list_squads(&self) -> Result<Vec<Squad>>;
}

#[async_trait::async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn create_approval(&self, record: ApprovalRecord) -> Result<ApprovalRecord>;

    async fn get_approval(&self, id: Uuid) -> Result<ApprovalRecord>;

    async fn update_approval(
        &self,
        record: ApprovalRecord,
        expected_version: u64,
    ) -> Result<ApprovalRecord>;

    /// The pending request for a task, if one exists. At most one may
    /// be pending per task; the gate enforces that invariant under the
    /// task's serialization lock.
    async fn pending_for_task(&self, task_id: Uuid) -> Result<Option<ApprovalRecord>>;

    async fn approvals_by_status(
        &self,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRecord>>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory reference store. Cheap to clone (shares its maps through
/// `Arc`), suitable for the daemon's default configuration and for
/// tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tasks: Arc<RwLock<HashMap<Uuid, Task>>>,
    squads: Arc<RwLock<HashMap<Uuid, Squad>>>,
    approvals: Arc<RwLock<HashMap<Uuid, ApprovalRecord>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl TaskStore for MemoryStore {
    async fn create_task(&self, task: Task) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_task(&self, mut task: Task, expected_version: u64) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let current = tasks.get(&task.id).ok_or(StoreError::NotFound(task.id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: task.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        task.version = expected_version + 1;
        task.updated_at = chrono::Utc::now();
        tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn tasks_by_status(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let tasks = self.tasks.read().await;
        let mut out: Vec<Task> = tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|t| t.created_at);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl SquadStore for MemoryStore {
    async fn create_squad(&self, squad: Squad) -> Result<Squad> {
        let mut squads = self.squads.write().await;
        if squads.contains_key(&squad.id) {
            return Err(StoreError::Duplicate(squad.id));
        }
        squads.insert(squad.id, squad.clone());
        Ok(squad)
    }

    async fn get_squad(&self, id: Uuid) -> Result<Squad> {
        self.squads
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn list_squads(&self) -> Result<Vec<Squad>> {
        let squads = self.squads.read().await;
        let mut out: Vec<Squad> = squads.values().cloned().collect();
        out.sort_by_key(|s| s.created_at);
        Ok(out)
    }
}

#[async_trait::async_trait]
impl ApprovalStore for MemoryStore {
    async fn create_approval(&self, record: ApprovalRecord) -> Result<ApprovalRecord> {
        let mut approvals = self.approvals.write().await;
        if approvals.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        approvals.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_approval(&self, id: Uuid) -> Result<ApprovalRecord> {
        self.approvals
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_approval(
        &self,
        mut record: ApprovalRecord,
        expected_version: u64,
    ) -> Result<ApprovalRecord> {
        let mut approvals = self.approvals.write().await;
        let current = approvals
            .get(&record.id)
            .ok_or(StoreError::NotFound(record.id))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                id: record.id,
                expected: expected_version,
                actual: current.version,
            });
        }
        record.version = expected_version + 1;
        approvals.insert(record.id, record.clone());
        Ok(record)
    }

    async fn pending_for_task(&self, task_id: Uuid) -> Result<Option<ApprovalRecord>> {
        let approvals = self.approvals.read().await;
        Ok(approvals
            .values()
            .find(|a| a.task_id == task_id && a.is_pending())
            .cloned())
    }

    async fn approvals_by_status(
        &self,
        status: Option<ApprovalStatus>,
    ) -> Result<Vec<ApprovalRecord>> {
        let approvals = self.approvals.read().await;
        let mut out: Vec<ApprovalRecord> = approvals
            .values()
            .filter(|a| status.map_or(true, |s| a.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|a| a.requested_at);
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
