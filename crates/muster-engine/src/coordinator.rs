use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use muster_bus::{BusClient, BusError, Envelope};
use muster_core::config::ExecutionConfig;
use muster_core::store::{ApprovalStore, StoreError, TaskStore};
use muster_core::types::{
    ApprovalStatus, LifecycleActor, LifecycleEvent, Squad, Task, TaskStatus,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::state_machine::{StateMachineError, TaskEvent, TaskStateMachine};

/// Bus publish attempts before the enclosing step is failed with a
/// transport cause.
const PUBLISH_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// No squad member's role matches the task kind; the task stays
    /// `created`.
    #[error("no capable agent in squad for task {task_id}")]
    NoCapableAgent { task_id: Uuid },

    /// The caller lost a race: the task moved since it was read. Re-read
    /// and retry with fresh state.
    #[error("transition conflict on task {task_id}: expected {expected}, found {actual}")]
    Conflict {
        task_id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("retries exhausted for task {task_id} ({count} of {max})")]
    RetriesExhausted { task_id: Uuid, count: u32, max: u32 },

    #[error(transparent)]
    StateMachine(#[from] StateMachineError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("bus delivery failed after {attempts} attempts: {source}")]
    Delivery { attempts: u32, source: BusError },
}

pub type Result<T> = std::result::Result<T, CoordinatorError>;

// ---------------------------------------------------------------------------
// TaskLocks
// ---------------------------------------------------------------------------

/// Per-task serialization points. The coordinator and the approval gate
/// share one instance, so the pending-approval invariant and status
/// transitions are guarded by the same lock. Tasks with different ids
/// proceed fully in parallel.
#[derive(Default)]
pub struct TaskLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl TaskLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_task(&self, task_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Returned from assignment: which agents were told about the task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_id: Uuid,
    pub squad_id: Uuid,
    pub assignees: Vec<Uuid>,
}

// ---------------------------------------------------------------------------
// SquadCoordinator
// ---------------------------------------------------------------------------

/// The single transition authority for a squad's tasks.
///
/// One instance per squad, explicitly constructed and passed by
/// reference to collaborators -- there is no process-wide registry. All
/// status mutations go through [`SquadCoordinator::record_transition`]
/// (or its lock-holding variant used by the approval gate), which
/// serializes per task id, rejects stale `from` states with
/// [`CoordinatorError::Conflict`], and appends the lifecycle event
/// before the task leaves its critical section.
pub struct SquadCoordinator {
    squad: Squad,
    tasks: Arc<dyn TaskStore>,
    approvals: Arc<dyn ApprovalStore>,
    bus: BusClient,
    locks: Arc<TaskLocks>,
    /// Identity used as envelope sender for coordinator-originated
    /// messages (assignment announcements, approved-action redelivery).
    id: Uuid,
    seq: AtomicU64,
    execution: ExecutionConfig,
    cancel_flags: DashMap<Uuid, watch::Sender<bool>>,
}

impl SquadCoordinator {
    pub fn new(
        squad: Squad,
        tasks: Arc<dyn TaskStore>,
        approvals: Arc<dyn ApprovalStore>,
        bus: BusClient,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            squad,
            tasks,
            approvals,
            bus,
            locks: Arc::new(TaskLocks::new()),
            id: Uuid::new_v4(),
            seq: AtomicU64::new(0),
            execution,
            cancel_flags: DashMap::new(),
        }
    }

    pub fn squad(&self) -> &Squad {
        &self.squad
    }

    pub(crate) fn locks(&self) -> Arc<TaskLocks> {
        self.locks.clone()
    }

    // -----------------------------------------------------------------------
    // Assignment
    // -----------------------------------------------------------------------

    /// Map the task to the squad members capable of acting on it and
    /// announce the assignment on the bus.
    pub async fn assign_task(&self, task_id: Uuid) -> Result<TaskHandle> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;

        let task = self.tasks.get_task(task_id).await?;
        let capable: Vec<Uuid> = self
            .squad
            .capable_members(task.kind)
            .iter()
            .map(|m| m.agent_id)
            .collect();
        if capable.is_empty() {
            return Err(CoordinatorError::NoCapableAgent { task_id });
        }

        let task = self
            .apply_locked(
                task,
                TaskEvent::Assign,
                format!("assigned to squad '{}'", self.squad.name),
                LifecycleActor::System,
            )
            .await?;

        let envelope = self.make_envelope(
            "task_assignment",
            capable.clone(),
            serde_json::json!({
                "task_id": task.id,
                "title": task.title,
                "kind": task.kind,
                "priority": task.priority,
            }),
            Uuid::new_v4(),
        );
        if let Err(err) = self.publish_with_retry(envelope).await {
            // The failure must reach the audit trail before it reaches
            // the caller.
            if let Err(audit_err) = self
                .apply_locked(
                    self.tasks.get_task(task_id).await?,
                    TaskEvent::Fail,
                    format!("transport failure announcing assignment: {err}"),
                    LifecycleActor::System,
                )
                .await
            {
                tracing::error!(
                    task_id = %task_id,
                    error = %audit_err,
                    "could not record transport failure in the audit trail"
                );
            }
            return Err(err);
        }

        tracing::info!(
            task_id = %task_id,
            squad = %self.squad.name,
            assignees = capable.len(),
            "task assigned"
        );
        Ok(TaskHandle {
            task_id,
            squad_id: self.squad.id,
            assignees: capable,
        })
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Apply one lifecycle event, serialized per task. `from` is the
    /// status the caller last observed; if the task has moved since,
    /// the call fails with [`CoordinatorError::Conflict`] and nothing
    /// is written.
    pub async fn record_transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        event: TaskEvent,
        cause: impl Into<String>,
        actor: LifecycleActor,
    ) -> Result<Task> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;
        self.transition_locked(task_id, from, event, cause, actor)
            .await
    }

    /// Variant for callers already inside the task's critical section
    /// (the approval gate shares the lock map).
    pub(crate) async fn transition_locked(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        event: TaskEvent,
        cause: impl Into<String>,
        actor: LifecycleActor,
    ) -> Result<Task> {
        let task = self.tasks.get_task(task_id).await?;
        if task.status != from {
            return Err(CoordinatorError::Conflict {
                task_id,
                expected: from,
                actual: task.status,
            });
        }
        self.apply_locked(task, event, cause, actor).await
    }

    async fn apply_locked(
        &self,
        mut task: Task,
        event: TaskEvent,
        cause: impl Into<String>,
        actor: LifecycleActor,
    ) -> Result<Task> {
        let mut sm = TaskStateMachine::resume(task.status);
        let next = sm.transition(event)?;
        let cause = cause.into();
        task.events
            .push(LifecycleEvent::new(task.status, next, cause.clone(), actor));
        let from = task.status;
        task.status = next;
        let version = task.version;
        let task = self.tasks.update_task(task, version).await?;
        tracing::info!(task_id = %task.id, from = %from, to = %next, cause = %cause, "task transition recorded");
        Ok(task)
    }

    /// Explicit failed -> in_progress re-entry. Counts against the
    /// retry budget; once the budget is spent, `failed` is terminal.
    pub async fn retry_task(&self, task_id: Uuid, max_retries: u32) -> Result<Task> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;

        let mut task = self.tasks.get_task(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(CoordinatorError::Conflict {
                task_id,
                expected: TaskStatus::Failed,
                actual: task.status,
            });
        }
        if task.retry_count >= max_retries {
            return Err(CoordinatorError::RetriesExhausted {
                task_id,
                count: task.retry_count,
                max: max_retries,
            });
        }
        task.retry_count += 1;
        let cause = format!("retry {} of {}", task.retry_count, max_retries);
        self.reset_cancel(task_id);
        self.apply_locked(task, TaskEvent::Retry, cause, LifecycleActor::System)
            .await
    }

    /// Cancel from any non-terminal state: rejects the pending approval
    /// (if one exists), trips the cancel flag so the supervisor stops at
    /// its next safe checkpoint, and records the transition.
    pub async fn cancel_task(&self, task_id: Uuid, cause: impl Into<String>) -> Result<Task> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;

        let cause = cause.into();
        if let Some(mut pending) = self.approvals.pending_for_task(task_id).await? {
            pending.status = ApprovalStatus::Rejected;
            pending.resolved_at = Some(chrono::Utc::now());
            pending.resolver = Some("system".to_string());
            let version = pending.version;
            self.approvals.update_approval(pending, version).await?;
            tracing::info!(task_id = %task_id, "pending approval rejected by cancellation");
        }

        // The flag must flip even when no supervisor has subscribed yet;
        // a run started after the cancellation observes it at its first
        // checkpoint.
        self.cancel_flags
            .entry(task_id)
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(true);

        let task = self.tasks.get_task(task_id).await?;
        self.apply_locked(task, TaskEvent::Cancel, cause, LifecycleActor::System)
            .await
    }

    /// Bump the retry counter for a supervisor re-attempt after a
    /// transient execution failure. The status does not change; the
    /// audit log records the reason as an in-place annotation.
    pub(crate) async fn note_execution_retry(
        &self,
        task_id: Uuid,
        reason: impl Into<String>,
    ) -> Result<Task> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;

        let mut task = self.tasks.get_task(task_id).await?;
        task.retry_count += 1;
        task.events.push(LifecycleEvent::new(
            task.status,
            task.status,
            reason.into(),
            LifecycleActor::System,
        ));
        let version = task.version;
        Ok(self.tasks.update_task(task, version).await?)
    }

    /// Snapshot of the squad's non-terminal tasks at call time.
    pub async fn list_active_tasks(&self) -> Result<Vec<Task>> {
        let tasks = self.tasks.tasks_by_status(None).await?;
        Ok(tasks
            .into_iter()
            .filter(|t| t.squad_id == Some(self.squad.id) && !t.status.is_terminal())
            .collect())
    }

    // -----------------------------------------------------------------------
    // Cancellation flags
    // -----------------------------------------------------------------------

    /// Watch half of the task's cancel flag; the supervisor polls it at
    /// attempt boundaries.
    pub fn cancel_watch(&self, task_id: Uuid) -> watch::Receiver<bool> {
        self.cancel_flags
            .entry(task_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub fn is_cancelled(&self, task_id: Uuid) -> bool {
        self.cancel_flags
            .get(&task_id)
            .map(|flag| *flag.subscribe().borrow())
            .unwrap_or(false)
    }

    fn reset_cancel(&self, task_id: Uuid) {
        if let Some(flag) = self.cancel_flags.get(&task_id) {
            flag.send_replace(false);
        }
    }

    // -----------------------------------------------------------------------
    // Bus plumbing
    // -----------------------------------------------------------------------

    pub(crate) fn make_envelope(
        &self,
        action: impl Into<String>,
        recipients: Vec<Uuid>,
        payload: serde_json::Value,
        correlation_id: Uuid,
    ) -> Envelope {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        Envelope::new(action, self.id, recipients, payload, correlation_id, seq)
    }

    /// Publish with exponential backoff. Exhaustion surfaces as
    /// [`CoordinatorError::Delivery`]; the caller fails the enclosing
    /// step with a transport cause.
    pub(crate) async fn publish_with_retry(&self, envelope: Envelope) -> Result<()> {
        let mut delay = Duration::from_millis(self.execution.backoff_base_ms);
        let mut last = None;
        for attempt in 1..=PUBLISH_ATTEMPTS {
            match self.bus.publish(envelope.clone()) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "bus publish failed");
                    last = Some(err);
                    if attempt < PUBLISH_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay = delay.mul_f64(self.execution.backoff_factor);
                    }
                }
            }
        }
        Err(CoordinatorError::Delivery {
            attempts: PUBLISH_ATTEMPTS,
            source: last.unwrap_or(BusError::Closed),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::store::MemoryStore;
    use muster_core::types::{AgentRole, SquadMember, TaskKind, TaskPriority};

    fn squad() -> Squad {
        Squad::new(
            "core",
            Uuid::new_v4(),
            vec![
                SquadMember::new("backend-1", AgentRole::Backend),
                SquadMember::new("qa-1", AgentRole::Qa),
            ],
        )
        .unwrap()
    }

    fn coordinator(store: &MemoryStore, squad: Squad, bus: BusClient) -> SquadCoordinator {
        SquadCoordinator::new(
            squad,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            bus,
            ExecutionConfig {
                backoff_base_ms: 1,
                ..ExecutionConfig::default()
            },
        )
    }

    async fn stored_task(store: &MemoryStore, squad_id: Uuid, kind: TaskKind) -> Task {
        let task = Task::new("fix login", kind, TaskPriority::High, Uuid::new_v4())
            .with_squad(squad_id);
        store.create_task(task).await.unwrap()
    }

    #[tokio::test]
    async fn assign_announces_to_capable_members() {
        let store = MemoryStore::new();
        let bus = BusClient::new();
        let squad = squad();
        let backend_id = squad.members()[0].agent_id;
        let qa_id = squad.members()[1].agent_id;
        let backend_rx = bus.register(backend_id);
        let qa_rx = bus.register(qa_id);
        let coord = coordinator(&store, squad.clone(), bus);

        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        let handle = coord.assign_task(task.id).await.unwrap();

        // Bug: both backend and qa are capable.
        assert_eq!(handle.assignees.len(), 2);
        assert_eq!(backend_rx.try_iter().count(), 1);
        assert_eq!(qa_rx.try_iter().count(), 1);

        let stored = store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Assigned);
        assert_eq!(stored.events.len(), 1);
        assert_eq!(stored.events[0].to, TaskStatus::Assigned);
    }

    #[tokio::test]
    async fn assign_fails_without_capable_role() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());

        // No docs role in the squad.
        let task = stored_task(&store, squad.id, TaskKind::Documentation).await;
        let err = coord.assign_task(task.id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::NoCapableAgent { .. }));

        // Task stays created; nothing was written.
        let stored = store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Created);
        assert!(stored.events.is_empty());
    }

    #[tokio::test]
    async fn stale_from_state_conflicts() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();

        // A caller still believing the task is `created` loses the race.
        let err = coord
            .record_transition(
                task.id,
                TaskStatus::Created,
                TaskEvent::Assign,
                "stale",
                LifecycleActor::System,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn concurrent_transitions_one_wins() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = Arc::new(coordinator(&store, squad.clone(), BusClient::new()));
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();

        let a = {
            let coord = coord.clone();
            let id = task.id;
            tokio::spawn(async move {
                coord
                    .record_transition(
                        id,
                        TaskStatus::Assigned,
                        TaskEvent::Start,
                        "start a",
                        LifecycleActor::System,
                    )
                    .await
            })
        };
        let b = {
            let coord = coord.clone();
            let id = task.id;
            tokio::spawn(async move {
                coord
                    .record_transition(
                        id,
                        TaskStatus::Assigned,
                        TaskEvent::Start,
                        "start b",
                        LifecycleActor::System,
                    )
                    .await
            })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(CoordinatorError::Conflict { .. })))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(conflicts, 1);
    }

    #[tokio::test]
    async fn retry_respects_budget() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();
        coord
            .record_transition(
                task.id,
                TaskStatus::Assigned,
                TaskEvent::Start,
                "start",
                LifecycleActor::System,
            )
            .await
            .unwrap();
        coord
            .record_transition(
                task.id,
                TaskStatus::InProgress,
                TaskEvent::Fail,
                "boom",
                LifecycleActor::System,
            )
            .await
            .unwrap();

        let retried = coord.retry_task(task.id, 1).await.unwrap();
        assert_eq!(retried.status, TaskStatus::InProgress);
        assert_eq!(retried.retry_count, 1);

        coord
            .record_transition(
                task.id,
                TaskStatus::InProgress,
                TaskEvent::Fail,
                "boom again",
                LifecycleActor::System,
            )
            .await
            .unwrap();
        let err = coord.retry_task(task.id, 1).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::RetriesExhausted { .. }));
    }

    #[tokio::test]
    async fn cancel_rejects_pending_approval_and_flags() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();

        let pending = muster_core::types::ApprovalRecord::new(
            task.id,
            squad.id,
            squad.members()[0].agent_id,
            "git_push",
            serde_json::json!({}),
        );
        store.create_approval(pending.clone()).await.unwrap();

        let mut watch = coord.cancel_watch(task.id);
        let cancelled = coord.cancel_task(task.id, "user request").await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(*watch.borrow_and_update());

        let record = store.get_approval(pending.id).await.unwrap();
        assert_eq!(record.status, ApprovalStatus::Rejected);
        assert!(record.resolved_at.is_some());
    }

    #[tokio::test]
    async fn cancel_flags_without_prior_watcher() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();

        // Nobody called cancel_watch; the flag must still flip so a run
        // that starts afterwards stops at its first checkpoint.
        assert!(!coord.is_cancelled(task.id));
        coord.cancel_task(task.id, "user request").await.unwrap();
        assert!(coord.is_cancelled(task.id));
    }

    #[tokio::test]
    async fn cancel_abandons_failed_task_retries() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();
        coord
            .record_transition(
                task.id,
                TaskStatus::Assigned,
                TaskEvent::Start,
                "start",
                LifecycleActor::System,
            )
            .await
            .unwrap();
        coord
            .record_transition(
                task.id,
                TaskStatus::InProgress,
                TaskEvent::Fail,
                "boom",
                LifecycleActor::System,
            )
            .await
            .unwrap();

        // Budget remains, but the operator walks away instead.
        let cancelled = coord.cancel_task(task.id, "not worth retrying").await.unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);

        let err = coord.retry_task(task.id, 3).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Conflict { .. }));
    }

    #[tokio::test]
    async fn cancel_of_terminal_task_is_invalid() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(task.id).await.unwrap();
        coord.cancel_task(task.id, "first").await.unwrap();

        let err = coord.cancel_task(task.id, "second").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::StateMachine(_)));
    }

    #[tokio::test]
    async fn list_active_excludes_terminal() {
        let store = MemoryStore::new();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), BusClient::new());
        let t1 = stored_task(&store, squad.id, TaskKind::Bug).await;
        let t2 = stored_task(&store, squad.id, TaskKind::Bug).await;
        coord.assign_task(t1.id).await.unwrap();
        coord.assign_task(t2.id).await.unwrap();
        coord.cancel_task(t2.id, "drop it").await.unwrap();

        let active = coord.list_active_tasks().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, t1.id);
    }

    #[tokio::test]
    async fn delivery_failure_is_audited() {
        let store = MemoryStore::new();
        let bus = BusClient::new();
        bus.close();
        let squad = squad();
        let coord = coordinator(&store, squad.clone(), bus);
        let task = stored_task(&store, squad.id, TaskKind::Bug).await;

        let err = coord.assign_task(task.id).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::Delivery { .. }));

        let stored = store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        let last = stored.events.last().unwrap();
        assert!(last.cause.contains("transport failure"));
    }
}
