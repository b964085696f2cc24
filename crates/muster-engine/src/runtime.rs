use std::collections::HashMap;
use std::sync::Arc;

use muster_bus::BusClient;
use muster_core::config::{ExecutionConfig, StreamingConfig};
use muster_core::identity::HumanIdentity;
use muster_core::store::{ApprovalStore, TaskStore};
use muster_core::types::{
    ApprovalDecision, ApprovalRecord, LifecycleActor, Squad, Task, TaskStatus,
};
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::coordinator::{CoordinatorError, SquadCoordinator, TaskHandle};
use crate::handle::{AgentBehavior, AgentHandle, BehaviorSubscriber};
use crate::state_machine::TaskEvent;
use crate::stream::StreamRegistry;
use crate::supervisor::{ExecutionSupervisor, RunOutcome, SupervisorError};

// ---------------------------------------------------------------------------
// SquadRuntime
// ---------------------------------------------------------------------------

/// One squad's fully wired engine: coordinator, approval gate,
/// supervisor, and stream registry over shared stores and a bus.
///
/// The runtime owns the behavior for each member agent and drives
/// execution end to end: `submit` assigns and runs a task, approval
/// resolutions resume parked runs, `retry` re-enters failed ones.
pub struct SquadRuntime {
    coordinator: Arc<SquadCoordinator>,
    gate: Arc<ApprovalGate>,
    supervisor: Arc<ExecutionSupervisor>,
    streams: Arc<StreamRegistry>,
    behaviors: HashMap<Uuid, Arc<dyn AgentBehavior>>,
    /// Bus-facing handle per member; its subscription feeds envelopes
    /// into the member's behavior.
    handles: HashMap<Uuid, Arc<AgentHandle>>,
    execution: ExecutionConfig,
}

impl SquadRuntime {
    /// Must be called from within a tokio runtime: attaching member
    /// behaviors to the bus spawns their dispatch loops.
    pub fn new(
        squad: Squad,
        tasks: Arc<dyn TaskStore>,
        approvals: Arc<dyn ApprovalStore>,
        bus: BusClient,
        execution: ExecutionConfig,
        streaming: StreamingConfig,
        behaviors: HashMap<Uuid, Arc<dyn AgentBehavior>>,
    ) -> Self {
        let mut handles = HashMap::new();
        for member in squad.members() {
            if let Some(behavior) = behaviors.get(&member.agent_id) {
                let handle = Arc::new(AgentHandle::for_member(member, bus.clone()));
                handle.attach(BehaviorSubscriber::new(behavior.clone()));
                handles.insert(member.agent_id, handle);
            }
        }
        let coordinator = Arc::new(SquadCoordinator::new(
            squad,
            tasks.clone(),
            approvals.clone(),
            bus,
            execution.clone(),
        ));
        let gate = Arc::new(ApprovalGate::new(approvals, coordinator.clone()));
        let streams = Arc::new(StreamRegistry::new(streaming.retention_chunks));
        let supervisor = Arc::new(ExecutionSupervisor::new(
            coordinator.clone(),
            gate.clone(),
            tasks,
            streams.clone(),
            execution.clone(),
        ));
        Self {
            coordinator,
            gate,
            supervisor,
            streams,
            behaviors,
            handles,
            execution,
        }
    }

    pub fn squad(&self) -> &Squad {
        self.coordinator.squad()
    }

    pub fn coordinator(&self) -> &Arc<SquadCoordinator> {
        &self.coordinator
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<ExecutionSupervisor> {
        &self.supervisor
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// The bus handle for a member agent, for peer-to-peer envelopes.
    pub fn agent_handle(&self, agent_id: Uuid) -> Option<&Arc<AgentHandle>> {
        self.handles.get(&agent_id)
    }

    // -----------------------------------------------------------------------
    // Task driving
    // -----------------------------------------------------------------------

    /// Assign the task to the squad and run it with the first capable
    /// assignee's behavior until it settles or parks.
    pub async fn submit(&self, task_id: Uuid) -> Result<RunOutcome, SupervisorError> {
        let handle = self.coordinator.assign_task(task_id).await?;
        self.run_assigned(task_id, &handle).await
    }

    /// Start and drive a task that is already assigned. The HTTP
    /// boundary assigns synchronously (so capability errors surface in
    /// the response) and runs this part in the background.
    pub async fn run_assigned(
        &self,
        task_id: Uuid,
        handle: &TaskHandle,
    ) -> Result<RunOutcome, SupervisorError> {
        self.start_and_drive(task_id, handle, None).await
    }

    /// Resolve an approval request. An approval resumes the parked run
    /// with the held payload; a rejection has already failed the task
    /// inside the gate.
    pub async fn resolve_approval(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        resolver: &HumanIdentity,
    ) -> Result<(ApprovalRecord, Option<RunOutcome>), SupervisorError> {
        let (record, newly_resolved) = self.gate.resolve(request_id, decision, resolver).await?;
        // Only the resolution that actually flipped the request resumes
        // the run; a repeated click must not re-run anything.
        if newly_resolved && decision == ApprovalDecision::Approve {
            let outcome = self.resume_approved(&record).await?;
            return Ok((record, outcome));
        }
        Ok((record, None))
    }

    /// Resume a run whose approval request was just approved, feeding
    /// the held payload back into the agent's next step.
    pub async fn resume_approved(
        &self,
        record: &ApprovalRecord,
    ) -> Result<Option<RunOutcome>, SupervisorError> {
        let Some(behavior) = self.behaviors.get(&record.agent_id) else {
            tracing::warn!(agent_id = %record.agent_id, "no behavior registered for approved agent");
            return Ok(None);
        };
        let outcome = self
            .supervisor
            .drive(
                record.task_id,
                record.agent_id,
                behavior.clone(),
                Some(record.payload.clone()),
            )
            .await?;
        Ok(Some(outcome))
    }

    /// Re-enter a failed task within the retry budget and run it again.
    pub async fn retry(&self, task_id: Uuid) -> Result<RunOutcome, SupervisorError> {
        let task = self
            .coordinator
            .retry_task(task_id, self.execution.max_attempts)
            .await?;
        let handle = TaskHandle {
            task_id: task.id,
            squad_id: self.coordinator.squad().id,
            assignees: self.assignees_for(&task),
        };
        self.drive_retry(task_id, &handle).await
    }

    /// Drive a task that already re-entered `in_progress` through
    /// [`SquadCoordinator::retry_task`].
    pub async fn drive_retry(
        &self,
        task_id: Uuid,
        handle: &TaskHandle,
    ) -> Result<RunOutcome, SupervisorError> {
        self.drive_assignee(task_id, handle, None).await
    }

    pub async fn cancel(&self, task_id: Uuid, cause: impl Into<String>) -> Result<Task, CoordinatorError> {
        self.coordinator.cancel_task(task_id, cause).await
    }

    async fn start_and_drive(
        &self,
        task_id: Uuid,
        handle: &TaskHandle,
        resume: Option<serde_json::Value>,
    ) -> Result<RunOutcome, SupervisorError> {
        let task = self
            .coordinator
            .record_transition(
                task_id,
                TaskStatus::Assigned,
                TaskEvent::Start,
                "execution started",
                LifecycleActor::System,
            )
            .await?;
        let (agent_id, behavior) = self.behavior_for(task_id, handle)?;
        behavior.on_assigned(&task).await;
        self.supervisor.drive(task_id, agent_id, behavior, resume).await
    }

    async fn drive_assignee(
        &self,
        task_id: Uuid,
        handle: &TaskHandle,
        resume: Option<serde_json::Value>,
    ) -> Result<RunOutcome, SupervisorError> {
        let (agent_id, behavior) = self.behavior_for(task_id, handle)?;
        self.supervisor.drive(task_id, agent_id, behavior, resume).await
    }

    /// First assignee with a registered behavior.
    fn behavior_for(
        &self,
        task_id: Uuid,
        handle: &TaskHandle,
    ) -> Result<(Uuid, Arc<dyn AgentBehavior>), CoordinatorError> {
        let agent_id = handle
            .assignees
            .iter()
            .copied()
            .find(|id| self.behaviors.contains_key(id))
            .ok_or(CoordinatorError::NoCapableAgent { task_id })?;
        Ok((agent_id, self.behaviors[&agent_id].clone()))
    }

    fn assignees_for(&self, task: &Task) -> Vec<Uuid> {
        self.coordinator
            .squad()
            .capable_members(task.kind)
            .iter()
            .map(|m| m.agent_id)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::{ScriptedAgent, StepOutcome};
    use crate::supervisor::RunOutcome;
    use muster_core::store::MemoryStore;
    use muster_core::types::{
        AgentRole, ApprovalStatus, SquadMember, TaskKind, TaskPriority,
    };
    use std::time::Duration;

    fn human() -> HumanIdentity {
        HumanIdentity {
            id: "alex".into(),
            display_name: "Alex".into(),
        }
    }

    struct Harness {
        store: MemoryStore,
        runtime: SquadRuntime,
    }

    fn harness(script: Vec<StepOutcome>) -> Harness {
        let store = MemoryStore::new();
        let squad = Squad::new(
            "core",
            Uuid::new_v4(),
            vec![
                SquadMember::new("backend-1", AgentRole::Backend),
                SquadMember::new("qa-1", AgentRole::Qa),
            ],
        )
        .unwrap();
        let backend_id = squad.members()[0].agent_id;
        let qa_id = squad.members()[1].agent_id;
        let mut behaviors: HashMap<Uuid, Arc<dyn AgentBehavior>> = HashMap::new();
        behaviors.insert(
            backend_id,
            Arc::new(ScriptedAgent::new(AgentRole::Backend, script)),
        );
        behaviors.insert(qa_id, Arc::new(ScriptedAgent::completing(AgentRole::Qa)));

        let runtime = SquadRuntime::new(
            squad,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            BusClient::new(),
            ExecutionConfig {
                step_timeout_secs: 1,
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_factor: 2.0,
                jitter: 0.0,
            },
            StreamingConfig::default(),
            behaviors,
        );
        Harness { store, runtime }
    }

    async fn submit_bug(h: &Harness) -> Task {
        let squad_id = h.runtime.squad().id;
        let task = Task::new(
            "fix login timeout",
            TaskKind::Bug,
            TaskPriority::High,
            Uuid::new_v4(),
        )
        .with_squad(squad_id);
        h.store.create_task(task).await.unwrap()
    }

    fn lifecycle_path(task: &Task) -> Vec<TaskStatus> {
        task.events.iter().filter(|e| e.from != e.to).map(|e| e.to).collect()
    }

    #[tokio::test]
    async fn sensitive_action_full_approval_round_trip() {
        let h = harness(vec![
            StepOutcome::NeedsApproval {
                action: "git_push".into(),
                payload: serde_json::json!({"branch": "main"}),
            },
            StepOutcome::Complete,
        ]);
        let task = submit_bug(&h).await;

        // Runs until the sensitive action parks it.
        let outcome = h.runtime.submit(task.id).await.unwrap();
        let request = match outcome {
            RunOutcome::Parked { request } => request,
            other => panic!("expected parked, got {other:?}"),
        };
        let stored = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::AwaitingApproval);
        // Exactly one pending request exists.
        let pending = h
            .store
            .approvals_by_status(Some(ApprovalStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);

        // Approval resumes and runs to completion.
        let (record, resumed) = h
            .runtime
            .resolve_approval(request.id, ApprovalDecision::Approve, &human())
            .await
            .unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert!(matches!(resumed, Some(RunOutcome::Completed)));

        let stored = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(
            lifecycle_path(&stored),
            vec![
                TaskStatus::Assigned,
                TaskStatus::InProgress,
                TaskStatus::AwaitingApproval,
                TaskStatus::Approved,
                TaskStatus::InProgress,
                TaskStatus::Completed,
            ]
        );
    }

    #[tokio::test]
    async fn expired_approval_fails_the_task() {
        let h = harness(vec![StepOutcome::NeedsApproval {
            action: "shell_execute".into(),
            payload: serde_json::json!({"cmd": "terraform apply"}),
        }]);
        let task = submit_bug(&h).await;
        let outcome = h.runtime.submit(task.id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Parked { .. }));

        // The sweeper fires with the horizon already elapsed.
        let rejected = h
            .runtime
            .gate()
            .sweep_expired(Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].resolver.as_deref(), Some("system"));

        let stored = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert!(stored.events.iter().any(|e| e.cause.contains("approval timeout")));
    }

    #[tokio::test]
    async fn retry_after_failure_runs_again() {
        let h = harness(vec![
            StepOutcome::Fatal {
                reason: "patch does not apply".into(),
            },
            StepOutcome::Complete,
        ]);
        let task = submit_bug(&h).await;
        let outcome = h.runtime.submit(task.id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));

        let outcome = h.runtime.retry(task.id).await.unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));
        let stored = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn duplicate_approval_click_does_not_rerun() {
        let h = harness(vec![
            StepOutcome::NeedsApproval {
                action: "git_push".into(),
                payload: serde_json::json!({}),
            },
            StepOutcome::Complete,
        ]);
        let task = submit_bug(&h).await;
        let request = match h.runtime.submit(task.id).await.unwrap() {
            RunOutcome::Parked { request } => request,
            other => panic!("expected parked, got {other:?}"),
        };

        let (_, first) = h
            .runtime
            .resolve_approval(request.id, ApprovalDecision::Approve, &human())
            .await
            .unwrap();
        assert!(matches!(first, Some(RunOutcome::Completed)));

        // The second click is a no-op read of the first decision.
        let (record, second) = h
            .runtime
            .resolve_approval(request.id, ApprovalDecision::Approve, &human())
            .await
            .unwrap();
        assert_eq!(record.status, ApprovalStatus::Approved);
        assert!(second.is_none());
        let stored = h.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn member_behaviors_receive_bus_envelopes() {
        let store = MemoryStore::new();
        let squad = Squad::new(
            "core",
            Uuid::new_v4(),
            vec![
                SquadMember::new("backend-1", AgentRole::Backend),
                SquadMember::new("qa-1", AgentRole::Qa),
            ],
        )
        .unwrap();
        let backend_id = squad.members()[0].agent_id;
        let qa_id = squad.members()[1].agent_id;
        let backend = Arc::new(ScriptedAgent::new(
            AgentRole::Backend,
            vec![
                StepOutcome::NeedsApproval {
                    action: "git_push".into(),
                    payload: serde_json::json!({"branch": "main"}),
                },
                StepOutcome::Complete,
            ],
        ));
        let qa = Arc::new(ScriptedAgent::completing(AgentRole::Qa));
        let mut behaviors: HashMap<Uuid, Arc<dyn AgentBehavior>> = HashMap::new();
        behaviors.insert(backend_id, backend.clone());
        behaviors.insert(qa_id, qa.clone());
        let runtime = SquadRuntime::new(
            squad.clone(),
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            BusClient::new(),
            ExecutionConfig {
                step_timeout_secs: 1,
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_factor: 2.0,
                jitter: 0.0,
            },
            StreamingConfig::default(),
            behaviors,
        );

        let task = Task::new(
            "fix login timeout",
            TaskKind::Bug,
            TaskPriority::High,
            Uuid::new_v4(),
        )
        .with_squad(squad.id);
        let task = store.create_task(task).await.unwrap();
        let request = match runtime.submit(task.id).await.unwrap() {
            RunOutcome::Parked { request } => request,
            other => panic!("expected parked, got {other:?}"),
        };
        runtime
            .resolve_approval(request.id, ApprovalDecision::Approve, &human())
            .await
            .unwrap();

        // Dispatch loops run on spawned tasks; give them a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Both capable members saw the assignment announcement.
        let backend_seen = backend.messages.lock().unwrap();
        assert!(backend_seen.iter().any(|e| e.action == "task_assignment"));
        assert!(qa
            .messages
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.action == "task_assignment"));

        // The approved action was redelivered to its requester under the
        // request's correlation id, payload held verbatim.
        let relay = backend_seen
            .iter()
            .find(|e| e.action == "git_push")
            .expect("approved action relayed to the requesting agent");
        assert_eq!(relay.correlation_id, request.id);
        assert_eq!(relay.payload, serde_json::json!({"branch": "main"}));
    }

    #[tokio::test]
    async fn streamed_output_survives_for_late_subscribers() {
        let h = harness(vec![StepOutcome::Complete]);
        let task = submit_bug(&h).await;
        h.runtime.submit(task.id).await.unwrap();

        // The run is over; a client can still replay from the start.
        let stream = h.runtime.streams().get(task.id).unwrap();
        let rx = stream.subscribe_from(0).unwrap();
        let chunk = rx.recv().unwrap();
        assert_eq!(chunk.cursor, 1);
        assert!(chunk.text.contains("backend"));
    }
}
