use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use muster_core::store::{StoreError, TaskStore};
use muster_core::types::{ApprovalRecord, LifecycleActor, TaskStatus};
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::approval::{ApprovalError, ApprovalGate};
use crate::coordinator::{CoordinatorError, SquadCoordinator};
use crate::handle::{AgentBehavior, OutputSink, StepInput, StepOutcome};
use crate::state_machine::TaskEvent;
use crate::stream::StreamRegistry;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

// ---------------------------------------------------------------------------
// Attempt records
// ---------------------------------------------------------------------------

/// How one timed attempt ended. Timeouts and agent-reported transient
/// failures are retried inside the attempt budget; everything else
/// settles the run.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    NeedsApproval {
        action: String,
        payload: serde_json::Value,
    },
    Timeout,
    Transient {
        reason: String,
    },
    Permanent {
        reason: String,
    },
    Cancelled,
}

impl AttemptOutcome {
    pub fn is_transient(&self) -> bool {
        matches!(self, AttemptOutcome::Timeout | AttemptOutcome::Transient { .. })
    }
}

/// One supervised attempt, kept for the task's execution history.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionAttempt {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    /// Highest stream cursor at the end of the attempt; clients resume
    /// from here.
    pub last_cursor: u64,
}

/// How a whole supervised run ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    /// The task parked behind the approval gate; the run resumes in a
    /// fresh `drive` call once the request is approved.
    Parked { request: ApprovalRecord },
    Failed { reason: String },
    Cancelled,
}

// ---------------------------------------------------------------------------
// ExecutionSupervisor
// ---------------------------------------------------------------------------

/// Runs an agent behavior against a task under a per-attempt deadline,
/// with bounded retries and jittered exponential backoff between them.
///
/// Cancellation is observed only at attempt boundaries; a behavior is
/// expected to reach a safe checkpoint before returning from a step, so
/// the supervisor never abandons work mid-side-effect. All task status
/// changes go through the coordinator.
pub struct ExecutionSupervisor {
    coordinator: Arc<SquadCoordinator>,
    gate: Arc<ApprovalGate>,
    tasks: Arc<dyn TaskStore>,
    streams: Arc<StreamRegistry>,
    config: muster_core::config::ExecutionConfig,
    history: DashMap<Uuid, Vec<ExecutionAttempt>>,
}

impl ExecutionSupervisor {
    pub fn new(
        coordinator: Arc<SquadCoordinator>,
        gate: Arc<ApprovalGate>,
        tasks: Arc<dyn TaskStore>,
        streams: Arc<StreamRegistry>,
        config: muster_core::config::ExecutionConfig,
    ) -> Self {
        Self {
            coordinator,
            gate,
            tasks,
            streams,
            config,
            history: DashMap::new(),
        }
    }

    /// Execution history for a task, oldest attempt first.
    pub fn attempts(&self, task_id: Uuid) -> Vec<ExecutionAttempt> {
        self.history
            .get(&task_id)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    /// Drive a task to a settled outcome. `resume` carries the payload
    /// of a just-approved action back into the first step.
    ///
    /// The attempt counter is local to this run; a retry after approval
    /// or an explicit `retry_task` starts a fresh budget.
    pub async fn drive(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        behavior: Arc<dyn AgentBehavior>,
        resume: Option<serde_json::Value>,
    ) -> Result<RunOutcome> {
        let stream = self.streams.get_or_create(task_id);
        let sink = OutputSink::new(stream.clone());
        let mut resume = resume;
        let mut attempt: u32 = 1;

        loop {
            if self.coordinator.is_cancelled(task_id) {
                self.record(task_id, attempt, Utc::now(), AttemptOutcome::Cancelled, &stream);
                tracing::info!(task_id = %task_id, "run stopped at cancelled checkpoint");
                return Ok(RunOutcome::Cancelled);
            }

            let task = self.tasks.get_task(task_id).await?;
            let input = StepInput {
                task,
                attempt,
                resume: resume.take(),
            };
            let started = Utc::now();
            let step = behavior.execute_step(&input, &sink);
            let outcome = match tokio::time::timeout(self.config.step_timeout(), step).await {
                Err(_) => AttemptOutcome::Timeout,
                Ok(StepOutcome::Complete) => AttemptOutcome::Success,
                Ok(StepOutcome::NeedsApproval { action, payload }) => {
                    AttemptOutcome::NeedsApproval { action, payload }
                }
                Ok(StepOutcome::Retryable { reason }) => AttemptOutcome::Transient { reason },
                Ok(StepOutcome::Fatal { reason }) => AttemptOutcome::Permanent { reason },
            };
            self.record(task_id, attempt, started, outcome.clone(), &stream);

            match outcome {
                AttemptOutcome::Success => {
                    return self
                        .settle(
                            task_id,
                            TaskEvent::Complete,
                            "all steps complete",
                            LifecycleActor::Agent { id: agent_id },
                            RunOutcome::Completed,
                        )
                        .await;
                }
                AttemptOutcome::NeedsApproval { action, payload } => {
                    let request = self
                        .gate
                        .request_approval(task_id, agent_id, action, payload)
                        .await?;
                    return Ok(RunOutcome::Parked { request });
                }
                AttemptOutcome::Permanent { reason } => {
                    return self
                        .settle(
                            task_id,
                            TaskEvent::Fail,
                            reason.clone(),
                            LifecycleActor::Agent { id: agent_id },
                            RunOutcome::Failed { reason },
                        )
                        .await;
                }
                AttemptOutcome::Cancelled => unreachable!("recorded only at loop entry"),
                ref transient => {
                    let reason = match transient {
                        AttemptOutcome::Timeout => {
                            format!("attempt {attempt} exceeded step deadline")
                        }
                        AttemptOutcome::Transient { reason } => {
                            format!("attempt {attempt} failed: {reason}")
                        }
                        _ => unreachable!(),
                    };
                    if attempt >= self.config.max_attempts {
                        let reason =
                            format!("{reason}; attempt budget of {} spent", self.config.max_attempts);
                        return self
                            .settle(
                                task_id,
                                TaskEvent::Fail,
                                reason.clone(),
                                LifecycleActor::System,
                                RunOutcome::Failed { reason },
                            )
                            .await;
                    }
                    tracing::warn!(task_id = %task_id, attempt, reason = %reason, "transient attempt failure; backing off");
                    self.coordinator
                        .note_execution_retry(task_id, format!("{reason}; retrying"))
                        .await?;
                    tokio::time::sleep(self.backoff_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Record the final transition. A cancellation that landed while
    /// the last attempt ran wins over our result.
    async fn settle(
        &self,
        task_id: Uuid,
        event: TaskEvent,
        cause: impl Into<String>,
        actor: LifecycleActor,
        outcome: RunOutcome,
    ) -> Result<RunOutcome> {
        match self
            .coordinator
            .record_transition(task_id, TaskStatus::InProgress, event, cause, actor)
            .await
        {
            Ok(_) => Ok(outcome),
            Err(CoordinatorError::Conflict {
                actual: TaskStatus::Cancelled,
                ..
            }) => Ok(RunOutcome::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    fn record(
        &self,
        task_id: Uuid,
        attempt: u32,
        started_at: DateTime<Utc>,
        outcome: AttemptOutcome,
        stream: &crate::stream::TaskStream,
    ) {
        let deadline = started_at
            + chrono::Duration::from_std(self.config.step_timeout())
                .unwrap_or(chrono::Duration::zero());
        self.history.entry(task_id).or_default().push(ExecutionAttempt {
            attempt,
            started_at,
            deadline,
            outcome,
            last_cursor: stream.latest_cursor(),
        });
    }

    /// Exponential backoff with multiplicative jitter, so a burst of
    /// transient failures across tasks does not re-fire in lockstep.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.config.backoff_base_ms as f64
            * self
                .config
                .backoff_factor
                .powi(attempt.saturating_sub(1) as i32);
        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::from_millis((exp * factor).round().max(0.0) as u64)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use muster_bus::BusClient;
    use muster_core::config::ExecutionConfig;
    use muster_core::store::MemoryStore;
    use muster_core::types::{
        AgentRole, Squad, SquadMember, Task, TaskKind, TaskPriority,
    };

    /// Behavior whose steps never return; every attempt times out.
    struct HangingAgent;

    #[async_trait::async_trait]
    impl AgentBehavior for HangingAgent {
        fn role(&self) -> AgentRole {
            AgentRole::Backend
        }

        async fn on_assigned(&self, _task: &Task) {}

        async fn on_message(&self, _envelope: &muster_bus::Envelope) {}

        async fn execute_step(&self, _input: &StepInput, sink: &OutputSink) -> StepOutcome {
            sink.emit("starting long operation");
            std::future::pending().await
        }
    }

    struct Fixture {
        store: MemoryStore,
        coordinator: Arc<SquadCoordinator>,
        supervisor: ExecutionSupervisor,
        agent_id: Uuid,
    }

    fn fixture(config: ExecutionConfig) -> Fixture {
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
        let agent_id = squad.members()[0].agent_id;
        let coordinator = Arc::new(SquadCoordinator::new(
            squad,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            BusClient::new(),
            config.clone(),
        ));
        let gate = Arc::new(ApprovalGate::new(
            Arc::new(store.clone()),
            coordinator.clone(),
        ));
        let supervisor = ExecutionSupervisor::new(
            coordinator.clone(),
            gate,
            Arc::new(store.clone()),
            Arc::new(StreamRegistry::new(64)),
            config,
        );
        Fixture {
            store,
            coordinator,
            supervisor,
            agent_id,
        }
    }

    fn quick_config() -> ExecutionConfig {
        ExecutionConfig {
            step_timeout_secs: 1,
            max_attempts: 3,
            backoff_base_ms: 1,
            backoff_factor: 2.0,
            jitter: 0.0,
        }
    }

    async fn running_task(fx: &Fixture) -> Task {
        use muster_core::store::TaskStore;
        let squad_id = fx.coordinator.squad().id;
        let task = Task::new("fix login", TaskKind::Bug, TaskPriority::High, Uuid::new_v4())
            .with_squad(squad_id);
        let task = fx.store.create_task(task).await.unwrap();
        fx.coordinator.assign_task(task.id).await.unwrap();
        fx.coordinator
            .record_transition(
                task.id,
                TaskStatus::Assigned,
                TaskEvent::Start,
                "start",
                LifecycleActor::System,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn successful_run_completes_task() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        let behavior = Arc::new(crate::handle::ScriptedAgent::completing(AgentRole::Backend));

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        let attempts = fx.supervisor.attempts(task.id);
        assert_eq!(attempts.len(), 1);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Success));
        assert_eq!(attempts[0].last_cursor, 1);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        let behavior = Arc::new(crate::handle::ScriptedAgent::new(
            AgentRole::Backend,
            vec![
                StepOutcome::Retryable {
                    reason: "connection reset".into(),
                },
                StepOutcome::Complete,
            ],
        ));

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(fx.supervisor.attempts(task.id).len(), 2);
    }

    /// Hangs on the first attempt, completes on the second.
    struct SlowStartAgent;

    #[async_trait::async_trait]
    impl AgentBehavior for SlowStartAgent {
        fn role(&self) -> AgentRole {
            AgentRole::Backend
        }
        async fn on_assigned(&self, _task: &Task) {}
        async fn on_message(&self, _envelope: &muster_bus::Envelope) {}
        async fn execute_step(&self, input: &StepInput, _sink: &OutputSink) -> StepOutcome {
            if input.attempt == 1 {
                std::future::pending().await
            } else {
                StepOutcome::Complete
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_timeout_keeps_task_in_progress() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        let behavior = Arc::new(SlowStartAgent);

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Completed));

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.retry_count, 1);
        // The retry left an in-place annotation while the status stayed
        // in_progress.
        let annotations: Vec<_> = stored
            .events
            .iter()
            .filter(|e| e.from == e.to && e.from == TaskStatus::InProgress)
            .collect();
        assert_eq!(annotations.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_budget_exhaustion_fails_task() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, Arc::new(HangingAgent), None)
            .await
            .unwrap();
        match outcome {
            RunOutcome::Failed { reason } => assert!(reason.contains("budget of 3")),
            other => panic!("expected failure, got {other:?}"),
        }

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        // Two in-place retries preceded the final failure.
        assert_eq!(stored.retry_count, 2);
        let attempts = fx.supervisor.attempts(task.id);
        assert_eq!(attempts.len(), 3);
        assert!(attempts
            .iter()
            .all(|a| matches!(a.outcome, AttemptOutcome::Timeout)));
    }

    #[tokio::test]
    async fn fatal_outcome_is_never_retried() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        let behavior = Arc::new(crate::handle::ScriptedAgent::new(
            AgentRole::Backend,
            vec![StepOutcome::Fatal {
                reason: "migration cannot be applied".into(),
            }],
        ));

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Failed { .. }));

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(fx.supervisor.attempts(task.id).len(), 1);
    }

    #[tokio::test]
    async fn needs_approval_parks_the_run() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        let behavior = Arc::new(crate::handle::ScriptedAgent::new(
            AgentRole::Backend,
            vec![StepOutcome::NeedsApproval {
                action: "git_push".into(),
                payload: serde_json::json!({"branch": "main"}),
            }],
        ));

        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        let request = match outcome {
            RunOutcome::Parked { request } => request,
            other => panic!("expected parked run, got {other:?}"),
        };
        assert_eq!(request.action, "git_push");

        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::AwaitingApproval);
    }

    #[tokio::test]
    async fn cancellation_observed_at_attempt_boundary() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;
        fx.coordinator.cancel_task(task.id, "user request").await.unwrap();

        let behavior = Arc::new(crate::handle::ScriptedAgent::completing(AgentRole::Backend));
        let outcome = fx
            .supervisor
            .drive(task.id, fx.agent_id, behavior, None)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Cancelled));

        // No step ran, so nothing streamed.
        let stored = fx.store.get_task(task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        let attempts = fx.supervisor.attempts(task.id);
        assert_eq!(attempts.len(), 1);
        assert!(matches!(attempts[0].outcome, AttemptOutcome::Cancelled));
        assert_eq!(attempts[0].last_cursor, 0);
    }

    #[tokio::test]
    async fn resume_payload_reaches_first_step() {
        let fx = fixture(quick_config());
        let task = running_task(&fx).await;

        struct ResumeProbe {
            seen: std::sync::Mutex<Option<serde_json::Value>>,
        }

        #[async_trait::async_trait]
        impl AgentBehavior for ResumeProbe {
            fn role(&self) -> AgentRole {
                AgentRole::Backend
            }
            async fn on_assigned(&self, _task: &Task) {}
            async fn on_message(&self, _envelope: &muster_bus::Envelope) {}
            async fn execute_step(&self, input: &StepInput, _sink: &OutputSink) -> StepOutcome {
                *self.seen.lock().unwrap() = input.resume.clone();
                StepOutcome::Complete
            }
        }

        let probe = Arc::new(ResumeProbe {
            seen: std::sync::Mutex::new(None),
        });
        let payload = serde_json::json!({"branch": "main"});
        fx.supervisor
            .drive(task.id, fx.agent_id, probe.clone(), Some(payload.clone()))
            .await
            .unwrap();
        assert_eq!(probe.seen.lock().unwrap().clone(), Some(payload));
    }
}
