use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use muster_bus::{BusClient, BusError, Envelope, EnvelopeHandler};
use muster_core::types::{AgentRole, SquadMember, Task};
use uuid::Uuid;

use crate::stream::TaskStream;

// ---------------------------------------------------------------------------
// OutputSink
// ---------------------------------------------------------------------------

/// Write half of a task's output stream, handed to the executing agent.
#[derive(Clone)]
pub struct OutputSink {
    stream: Arc<TaskStream>,
}

impl OutputSink {
    pub fn new(stream: Arc<TaskStream>) -> Self {
        Self { stream }
    }

    /// Emit one output chunk; returns its cursor.
    pub fn emit(&self, text: impl Into<String>) -> u64 {
        self.stream.append(text)
    }
}

// ---------------------------------------------------------------------------
// StepInput / StepOutcome
// ---------------------------------------------------------------------------

/// Input for one execution step of an agent against a task.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub task: Task,
    /// 1-based attempt number within the current step.
    pub attempt: u32,
    /// Payload of a just-approved action, redelivered for resumption.
    pub resume: Option<serde_json::Value>,
}

/// What the agent reports back from a work step. The supervisor
/// classifies these into transient/permanent outcomes; control flow
/// never rides on exceptions.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Complete,
    /// The step wants to perform a sensitive action; the task must park
    /// behind the approval gate before the action runs.
    NeedsApproval {
        action: String,
        payload: serde_json::Value,
    },
    /// Transient failure (transport hiccup, flaky dependency); eligible
    /// for retry.
    Retryable { reason: String },
    /// Agent-reported fatal error; never retried.
    Fatal { reason: String },
}

// ---------------------------------------------------------------------------
// AgentBehavior
// ---------------------------------------------------------------------------

/// The intelligence boundary. The engine drives lifecycle and
/// messaging; what an agent actually does inside a step is supplied
/// from outside the core.
#[async_trait::async_trait]
pub trait AgentBehavior: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Called when a task is assigned to this agent.
    async fn on_assigned(&self, task: &Task);

    /// Called for every envelope delivered to this agent.
    async fn on_message(&self, envelope: &Envelope);

    /// Execute one work step, streaming incremental output through
    /// `sink`. Must hit a safe checkpoint before returning; the
    /// supervisor cancels only between steps, never mid-side-effect.
    async fn execute_step(&self, input: &StepInput, sink: &OutputSink) -> StepOutcome;
}

// ---------------------------------------------------------------------------
// AgentHandle
// ---------------------------------------------------------------------------

/// Per-agent execution context: identity, role, and outbound send
/// capability with per-sender sequence numbering.
pub struct AgentHandle {
    pub id: Uuid,
    pub name: String,
    pub role: AgentRole,
    pub specialization: Option<String>,
    bus: BusClient,
    seq: AtomicU64,
}

impl AgentHandle {
    pub fn for_member(member: &SquadMember, bus: BusClient) -> Self {
        Self {
            id: member.agent_id,
            name: member.name.clone(),
            role: member.role,
            specialization: member.specialization.clone(),
            bus,
            seq: AtomicU64::new(0),
        }
    }

    /// Publish an envelope with a fresh correlation id.
    pub fn publish(
        &self,
        action: impl Into<String>,
        recipients: Vec<Uuid>,
        payload: serde_json::Value,
    ) -> Result<Envelope, BusError> {
        self.publish_correlated(action, recipients, payload, Uuid::new_v4())
    }

    /// Publish an envelope under an existing correlation id (responses,
    /// approved-action redelivery).
    pub fn publish_correlated(
        &self,
        action: impl Into<String>,
        recipients: Vec<Uuid>,
        payload: serde_json::Value,
        correlation_id: Uuid,
    ) -> Result<Envelope, BusError> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = Envelope::new(action, self.id, recipients, payload, correlation_id, seq);
        self.bus.publish(envelope.clone())?;
        Ok(envelope)
    }

    /// Register an inbound handler for this agent on the bus.
    pub fn attach(&self, handler: Arc<dyn EnvelopeHandler>) {
        self.bus.subscribe(self.id, handler);
    }
}

// ---------------------------------------------------------------------------
// BehaviorSubscriber
// ---------------------------------------------------------------------------

/// Bus subscription adapter: feeds every delivered envelope into an
/// [`AgentBehavior`]'s `on_message`. The runtime attaches one per squad
/// member, so assignment announcements and approved-action redeliveries
/// reach a live handler instead of being accepted and dropped.
pub struct BehaviorSubscriber {
    behavior: Arc<dyn AgentBehavior>,
}

impl BehaviorSubscriber {
    pub fn new(behavior: Arc<dyn AgentBehavior>) -> Arc<Self> {
        Arc::new(Self { behavior })
    }
}

#[async_trait::async_trait]
impl EnvelopeHandler for BehaviorSubscriber {
    async fn handle(&self, envelope: Envelope) {
        self.behavior.on_message(&envelope).await;
    }
}

// ---------------------------------------------------------------------------
// ScriptedAgent
// ---------------------------------------------------------------------------

/// Deterministic behavior driven by a queue of step outcomes. The
/// daemon's default behavior and the engine test double.
pub struct ScriptedAgent {
    role: AgentRole,
    script: std::sync::Mutex<std::collections::VecDeque<StepOutcome>>,
    pub messages: std::sync::Mutex<Vec<Envelope>>,
}

impl ScriptedAgent {
    pub fn new(role: AgentRole, script: Vec<StepOutcome>) -> Self {
        Self {
            role,
            script: std::sync::Mutex::new(script.into()),
            messages: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// A behavior that streams one line and completes.
    pub fn completing(role: AgentRole) -> Self {
        Self::new(role, vec![StepOutcome::Complete])
    }
}

#[async_trait::async_trait]
impl AgentBehavior for ScriptedAgent {
    fn role(&self) -> AgentRole {
        self.role
    }

    async fn on_assigned(&self, task: &Task) {
        tracing::debug!(task_id = %task.id, role = %self.role, "scripted agent assigned");
    }

    async fn on_message(&self, envelope: &Envelope) {
        self.messages
            .lock()
            .expect("scripted agent lock poisoned")
            .push(envelope.clone());
    }

    async fn execute_step(&self, input: &StepInput, sink: &OutputSink) -> StepOutcome {
        sink.emit(format!(
            "[{}] step attempt {} on '{}'",
            self.role, input.attempt, input.task.title
        ));
        self.script
            .lock()
            .expect("scripted agent lock poisoned")
            .pop_front()
            .unwrap_or(StepOutcome::Complete)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
