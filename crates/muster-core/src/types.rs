use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Feature,
    Bug,
    Refactor,
    Documentation,
    Testing,
    Devops,
}

// ---------------------------------------------------------------------------
// TaskPriority
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Medium = 1,
    High = 2,
    Urgent = 3,
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Created,
    Assigned,
    InProgress,
    AwaitingApproval,
    Approved,
    Rejected,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns `true` when the task's run is settled and no work remains.
    ///
    /// `Failed` is listed here even though an explicit retry may re-enter
    /// `InProgress` and a cancel may abandon the task; the retry budget
    /// is enforced by the coordinator, not by the status itself.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Approved` and `Rejected` are transient decision states recorded in
    /// the lifecycle log between `AwaitingApproval` and the resumed or
    /// failed task.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Created, TaskStatus::Assigned)
                | (TaskStatus::Assigned, TaskStatus::InProgress)
                | (TaskStatus::InProgress, TaskStatus::AwaitingApproval)
                | (TaskStatus::InProgress, TaskStatus::Completed)
                | (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::Assigned, TaskStatus::Failed)
                | (TaskStatus::AwaitingApproval, TaskStatus::Approved)
                | (TaskStatus::AwaitingApproval, TaskStatus::Rejected)
                | (TaskStatus::Approved, TaskStatus::InProgress)
                | (TaskStatus::Rejected, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::InProgress)
                | (TaskStatus::Failed, TaskStatus::Cancelled)
                | (TaskStatus::Created, TaskStatus::Cancelled)
                | (TaskStatus::Assigned, TaskStatus::Cancelled)
                | (TaskStatus::InProgress, TaskStatus::Cancelled)
                | (TaskStatus::AwaitingApproval, TaskStatus::Cancelled)
                | (TaskStatus::Approved, TaskStatus::Cancelled)
                | (TaskStatus::Rejected, TaskStatus::Cancelled)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            TaskStatus::Created => "created",
            TaskStatus::Assigned => "assigned",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingApproval => "awaiting_approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// LifecycleActor / LifecycleEvent
// ---------------------------------------------------------------------------

/// Who caused a lifecycle transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleActor {
    System,
    Agent { id: Uuid },
    Human { id: String },
}

/// One immutable row of a task's audit trail. Appended on every
/// successful transition; never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub timestamp: DateTime<Utc>,
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub cause: String,
    pub actor: LifecycleActor,
}

impl LifecycleEvent {
    pub fn new(
        from: TaskStatus,
        to: TaskStatus,
        cause: impl Into<String>,
        actor: LifecycleActor,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            from,
            to,
            cause: cause.into(),
            actor,
        }
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub kind: TaskKind,
    pub priority: TaskPriority,
    pub org_id: Uuid,
    pub squad_id: Option<Uuid>,
    pub status: TaskStatus,
    /// Count of explicit failed -> in_progress retries plus supervisor
    /// re-attempts after transient execution failures.
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic-concurrency version; bumped on every store update.
    pub version: u64,
    /// Ordered, append-only audit log of lifecycle transitions.
    pub events: Vec<LifecycleEvent>,
}

impl Task {
    pub fn new(
        title: impl Into<String>,
        kind: TaskKind,
        priority: TaskPriority,
        org_id: Uuid,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: None,
            kind,
            priority,
            org_id,
            squad_id: None,
            status: TaskStatus::Created,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            version: 0,
            events: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_squad(mut self, squad_id: Uuid) -> Self {
        self.squad_id = Some(squad_id);
        self
    }
}

// ---------------------------------------------------------------------------
// AgentRole
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Architect,
    Backend,
    Frontend,
    Qa,
    Devops,
    Docs,
}

impl AgentRole {
    /// Role/capability lookup: can an agent with this role act on a task
    /// of the given kind?
    pub fn can_handle(&self, kind: TaskKind) -> bool {
        match self {
            AgentRole::Architect | AgentRole::Backend | AgentRole::Frontend => matches!(
                kind,
                TaskKind::Feature | TaskKind::Bug | TaskKind::Refactor
            ),
            AgentRole::Qa => matches!(kind, TaskKind::Testing | TaskKind::Bug),
            AgentRole::Devops => matches!(kind, TaskKind::Devops),
            AgentRole::Docs => matches!(kind, TaskKind::Documentation),
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AgentRole::Architect => "architect",
            AgentRole::Backend => "backend",
            AgentRole::Frontend => "frontend",
            AgentRole::Qa => "qa",
            AgentRole::Devops => "devops",
            AgentRole::Docs => "docs",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Squad
// ---------------------------------------------------------------------------

/// Minimum and maximum member counts for a squad.
pub const SQUAD_MIN_MEMBERS: usize = 2;
pub const SQUAD_MAX_MEMBERS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SquadMember {
    pub agent_id: Uuid,
    pub name: String,
    pub role: AgentRole,
    /// Optional refinement of the role, e.g. a backend member
    /// specialised by stack ("rust", "postgres").
    pub specialization: Option<String>,
}

impl SquadMember {
    pub fn new(name: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: Uuid::new_v4(),
            name: name.into(),
            role,
            specialization: None,
        }
    }

    pub fn with_specialization(mut self, spec: impl Into<String>) -> Self {
        self.specialization = Some(spec.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SquadError {
    #[error("squad must have between {SQUAD_MIN_MEMBERS} and {SQUAD_MAX_MEMBERS} members, got {0}")]
    MemberCount(usize),
}

/// A named, bounded collection of role-bound agents. The role set is
/// fixed at creation time; membership does not change mid-task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Squad {
    pub id: Uuid,
    pub name: String,
    pub org_id: Uuid,
    members: Vec<SquadMember>,
    pub created_at: DateTime<Utc>,
}

impl Squad {
    pub fn new(
        name: impl Into<String>,
        org_id: Uuid,
        members: Vec<SquadMember>,
    ) -> Result<Self, SquadError> {
        if members.len() < SQUAD_MIN_MEMBERS || members.len() > SQUAD_MAX_MEMBERS {
            return Err(SquadError::MemberCount(members.len()));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name: name.into(),
            org_id,
            members,
            created_at: Utc::now(),
        })
    }

    pub fn members(&self) -> &[SquadMember] {
        &self.members
    }

    /// Members whose role can act on a task of the given kind.
    pub fn capable_members(&self, kind: TaskKind) -> Vec<&SquadMember> {
        self.members
            .iter()
            .filter(|m| m.role.can_handle(kind))
            .collect()
    }

    pub fn member(&self, agent_id: Uuid) -> Option<&SquadMember> {
        self.members.iter().find(|m| m.agent_id == agent_id)
    }
}

// ---------------------------------------------------------------------------
// Approval records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// A human decision on a pending approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// A request for human authorization of a sensitive agent action.
///
/// The payload is held verbatim: it is both the audit snapshot and the
/// message re-published to the originating agent when the request is
/// approved. Terminal once resolved; a retried action creates a new
/// request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: Uuid,
    pub task_id: Uuid,
    pub squad_id: Uuid,
    pub agent_id: Uuid,
    pub action: String,
    pub payload: serde_json::Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    /// Identity of the resolving human, or a system marker for
    /// timeout/cancellation auto-rejections.
    pub resolver: Option<String>,
    pub version: u64,
}

impl ApprovalRecord {
    pub fn new(
        task_id: Uuid,
        squad_id: Uuid,
        agent_id: Uuid,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id,
            squad_id,
            agent_id,
            action: action.into(),
            payload,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            resolved_at: None,
            resolver: None,
            version: 0,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
