use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use muster_core::identity::HumanIdentity;
use muster_core::store::{ApprovalStore, StoreError};
use muster_core::types::{
    ApprovalDecision, ApprovalRecord, ApprovalStatus, LifecycleActor, TaskStatus,
};
use uuid::Uuid;

use crate::coordinator::{CoordinatorError, SquadCoordinator, TaskLocks};
use crate::state_machine::TaskEvent;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval request not found: {0}")]
    NotFound(Uuid),

    /// At most one pending request may exist per task; retry after the
    /// outstanding one is resolved.
    #[error("approval already pending for task {0}")]
    AlreadyPending(Uuid),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
}

impl From<StoreError> for ApprovalError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApprovalError::NotFound(id),
            other => ApprovalError::Store(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApprovalError>;

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

/// Intercepts sensitive agent actions: parks the owning task in
/// `awaiting_approval`, holds the action payload verbatim, and resumes
/// or fails the task on a human decision.
///
/// The gate never inspects or validates the payload; it persists,
/// exposes, and relays it. It shares the coordinator's per-task locks,
/// so the one-pending-request-per-task invariant and the task's status
/// are guarded by the same serialization point.
pub struct ApprovalGate {
    approvals: Arc<dyn ApprovalStore>,
    coordinator: Arc<SquadCoordinator>,
    locks: Arc<TaskLocks>,
}

impl ApprovalGate {
    pub fn new(approvals: Arc<dyn ApprovalStore>, coordinator: Arc<SquadCoordinator>) -> Self {
        let locks = coordinator.locks();
        Self {
            approvals,
            coordinator,
            locks,
        }
    }

    // -----------------------------------------------------------------------
    // Request
    // -----------------------------------------------------------------------

    /// Park the task behind a new approval request. Fails with
    /// [`ApprovalError::AlreadyPending`] when one is outstanding, and
    /// with a conflict when the task is not `in_progress`.
    pub async fn request_approval(
        &self,
        task_id: Uuid,
        agent_id: Uuid,
        action: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<ApprovalRecord> {
        let lock = self.locks.for_task(task_id);
        let _guard = lock.lock().await;

        if self.approvals.pending_for_task(task_id).await?.is_some() {
            return Err(ApprovalError::AlreadyPending(task_id));
        }

        let action = action.into();
        self.coordinator
            .transition_locked(
                task_id,
                TaskStatus::InProgress,
                TaskEvent::RequestApproval,
                format!("sensitive action '{action}' awaiting approval"),
                LifecycleActor::Agent { id: agent_id },
            )
            .await?;

        let record = ApprovalRecord::new(
            task_id,
            self.coordinator.squad().id,
            agent_id,
            action,
            payload,
        );
        let record = self.approvals.create_approval(record).await?;
        tracing::info!(
            request_id = %record.id,
            task_id = %task_id,
            action = %record.action,
            "approval requested; task parked"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Resolution
    // -----------------------------------------------------------------------

    /// Apply a human decision. Terminal once resolved: repeated calls
    /// (duplicate clicks, disagreeing second opinions) return the first
    /// resolution unchanged and never touch the task again. The flag in
    /// the return value is `true` only for the call that actually
    /// flipped the request.
    ///
    /// On approval the held payload is re-published to the originating
    /// agent under the request's correlation id and the task resumes;
    /// on rejection the task fails with the resolver recorded for
    /// audit.
    pub async fn resolve(
        &self,
        request_id: Uuid,
        decision: ApprovalDecision,
        resolver: &HumanIdentity,
    ) -> Result<(ApprovalRecord, bool)> {
        let record = self.approvals.get_approval(request_id).await?;
        let lock = self.locks.for_task(record.task_id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent resolution, cancellation,
        // or sweep may have won.
        let record = self.approvals.get_approval(request_id).await?;
        if !record.is_pending() {
            tracing::debug!(request_id = %request_id, "already resolved; returning first decision");
            return Ok((record, false));
        }

        let record = self
            .resolve_locked(record, decision, Some(resolver.id.clone()), None)
            .await?;
        Ok((record, true))
    }

    /// Auto-reject pending requests older than `horizon`. Returns the
    /// rejected records. Unresolved approvals are never silently
    /// approved.
    pub async fn sweep_expired(&self, horizon: Duration) -> Result<Vec<ApprovalRecord>> {
        let pending = self
            .approvals
            .approvals_by_status(Some(ApprovalStatus::Pending))
            .await?;
        let horizon = chrono::Duration::from_std(horizon).unwrap_or(chrono::Duration::zero());
        let now = Utc::now();

        let mut rejected = Vec::new();
        for record in pending {
            if now - record.requested_at < horizon {
                continue;
            }
            let lock = self.locks.for_task(record.task_id);
            let _guard = lock.lock().await;
            // Re-read: a human may have raced the sweeper.
            let record = self.approvals.get_approval(record.id).await?;
            if !record.is_pending() {
                continue;
            }
            tracing::warn!(
                request_id = %record.id,
                task_id = %record.task_id,
                "approval horizon elapsed; auto-rejecting"
            );
            let record = self
                .resolve_locked(
                    record,
                    ApprovalDecision::Reject,
                    Some("system".to_string()),
                    Some("approval timeout".to_string()),
                )
                .await?;
            rejected.push(record);
        }
        Ok(rejected)
    }

    async fn resolve_locked(
        &self,
        mut record: ApprovalRecord,
        decision: ApprovalDecision,
        resolver: Option<String>,
        cause_override: Option<String>,
    ) -> Result<ApprovalRecord> {
        let resolver_label = resolver.clone().unwrap_or_else(|| "system".to_string());
        record.status = match decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
        };
        record.resolved_at = Some(Utc::now());
        record.resolver = resolver;
        let version = record.version;
        let record = self.approvals.update_approval(record, version).await?;

        let actor = LifecycleActor::Human {
            id: resolver_label.clone(),
        };
        match decision {
            ApprovalDecision::Approve => {
                self.coordinator
                    .transition_locked(
                        record.task_id,
                        TaskStatus::AwaitingApproval,
                        TaskEvent::Approve,
                        format!("approved by {resolver_label}"),
                        actor.clone(),
                    )
                    .await?;
                self.coordinator
                    .transition_locked(
                        record.task_id,
                        TaskStatus::Approved,
                        TaskEvent::Start,
                        "resuming approved action",
                        actor,
                    )
                    .await?;

                // Relay the held action back to the originating agent,
                // correlated to the request so redelivery stays
                // idempotent.
                let envelope = self.coordinator.make_envelope(
                    record.action.clone(),
                    vec![record.agent_id],
                    record.payload.clone(),
                    record.id,
                );
                if let Err(err) = self.coordinator.publish_with_retry(envelope).await {
                    self.coordinator
                        .transition_locked(
                            record.task_id,
                            TaskStatus::InProgress,
                            TaskEvent::Fail,
                            format!("transport failure relaying approved action: {err}"),
                            LifecycleActor::System,
                        )
                        .await?;
                    return Err(err.into());
                }
            }
            ApprovalDecision::Reject => {
                let cause = cause_override
                    .unwrap_or_else(|| format!("rejected by {resolver_label}"));
                self.coordinator
                    .transition_locked(
                        record.task_id,
                        TaskStatus::AwaitingApproval,
                        TaskEvent::Reject,
                        cause.clone(),
                        actor.clone(),
                    )
                    .await?;
                self.coordinator
                    .transition_locked(
                        record.task_id,
                        TaskStatus::Rejected,
                        TaskEvent::Fail,
                        cause,
                        actor,
                    )
                    .await?;
            }
        }

        tracing::info!(
            request_id = %record.id,
            task_id = %record.task_id,
            status = ?record.status,
            resolver = %resolver_label,
            "approval resolved"
        );
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, request_id: Uuid) -> Result<ApprovalRecord> {
        Ok(self.approvals.get_approval(request_id).await?)
    }

    pub async fn list(&self, status: Option<ApprovalStatus>) -> Result<Vec<ApprovalRecord>> {
        Ok(self.approvals.approvals_by_status(status).await?)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
