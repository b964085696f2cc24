use muster_core::types::TaskStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// TaskEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    Assign,
    Start,
    RequestApproval,
    Approve,
    Reject,
    Complete,
    Fail,
    Cancel,
    Retry,
}

impl fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskEvent::Assign => "assign",
            TaskEvent::Start => "start",
            TaskEvent::RequestApproval => "request_approval",
            TaskEvent::Approve => "approve",
            TaskEvent::Reject => "reject",
            TaskEvent::Complete => "complete",
            TaskEvent::Fail => "fail",
            TaskEvent::Cancel => "cancel",
            TaskEvent::Retry => "retry",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateMachineError {
    /// An event was applied in a state where it is not valid, e.g.
    /// completing a task that never started or retrying one that
    /// finished cleanly.
    #[error("invalid transition: cannot apply {event} in state {state}")]
    InvalidTransition {
        state: TaskStatus,
        event: TaskEvent,
    },
}

// ---------------------------------------------------------------------------
// TaskStateMachine
// ---------------------------------------------------------------------------

/// The authoritative task lifecycle, independent of which agent
/// executes the work.
///
/// `AwaitingApproval` is entered only from `InProgress` and exited only
/// by an approval decision (or the timeout sweeper, which rejects).
/// `Approved`/`Rejected` are transient decision states the gate passes
/// through inside its resolution critical section, so every recorded
/// lifecycle path matches the published state diagram. `Cancel` is
/// accepted everywhere except `Completed` and `Cancelled`; cancelling a
/// failed task abandons its remaining retries. `Retry` is the only
/// other way out of `Failed`; the coordinator enforces the budget.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current: TaskStatus,
    history: Vec<(TaskStatus, TaskEvent, TaskStatus)>,
}

impl TaskStateMachine {
    /// Start a fresh machine in `Created`.
    pub fn new() -> Self {
        Self::resume(TaskStatus::Created)
    }

    /// Resume a machine at a persisted status.
    pub fn resume(status: TaskStatus) -> Self {
        Self {
            current: status,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> TaskStatus {
        self.current
    }

    pub fn history(&self) -> &[(TaskStatus, TaskEvent, TaskStatus)] {
        &self.history
    }

    /// Attempt a transition driven by `event`.
    pub fn transition(&mut self, event: TaskEvent) -> Result<TaskStatus, StateMachineError> {
        let next = Self::next_state(self.current, event).ok_or(
            StateMachineError::InvalidTransition {
                state: self.current,
                event,
            },
        )?;

        let from = self.current;
        self.current = next;
        self.history.push((from, event, next));
        tracing::debug!(from = %from, event = %event, to = %next, "task state transition");
        Ok(next)
    }

    /// Returns `true` if the given event is valid in the current state.
    pub fn can_transition(&self, event: TaskEvent) -> bool {
        Self::next_state(self.current, event).is_some()
    }

    fn next_state(current: TaskStatus, event: TaskEvent) -> Option<TaskStatus> {
        let next = match (current, event) {
            (TaskStatus::Created, TaskEvent::Assign) => TaskStatus::Assigned,
            (TaskStatus::Assigned, TaskEvent::Start) => TaskStatus::InProgress,
            (TaskStatus::InProgress, TaskEvent::RequestApproval) => TaskStatus::AwaitingApproval,
            (TaskStatus::AwaitingApproval, TaskEvent::Approve) => TaskStatus::Approved,
            (TaskStatus::AwaitingApproval, TaskEvent::Reject) => TaskStatus::Rejected,
            (TaskStatus::Approved, TaskEvent::Start) => TaskStatus::InProgress,
            (TaskStatus::Rejected, TaskEvent::Fail) => TaskStatus::Failed,
            (TaskStatus::InProgress, TaskEvent::Complete) => TaskStatus::Completed,
            (TaskStatus::InProgress, TaskEvent::Fail) => TaskStatus::Failed,
            // Transport failure announcing the assignment, before any
            // agent ever started the work.
            (TaskStatus::Assigned, TaskEvent::Fail) => TaskStatus::Failed,
            (TaskStatus::Failed, TaskEvent::Retry) => TaskStatus::InProgress,
            // Abandoning a failed task forfeits whatever retry budget
            // remains; only completed and cancelled refuse the event.
            (TaskStatus::Failed, TaskEvent::Cancel) => TaskStatus::Cancelled,
            (state, TaskEvent::Cancel) if !state.is_terminal() => TaskStatus::Cancelled,
            _ => return None,
        };
        Some(next)
    }
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_to_completed() {
        let mut sm = TaskStateMachine::new();
        sm.transition(TaskEvent::Assign).unwrap();
        sm.transition(TaskEvent::Start).unwrap();
        sm.transition(TaskEvent::Complete).unwrap();
        assert_eq!(sm.state(), TaskStatus::Completed);
        assert_eq!(sm.history().len(), 3);
    }

    #[test]
    fn approval_detour_and_resume() {
        let mut sm = TaskStateMachine::new();
        sm.transition(TaskEvent::Assign).unwrap();
        sm.transition(TaskEvent::Start).unwrap();
        sm.transition(TaskEvent::RequestApproval).unwrap();
        assert_eq!(sm.state(), TaskStatus::AwaitingApproval);
        sm.transition(TaskEvent::Approve).unwrap();
        assert_eq!(sm.state(), TaskStatus::Approved);
        sm.transition(TaskEvent::Start).unwrap();
        assert_eq!(sm.state(), TaskStatus::InProgress);
    }

    #[test]
    fn rejection_leads_to_failed() {
        let mut sm = TaskStateMachine::resume(TaskStatus::AwaitingApproval);
        sm.transition(TaskEvent::Reject).unwrap();
        assert_eq!(sm.state(), TaskStatus::Rejected);
        sm.transition(TaskEvent::Fail).unwrap();
        assert_eq!(sm.state(), TaskStatus::Failed);
    }

    #[test]
    fn approval_only_from_in_progress() {
        let mut sm = TaskStateMachine::new();
        assert!(sm.transition(TaskEvent::RequestApproval).is_err());
        sm.transition(TaskEvent::Assign).unwrap();
        assert!(sm.transition(TaskEvent::RequestApproval).is_err());
    }

    #[test]
    fn retry_reenters_in_progress() {
        let mut sm = TaskStateMachine::resume(TaskStatus::Failed);
        assert!(sm.can_transition(TaskEvent::Retry));
        sm.transition(TaskEvent::Retry).unwrap();
        assert_eq!(sm.state(), TaskStatus::InProgress);
    }

    #[test]
    fn cancel_from_any_non_terminal_state() {
        for status in [
            TaskStatus::Created,
            TaskStatus::Assigned,
            TaskStatus::InProgress,
            TaskStatus::AwaitingApproval,
            TaskStatus::Approved,
            TaskStatus::Rejected,
        ] {
            let mut sm = TaskStateMachine::resume(status);
            sm.transition(TaskEvent::Cancel).unwrap();
            assert_eq!(sm.state(), TaskStatus::Cancelled);
        }
    }

    #[test]
    fn terminal_states_admit_nothing() {
        for status in [TaskStatus::Completed, TaskStatus::Cancelled] {
            let mut sm = TaskStateMachine::resume(status);
            for event in [
                TaskEvent::Assign,
                TaskEvent::Start,
                TaskEvent::Complete,
                TaskEvent::Fail,
                TaskEvent::Cancel,
                TaskEvent::Retry,
            ] {
                assert!(
                    sm.transition(event).is_err(),
                    "{status} must not accept {event}"
                );
            }
        }
        // Failed accepts only the explicit retry or an abandonment.
        let mut sm = TaskStateMachine::resume(TaskStatus::Failed);
        assert!(sm.transition(TaskEvent::Complete).is_err());
        assert!(sm.transition(TaskEvent::Retry).is_ok());
    }

    #[test]
    fn failed_task_can_be_abandoned() {
        let mut sm = TaskStateMachine::resume(TaskStatus::Failed);
        sm.transition(TaskEvent::Cancel).unwrap();
        assert_eq!(sm.state(), TaskStatus::Cancelled);
        // Once abandoned, the retry path is gone.
        assert!(!sm.can_transition(TaskEvent::Retry));
    }

    #[test]
    fn completed_never_reenters_in_progress() {
        let mut sm = TaskStateMachine::resume(TaskStatus::Completed);
        assert!(!sm.can_transition(TaskEvent::Retry));
        assert!(!sm.can_transition(TaskEvent::Start));
    }
}
