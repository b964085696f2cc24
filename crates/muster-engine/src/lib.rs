//! Squad execution engine: the task lifecycle state machine, the
//! per-squad transition authority, the human approval gate, the
//! deadline/retry supervisor, and cursor-addressed output streams.

pub mod approval;
pub mod coordinator;
pub mod handle;
pub mod runtime;
pub mod state_machine;
pub mod stream;
pub mod supervisor;

pub use approval::{ApprovalError, ApprovalGate};
pub use coordinator::{CoordinatorError, SquadCoordinator, TaskHandle, TaskLocks};
pub use handle::{
    AgentBehavior, AgentHandle, BehaviorSubscriber, OutputSink, ScriptedAgent, StepInput,
    StepOutcome,
};
pub use runtime::SquadRuntime;
pub use state_machine::{StateMachineError, TaskEvent, TaskStateMachine};
pub use stream::{Chunk, StreamError, StreamRegistry, TaskStream};
pub use supervisor::{
    AttemptOutcome, ExecutionAttempt, ExecutionSupervisor, RunOutcome, SupervisorError,
};
