//! Agent runtime and coordination for agent-hive
//!
//! An agent is a handler table plus a capability list, driven by an
//! [`AgentRuntime`] that drains its mailbox on a dedicated task. The
//! [`Coordinator`] sits on the same bus, hands out tasks by capability and
//! collects correlated replies under deadlines.

pub mod coordinator;
pub mod handler;
pub mod plan;
pub mod runtime;

pub use coordinator::{Coordinator, TaskAssignment, TaskOutcome};
pub use handler::{
    handler_fn, AgentContext, Collaborator, FnHandler, HandlerTable, MessageHandler, TaskHandler,
};
pub use plan::{CompositeOutcome, CompositeTask, Subtask};
pub use runtime::{AgentBuilder, AgentRuntime, Lifecycle};
