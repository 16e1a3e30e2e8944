//! Message envelope and the shared protocol vocabulary
//!
//! Everything here is plain data; routing lives in [`crate::bus`].

pub mod message;
pub mod payload;
pub mod task;

pub use message::{Message, MessageKind};
pub use task::{capability, AgentState, AgentStatus, Task, TaskStatus};
