//! Message bus for agent-to-agent delivery
//!
//! The bus owns the agent registry, one bounded mailbox per agent and a
//! capacity-bounded history of everything routed through it.

pub mod history;
pub mod mailbox;
pub mod queue;

pub use history::HistoryEntry;
pub use mailbox::Mailbox;
pub use queue::{AgentInfo, BroadcastReport, MessageBus};
