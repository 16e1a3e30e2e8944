//! Task and agent status structures shared by the runtime and coordinator

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::utils::new_id;

/// Well-known capability tags
pub mod capability {
    pub const RESEARCH: &str = "research";
    pub const WRITING: &str = "writing";
    pub const ANALYSIS: &str = "analysis";
    pub const COORDINATION: &str = "coordination";
    pub const DATA_PROCESSING: &str = "data_processing";
}

/// Default task priority
pub const DEFAULT_PRIORITY: u8 = 5;

/// Highest task priority
pub const MAX_PRIORITY: u8 = 10;

/// A unit of work handed to an agent in a TASK message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub description: String,
    #[serde(default)]
    pub task_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl Task {
    /// Create a task with a generated id
    pub fn new(description: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            task_id: new_id(),
            description: description.into(),
            task_type: task_type.into(),
            parameters: Map::new(),
            priority: DEFAULT_PRIORITY,
            required_capabilities: Vec::new(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = task_id.into();
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Set the priority, clamped to `0..=MAX_PRIORITY`
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    /// Encode as a TASK payload
    pub fn to_payload(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a TASK payload
    pub fn from_payload(payload: &Value) -> crate::Result<Self> {
        let task: Task = serde_json::from_value(payload.clone())?;
        if task.task_id.trim().is_empty() {
            return Err(crate::Error::Validation("task_id must not be empty".into()));
        }
        Ok(task)
    }
}

/// Lifecycle of a coordinated task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::TimedOut | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Assigned => "ASSIGNED",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::TimedOut => "TIMED_OUT",
            TaskStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Registry-visible state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentState {
    Idle,
    Busy,
    Stopped,
    Error,
}

impl AgentState {
    /// Whether the agent can still take work
    pub fn is_available(&self) -> bool {
        matches!(self, AgentState::Idle | AgentState::Busy)
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Idle => "IDLE",
            AgentState::Busy => "BUSY",
            AgentState::Stopped => "STOPPED",
            AgentState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Status report an agent returns for a STATUS request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub state: AgentState,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 0.0 (idle) to 1.0 (saturated)
    #[serde(default)]
    pub workload: f64,
    #[serde(default)]
    pub processed: u64,
    #[serde(default)]
    pub failed: u64,
}
