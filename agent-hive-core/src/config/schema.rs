//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for agent-hive
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// Agent runtime configuration
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Coordinator configuration
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Default mailbox capacity for newly registered agents
    #[serde(default = "default_mailbox_capacity")]
    pub mailbox_capacity: usize,
    /// Number of history entries kept before the oldest are evicted
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

fn default_mailbox_capacity() -> usize {
    64
}

fn default_history_capacity() -> usize {
    1000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: default_mailbox_capacity(),
            history_capacity: default_history_capacity(),
        }
    }
}

/// Agent runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Treat a panicking handler as a handler failure instead of a loop fault
    #[serde(default = "default_true")]
    pub catch_handler_panics: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            catch_handler_panics: true,
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Id the coordinator registers under on the bus
    #[serde(default = "default_coordinator_id")]
    pub agent_id: String,
    /// Capabilities advertised by the coordinator itself
    #[serde(default = "default_coordinator_capabilities")]
    pub capabilities: Vec<String>,
    /// Deadline used when a caller does not supply one
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long a status sweep waits for each agent
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
}

fn default_coordinator_id() -> String {
    "coordinator".to_string()
}

fn default_coordinator_capabilities() -> Vec<String> {
    vec!["coordination".to_string()]
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_status_timeout_ms() -> u64 {
    1_000
}

impl CoordinatorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            agent_id: default_coordinator_id(),
            capabilities: default_coordinator_capabilities(),
            default_timeout_ms: default_timeout_ms(),
            status_timeout_ms: default_status_timeout_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Days to keep rolled log files
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_retention_days() -> u64 {
    7
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            retention_days: default_retention_days(),
            overrides: HashMap::new(),
        }
    }
}
