//! Bounded history of routed messages

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::protocol::Message;

/// Record of one `send` or `broadcast` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Monotonic position in the bus history
    pub sequence: u64,
    pub message: Message,
    /// Agents the message was enqueued for
    pub recipients: Vec<String>,
    pub recorded_at: DateTime<Utc>,
}

impl HistoryEntry {
    /// Whether the agent sent or received this message
    pub fn involves(&self, agent_id: &str) -> bool {
        self.message.sender() == agent_id || self.recipients.iter().any(|r| r == agent_id)
    }
}

/// Ring buffer keeping the newest `capacity` entries
#[derive(Debug)]
pub(crate) struct History {
    entries: VecDeque<HistoryEntry>,
    capacity: usize,
    next_sequence: u64,
}

impl History {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            next_sequence: 0,
        }
    }

    pub(crate) fn record(&mut self, message: Message, recipients: Vec<String>) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.next_sequence += 1;
        self.entries.push_back(HistoryEntry {
            sequence: self.next_sequence,
            message,
            recipients,
            recorded_at: Utc::now(),
        });
    }

    /// Newest `limit` entries, oldest first
    pub(crate) fn recent(&self, limit: usize) -> Vec<HistoryEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn involving(&self, agent_id: &str, limit: usize) -> Vec<HistoryEntry> {
        let matching: Vec<&HistoryEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.involves(agent_id))
            .collect();
        let skip = matching.len().saturating_sub(limit);
        matching.into_iter().skip(skip).cloned().collect()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
