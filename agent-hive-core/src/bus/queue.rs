//! Shared routing hub: agent registry, bounded mailboxes and history

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::history::{History, HistoryEntry};
use super::mailbox::Mailbox;
use crate::config::BusConfig;
use crate::protocol::{AgentState, Message};
use crate::{Error, Result};

/// Registry entry for one agent; the bus holds the sending half of its mailbox
struct AgentRecord {
    capabilities: BTreeSet<String>,
    state: AgentState,
    registered_at: DateTime<Utc>,
    /// Registration order, used for deterministic iteration
    seq: u64,
    capacity: usize,
    mailbox: mpsc::Sender<Message>,
    closed: CancellationToken,
}

impl AgentRecord {
    fn pending(&self) -> usize {
        self.capacity.saturating_sub(self.mailbox.capacity())
    }

    fn enqueue(&self, agent_id: &str, message: Message) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(Error::MailboxClosed(agent_id.to_string()));
        }
        self.mailbox.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => Error::MailboxFull(format!(
                "{} (capacity {})",
                agent_id, self.capacity
            )),
            TrySendError::Closed(_) => Error::MailboxClosed(agent_id.to_string()),
        })
    }
}

/// Snapshot of a registered agent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub state: AgentState,
    pub registered_at: DateTime<Utc>,
    /// Messages waiting in the mailbox
    pub pending: usize,
}

/// Per-recipient outcome of a broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: Vec<String>,
    pub rejected: Vec<(String, Error)>,
}

impl BroadcastReport {
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }
}

struct Registry {
    agents: HashMap<String, AgentRecord>,
    next_seq: u64,
    history: History,
}

impl Registry {
    fn ordered(&self) -> Vec<(&String, &AgentRecord)> {
        let mut agents: Vec<_> = self.agents.iter().collect();
        agents.sort_by_key(|(_, record)| record.seq);
        agents
    }
}

/// Routing hub shared by every agent and the coordinator
///
/// Cloning is cheap; clones share one registry. Every registry operation
/// runs under a single lock that is never held across an await point, and
/// enqueueing never blocks: a full mailbox is reported to the caller.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Mutex<Registry>>,
    config: BusConfig,
}

impl MessageBus {
    /// Create a new message bus
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                agents: HashMap::new(),
                next_seq: 0,
                history: History::new(config.history_capacity),
            })),
            config,
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Register an agent with the default mailbox capacity
    pub fn register<I, S>(&self, agent_id: &str, capabilities: I) -> Result<Mailbox>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.register_with_capacity(agent_id, capabilities, self.config.mailbox_capacity)
    }

    /// Register an agent with an explicit mailbox capacity
    pub fn register_with_capacity<I, S>(
        &self,
        agent_id: &str,
        capabilities: I,
        capacity: usize,
    ) -> Result<Mailbox>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if agent_id.trim().is_empty() {
            return Err(Error::Validation("agent id must not be empty".into()));
        }
        if capacity == 0 {
            return Err(Error::Validation(format!(
                "mailbox capacity for '{}' must be > 0",
                agent_id
            )));
        }

        let capabilities: BTreeSet<String> = capabilities.into_iter().map(Into::into).collect();
        let mut registry = self.inner.lock();
        if registry.agents.contains_key(agent_id) {
            return Err(Error::DuplicateAgent(agent_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(capacity);
        let closed = CancellationToken::new();
        registry.next_seq += 1;
        let seq = registry.next_seq;
        registry.agents.insert(
            agent_id.to_string(),
            AgentRecord {
                capabilities: capabilities.clone(),
                state: AgentState::Idle,
                registered_at: Utc::now(),
                seq,
                capacity,
                mailbox: tx,
                closed: closed.clone(),
            },
        );

        info!(
            "Registered agent: {} (capabilities: {:?}, mailbox: {})",
            agent_id, capabilities, capacity
        );
        Ok(Mailbox::new(agent_id.to_string(), capacity, rx, closed))
    }

    /// Remove an agent; anything still queued for it is discarded
    pub fn unregister(&self, agent_id: &str) -> Result<()> {
        let record = self
            .inner
            .lock()
            .agents
            .remove(agent_id)
            .ok_or_else(|| Error::UnknownRecipient(agent_id.to_string()))?;

        let pending = record.pending();
        record.closed.cancel();
        info!("Unregistered agent: {} ({} pending discarded)", agent_id, pending);
        Ok(())
    }

    /// Deliver a message to its recipient's mailbox
    ///
    /// Messages from one sender to one recipient are enqueued in call order.
    pub fn send(&self, message: Message) -> Result<()> {
        message.validate()?;
        let recipient = message.recipient().map(ToString::to_string).ok_or_else(|| {
            Error::Validation(format!(
                "{} has no recipient; use broadcast instead",
                message
            ))
        })?;

        let mut registry = self.inner.lock();
        let record = registry
            .agents
            .get(&recipient)
            .ok_or_else(|| Error::UnknownRecipient(recipient.clone()))?;

        if let Err(e) = record.enqueue(&recipient, message.clone()) {
            warn!("Delivery of {} failed: {}", message, e);
            return Err(e);
        }

        debug!(
            "Message sent: {} -> {} ({})",
            message.sender(),
            recipient,
            message.kind()
        );
        registry.history.record(message, vec![recipient]);
        Ok(())
    }

    /// Deliver a copy to every registered agent except the sender
    pub fn broadcast(&self, message: Message) -> Result<BroadcastReport> {
        self.broadcast_excluding(message, &HashSet::new())
    }

    /// Broadcast, additionally skipping the agents in `exclude`
    ///
    /// Each recipient's capacity is honoured independently; rejections are
    /// reported per recipient. One history entry is recorded per call.
    pub fn broadcast_excluding(
        &self,
        message: Message,
        exclude: &HashSet<String>,
    ) -> Result<BroadcastReport> {
        message.validate()?;
        let mut report = BroadcastReport::default();

        let mut registry = self.inner.lock();
        for (agent_id, record) in registry.ordered() {
            if agent_id == message.sender() || exclude.contains(agent_id) {
                continue;
            }
            match record.enqueue(agent_id, message.clone()) {
                Ok(()) => report.delivered.push(agent_id.clone()),
                Err(e) => {
                    warn!("Broadcast {} not delivered to {}: {}", message, agent_id, e);
                    report.rejected.push((agent_id.clone(), e));
                }
            }
        }

        debug!(
            "Broadcast from {} to {} agents ({} rejected)",
            message.sender(),
            report.delivered.len(),
            report.rejected.len()
        );
        registry
            .history
            .record(message, report.delivered.clone());
        Ok(report)
    }

    /// Most recent `limit` history entries, newest last
    pub fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.inner.lock().history.recent(limit)
    }

    /// Most recent `limit` entries sent by or delivered to `agent_id`
    pub fn history_for(&self, agent_id: &str, limit: usize) -> Vec<HistoryEntry> {
        self.inner.lock().history.involving(agent_id, limit)
    }

    /// Clear message history
    pub fn clear_history(&self) {
        self.inner.lock().history.clear();
        info!("Message history cleared");
    }

    /// All registered agents in registration order
    pub fn list_agents(&self) -> Vec<AgentInfo> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .map(|(id, record)| info_for(id, record))
            .collect()
    }

    /// Registered agent ids in registration order
    pub fn registered_agents(&self) -> Vec<String> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn agent(&self, agent_id: &str) -> Option<AgentInfo> {
        self.inner
            .lock()
            .agents
            .get(agent_id)
            .map(|record| info_for(agent_id, record))
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.inner.lock().agents.contains_key(agent_id)
    }

    /// Available agents advertising `capability`, in registration order
    pub fn capable_agents(&self, capability: &str) -> Vec<AgentInfo> {
        self.inner
            .lock()
            .ordered()
            .into_iter()
            .filter(|(_, record)| {
                record.state.is_available()
                    && !record.closed.is_cancelled()
                    && record.capabilities.contains(capability)
            })
            .map(|(id, record)| info_for(id, record))
            .collect()
    }

    /// Update the registry-visible state of an agent
    pub fn set_status(&self, agent_id: &str, state: AgentState) -> Result<()> {
        let mut registry = self.inner.lock();
        let record = registry
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| Error::UnknownRecipient(agent_id.to_string()))?;
        if record.state != state {
            debug!("Agent {} state: {} -> {}", agent_id, record.state, state);
            record.state = state;
        }
        Ok(())
    }

    /// Number of messages waiting in an agent's mailbox
    pub fn pending(&self, agent_id: &str) -> Option<usize> {
        self.inner.lock().agents.get(agent_id).map(AgentRecord::pending)
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

fn info_for(agent_id: &str, record: &AgentRecord) -> AgentInfo {
    AgentInfo {
        agent_id: agent_id.to_string(),
        capabilities: record.capabilities.iter().cloned().collect(),
        state: record.state,
        registered_at: record.registered_at,
        pending: record.pending(),
    }
}
