//! Receiving side of an agent's bounded mailbox

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::Message;

/// Bounded FIFO of inbound messages, owned by exactly one consumer
///
/// The bus keeps the sending half. Once the agent is unregistered the
/// mailbox yields nothing more: anything still queued is discarded.
pub struct Mailbox {
    agent_id: String,
    capacity: usize,
    rx: mpsc::Receiver<Message>,
    closed: CancellationToken,
}

impl Mailbox {
    pub(crate) fn new(
        agent_id: String,
        capacity: usize,
        rx: mpsc::Receiver<Message>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            agent_id,
            capacity,
            rx,
            closed,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the owning agent has been unregistered or the mailbox closed
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait for the next message
    ///
    /// Returns `None` once the mailbox is closed; pending messages are
    /// discarded at that point.
    pub async fn recv(&mut self) -> Option<Message> {
        let closed = self.closed.clone();
        let next = tokio::select! {
            biased;
            _ = closed.cancelled() => None,
            msg = self.rx.recv() => Some(msg),
        };

        match next {
            Some(msg) => msg,
            None => {
                self.close();
                None
            }
        }
    }

    /// Take the next message without waiting
    pub fn try_recv(&mut self) -> Option<Message> {
        if self.is_closed() {
            self.close();
            return None;
        }
        self.rx.try_recv().ok()
    }

    /// Stop accepting messages and discard whatever is queued
    ///
    /// Returns the number of discarded messages.
    pub fn close(&mut self) -> usize {
        self.closed.cancel();
        self.rx.close();
        let mut discarded = 0;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        discarded
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("agent_id", &self.agent_id)
            .field("capacity", &self.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}
