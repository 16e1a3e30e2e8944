//! Task coordination: capability-based assignment and correlated waits

use agent_hive_core::bus::{Mailbox, MessageBus};
use agent_hive_core::config::CoordinatorConfig;
use agent_hive_core::protocol::{payload, AgentStatus, Message, MessageKind, Task, TaskStatus};
use agent_hive_core::{Error, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Terminal result of waiting on a task
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            Self::Completed(_) => TaskStatus::Completed,
            Self::Failed(_) => TaskStatus::Failed,
            Self::TimedOut => TaskStatus::TimedOut,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Failed(error) => Some(error),
            _ => None,
        }
    }

    /// Interpret a correlated reply that no assignment tracks
    fn from_reply(message: &Message) -> Self {
        match message.kind() {
            MessageKind::Error => Self::Failed(payload::error_text(message.payload())),
            _ => Self::Completed(message.payload().clone()),
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed(value) => write!(f, "COMPLETED: {}", value),
            Self::Failed(error) => write!(f, "FAILED: {}", error),
            Self::TimedOut => f.write_str("TIMED_OUT"),
            Self::Cancelled => f.write_str("CANCELLED"),
        }
    }
}

/// Coordinator-side record of one task
#[derive(Debug, Clone, Serialize)]
pub struct TaskAssignment {
    pub task_id: String,
    pub description: String,
    pub required_capability: String,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    /// Wall-clock view of the deadline, for display
    pub deadline: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    #[serde(skip)]
    expires_at: Option<Instant>,
}

impl TaskAssignment {
    pub(crate) fn pending(task_id: String, description: String, required_capability: String) -> Self {
        Self {
            task_id,
            description,
            required_capability,
            assigned_agent: None,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            deadline: None,
            finished_at: None,
            result: None,
            error: None,
            expires_at: None,
        }
    }

    /// The terminal outcome, once there is one
    pub fn outcome(&self) -> Option<TaskOutcome> {
        match self.status {
            TaskStatus::Completed => Some(TaskOutcome::Completed(
                self.result.clone().unwrap_or(Value::Null),
            )),
            TaskStatus::Failed => Some(TaskOutcome::Failed(self.error.clone().unwrap_or_default())),
            TaskStatus::TimedOut => Some(TaskOutcome::TimedOut),
            TaskStatus::Cancelled => Some(TaskOutcome::Cancelled),
            TaskStatus::Pending | TaskStatus::Assigned => None,
        }
    }

    fn is_overdue(&self, now: Instant) -> bool {
        self.status == TaskStatus::Assigned && self.expires_at.is_some_and(|at| at <= now)
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

/// Correlations remembered without an assignment record
const RETAINED_CORRELATIONS: usize = 1024;

/// Insertion-ordered map that evicts its oldest entries past `capacity`
struct Bounded<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V> Bounded<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct CoordinatorState {
    assignments: HashMap<String, TaskAssignment>,
    /// Task ids in creation order
    order: Vec<String>,
    waiters: HashMap<String, Vec<oneshot::Sender<Message>>>,
    /// Replies whose correlation no assignment tracks and nobody awaits yet
    unclaimed: Bounded<Message>,
    /// Correlations whose replies are dropped: timed-out requests and
    /// tasks already handed out by `take_finished`
    retired: Bounded<()>,
    /// Agent id to the sequence number of its latest assignment
    last_assigned: HashMap<String, u64>,
    assignment_seq: u64,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            assignments: HashMap::new(),
            order: Vec::new(),
            waiters: HashMap::new(),
            unclaimed: Bounded::new(RETAINED_CORRELATIONS),
            retired: Bounded::new(RETAINED_CORRELATIONS),
            last_assigned: HashMap::new(),
            assignment_seq: 0,
        }
    }

    fn insert(&mut self, assignment: TaskAssignment) {
        if !self.assignments.contains_key(&assignment.task_id) {
            self.order.push(assignment.task_id.clone());
        }
        self.assignments
            .insert(assignment.task_id.clone(), assignment);
    }

    /// Move a task to a terminal status; a task settles at most once
    fn settle(&mut self, task_id: &str, outcome: TaskOutcome) -> bool {
        let Some(assignment) = self.assignments.get_mut(task_id) else {
            return false;
        };
        if assignment.status.is_terminal() {
            return false;
        }
        assignment.status = outcome.status();
        assignment.finished_at = Some(Utc::now());
        match outcome {
            TaskOutcome::Completed(value) => assignment.result = Some(value),
            TaskOutcome::Failed(error) => assignment.error = Some(error),
            TaskOutcome::TimedOut | TaskOutcome::Cancelled => {}
        }
        // Dropping the senders wakes anyone still waiting
        self.waiters.remove(task_id);
        true
    }

    fn expire_overdue(&mut self, now: Instant) {
        let overdue: Vec<String> = self
            .assignments
            .values()
            .filter(|a| a.is_overdue(now))
            .map(|a| a.task_id.clone())
            .collect();
        for task_id in overdue {
            warn!("Task {} passed its deadline", task_id);
            self.settle(&task_id, TaskOutcome::TimedOut);
        }
    }

    /// A wait on `key` ran out without a reply
    fn expire(&mut self, key: &str) {
        if self.assignments.contains_key(key) {
            if self.settle(key, TaskOutcome::TimedOut) {
                warn!("Task {} timed out", key);
            }
        } else {
            self.waiters.remove(key);
            self.retired.insert(key.to_string(), ());
        }
    }

    fn on_message(&mut self, message: Message, now: Instant) {
        let Some(key) = message.correlation_id().map(ToString::to_string) else {
            debug!("Coordinator ignoring uncorrelated {}", message);
            return;
        };

        if let Some(assignment) = self.assignments.get(&key) {
            if assignment.status.is_terminal() {
                warn!(
                    "Dropping late {} for task {} ({})",
                    message.kind(),
                    key,
                    assignment.status
                );
                return;
            }
            if assignment.is_overdue(now) {
                warn!("Dropping {} for task {}: deadline passed", message.kind(), key);
                self.settle(&key, TaskOutcome::TimedOut);
                return;
            }
            let outcome = match message.kind() {
                MessageKind::Result => TaskOutcome::Completed(message.payload().clone()),
                MessageKind::Error => TaskOutcome::Failed(payload::error_text(message.payload())),
                other => {
                    debug!("Ignoring {} for task {}", other, key);
                    return;
                }
            };
            let waiters = self.waiters.remove(&key).unwrap_or_default();
            self.settle(&key, outcome);
            info!("Task {} finished by {}", key, message.sender());
            for waiter in waiters {
                let _ = waiter.send(message.clone());
            }
            return;
        }

        if self.retired.remove(&key).is_some() {
            warn!("Dropping late {} for retired correlation {}", message.kind(), key);
            return;
        }
        match self.waiters.remove(&key) {
            Some(waiters) => {
                for waiter in waiters {
                    let _ = waiter.send(message.clone());
                }
            }
            None => {
                self.unclaimed.insert(key, message);
            }
        }
    }
}

/// Distributes tasks to capable agents and tracks them to completion
///
/// The coordinator is itself registered on the bus; a background pump
/// drains its mailbox and routes correlated replies to waiters.
pub struct Coordinator {
    agent_id: String,
    bus: MessageBus,
    config: CoordinatorConfig,
    state: Arc<Mutex<CoordinatorState>>,
    shutdown: CancellationToken,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Register on the bus and start routing replies
    pub fn start(bus: MessageBus, config: CoordinatorConfig) -> Result<Self> {
        let mailbox = bus.register(&config.agent_id, config.capabilities.iter().cloned())?;
        let state = Arc::new(Mutex::new(CoordinatorState::new()));
        let shutdown = CancellationToken::new();
        let pump = tokio::spawn(pump(mailbox, state.clone(), shutdown.clone()));

        info!("Coordinator {} started", config.agent_id);
        Ok(Self {
            agent_id: config.agent_id.clone(),
            bus,
            config,
            state,
            shutdown,
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Send `task` to a capable agent and start tracking it
    ///
    /// Among running agents advertising the capability, the one assigned
    /// least recently wins; ties go to registration order. The TASK
    /// message carries the task id as its correlation id, and the
    /// deadline starts now.
    pub fn assign_task(
        &self,
        task: Task,
        required_capability: &str,
        deadline: Duration,
    ) -> Result<TaskAssignment> {
        if task.task_id.trim().is_empty() {
            return Err(Error::Validation("task id must not be empty".to_string()));
        }

        // Held across selection and send so concurrent assignments rotate
        let mut state = self.state.lock();
        if let Some(existing) = state.assignments.get(&task.task_id) {
            if existing.status != TaskStatus::Pending {
                return Err(Error::Validation(format!(
                    "task '{}' is already {}",
                    task.task_id, existing.status
                )));
            }
        }

        let chosen = self
            .bus
            .capable_agents(required_capability)
            .into_iter()
            .filter(|agent| agent.agent_id != self.agent_id)
            .enumerate()
            .min_by_key(|(position, agent)| {
                (
                    state.last_assigned.get(&agent.agent_id).copied().unwrap_or(0),
                    *position,
                )
            })
            .map(|(_, agent)| agent.agent_id)
            .ok_or_else(|| Error::NoCapableAgent(required_capability.to_string()))?;

        let message = Message::directed(
            MessageKind::Task,
            self.agent_id.as_str(),
            chosen.as_str(),
            task.to_payload()?,
        )?
        .with_correlation_id(task.task_id.as_str())
        .with_metadata("required_capability", required_capability);
        self.bus.send(message)?;

        state.assignment_seq += 1;
        let seq = state.assignment_seq;
        state.last_assigned.insert(chosen.clone(), seq);

        let assignment = TaskAssignment {
            assigned_agent: Some(chosen.clone()),
            status: TaskStatus::Assigned,
            deadline: deadline_at(deadline),
            expires_at: Instant::now().checked_add(deadline),
            ..TaskAssignment::pending(
                task.task_id.clone(),
                task.description.clone(),
                required_capability.to_string(),
            )
        };
        state.insert(assignment.clone());

        info!(
            "Assigned task {} to {} (capability: {}, deadline: {:?})",
            task.task_id, chosen, required_capability, deadline
        );
        Ok(assignment)
    }

    /// Wait for the task's correlated reply
    ///
    /// Returns as soon as the task is terminal. Gives up with
    /// [`TaskOutcome::TimedOut`] when `timeout` or the task's own deadline
    /// runs out first; a reply arriving after that is dropped.
    pub async fn await_result(&self, task_id: &str, timeout: Duration) -> TaskOutcome {
        let wait = {
            let now = Instant::now();
            let mut state = self.state.lock();
            state.expire_overdue(now);
            match state.assignments.get(task_id) {
                Some(assignment) => {
                    if let Some(outcome) = assignment.outcome() {
                        return outcome;
                    }
                    assignment
                        .remaining(now)
                        .map_or(timeout, |remaining| remaining.min(timeout))
                }
                None => timeout,
            }
        };

        let reply = self.wait_for_reply(task_id, wait).await;
        let state = self.state.lock();
        match state.assignments.get(task_id).and_then(TaskAssignment::outcome) {
            Some(outcome) => outcome,
            None => reply
                .as_ref()
                .map_or(TaskOutcome::TimedOut, TaskOutcome::from_reply),
        }
    }

    /// Await several tasks concurrently, each under the same timeout
    pub async fn gather_all<I, S>(&self, task_ids: I, timeout: Duration) -> BTreeMap<String, TaskOutcome>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let waits = task_ids.into_iter().map(|task_id| {
            let task_id: String = task_id.into();
            async move {
                let outcome = self.await_result(&task_id, timeout).await;
                (task_id, outcome)
            }
        });
        join_all(waits).await.into_iter().collect()
    }

    /// Send one message and wait for the reply correlated to it
    pub async fn request(
        &self,
        recipient: &str,
        kind: MessageKind,
        payload: Value,
        timeout: Duration,
    ) -> Result<Message> {
        let message = Message::directed(kind, self.agent_id.as_str(), recipient, payload)?;
        let key = message.id().to_string();
        self.bus.send(message)?;

        self.wait_for_reply(&key, timeout).await.ok_or_else(|| {
            Error::Timeout(format!(
                "no reply from '{}' within {}ms",
                recipient,
                timeout.as_millis()
            ))
        })
    }

    /// Ask agents for their status concurrently
    ///
    /// Defaults to every registered agent except the coordinator. Agents
    /// that do not answer within the configured status timeout are left out.
    pub async fn gather_agent_status(
        &self,
        agent_ids: Option<Vec<String>>,
    ) -> BTreeMap<String, AgentStatus> {
        let agent_ids = agent_ids.unwrap_or_else(|| {
            self.bus
                .registered_agents()
                .into_iter()
                .filter(|id| *id != self.agent_id)
                .collect()
        });
        let timeout = self.config.status_timeout();

        let requests = agent_ids.into_iter().map(|agent_id| async move {
            let reply = self
                .request(&agent_id, MessageKind::Status, payload::status_request(), timeout)
                .await;
            let status = match reply {
                Ok(message) if message.kind() == MessageKind::StatusResponse => {
                    payload::parse_status_response(message.payload())
                }
                Ok(message) => Err(Error::Validation(format!(
                    "unexpected {} to status request",
                    message.kind()
                ))),
                Err(e) => Err(e),
            };
            (agent_id, status)
        });

        let mut statuses = BTreeMap::new();
        for (agent_id, status) in join_all(requests).await {
            match status {
                Ok(status) => {
                    statuses.insert(agent_id, status);
                }
                Err(e) => debug!("No status from {}: {}", agent_id, e),
            }
        }
        statuses
    }

    /// Cancel a task that has not finished; returns whether it was cancelled
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let cancelled = self.state.lock().settle(task_id, TaskOutcome::Cancelled);
        if cancelled {
            info!("Task {} cancelled", task_id);
        }
        cancelled
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskStatus> {
        self.assignment(task_id).map(|a| a.status)
    }

    pub fn assignment(&self, task_id: &str) -> Option<TaskAssignment> {
        let mut state = self.state.lock();
        state.expire_overdue(Instant::now());
        state.assignments.get(task_id).cloned()
    }

    /// Tasks still PENDING or ASSIGNED, oldest first
    pub fn active_tasks(&self) -> Vec<TaskAssignment> {
        let mut state = self.state.lock();
        state.expire_overdue(Instant::now());
        state
            .order
            .iter()
            .filter_map(|id| state.assignments.get(id))
            .filter(|a| !a.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Remove and return every terminal task record, oldest first
    pub fn take_finished(&self) -> Vec<TaskAssignment> {
        let mut state = self.state.lock();
        state.expire_overdue(Instant::now());
        let CoordinatorState {
            assignments,
            order,
            retired,
            ..
        } = &mut *state;

        let mut finished = Vec::new();
        order.retain(|id| {
            let terminal = assignments
                .get(id)
                .is_some_and(|a| a.status.is_terminal());
            if terminal {
                finished.extend(assignments.remove(id));
                retired.insert(id.clone(), ());
            }
            !terminal
        });
        finished
    }

    /// Stop the reply pump and leave the bus
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let pump = self.pump.lock().take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!("Coordinator pump did not finish cleanly: {}", e);
            }
        }
        if let Err(e) = self.bus.unregister(&self.agent_id) {
            debug!("Coordinator {} already unregistered: {}", self.agent_id, e);
        }
        info!("Coordinator {} stopped", self.agent_id);
    }

    /// Track a batch of PENDING tasks; nothing is tracked if any id is taken
    pub(crate) fn track_pending(&self, assignments: Vec<TaskAssignment>) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(taken) = assignments
            .iter()
            .find(|a| state.assignments.contains_key(&a.task_id))
        {
            return Err(Error::Validation(format!(
                "task '{}' is already tracked",
                taken.task_id
            )));
        }
        for assignment in assignments {
            state.insert(assignment);
        }
        Ok(())
    }

    pub(crate) fn fail_task(&self, task_id: &str, reason: &str) {
        if self
            .state
            .lock()
            .settle(task_id, TaskOutcome::Failed(reason.to_string()))
        {
            warn!("Task {} failed: {}", task_id, reason);
        }
    }

    /// Register a waiter for `key` and wait up to `wait` for the reply
    ///
    /// Exactly one of two things happens: the reply is delivered here, or
    /// the correlation is expired so a late reply is dropped.
    async fn wait_for_reply(&self, key: &str, wait: Duration) -> Option<Message> {
        let mut rx = {
            let mut state = self.state.lock();
            if let Some(message) = state.unclaimed.remove(key) {
                return Some(message);
            }
            if state
                .assignments
                .get(key)
                .is_some_and(|a| a.status.is_terminal())
            {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(key.to_string()).or_default().push(tx);
            rx
        };

        match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(message)) => Some(message),
            // Senders dropped: the task settled elsewhere or the pump stopped
            Ok(Err(_)) => {
                self.state.lock().expire(key);
                None
            }
            Err(_) => {
                let mut state = self.state.lock();
                if let Ok(message) = rx.try_recv() {
                    return Some(message);
                }
                state.expire(key);
                None
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn pump(mut mailbox: Mailbox, state: Arc<Mutex<CoordinatorState>>, shutdown: CancellationToken) {
    loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            message = mailbox.recv() => message,
        };
        let Some(message) = next else {
            break;
        };
        state.lock().on_message(message, Instant::now());
    }

    mailbox.close();
    state.lock().waiters.clear();
    debug!("Coordinator pump for {} exited", mailbox.agent_id());
}

fn deadline_at(deadline: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(deadline)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
}
