//! Agent runtime: owns one agent's mailbox loop

use crate::handler::{AgentContext, Collaborator, HandlerTable, MessageHandler, TaskHandler};
use agent_hive_core::bus::{Mailbox, MessageBus};
use agent_hive_core::config::RuntimeConfig;
use agent_hive_core::protocol::{payload, AgentState, AgentStatus, Message, MessageKind};
use agent_hive_core::utils::short_id;
use agent_hive_core::{DomainError, Error, Result};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where a runtime is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Started,
    Stopping,
    Stopped,
}

/// Builder for an [`AgentRuntime`]
pub struct AgentBuilder {
    agent_id: String,
    capabilities: Vec<String>,
    handlers: HandlerTable,
    errors: Vec<String>,
    mailbox_capacity: Option<usize>,
    config: RuntimeConfig,
}

impl AgentBuilder {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Vec::new(),
            handlers: HandlerTable::new(),
            errors: Vec::new(),
            mailbox_capacity: None,
            config: RuntimeConfig::default(),
        }
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    /// Route messages of `kind` to `handler`
    ///
    /// Registering a kind twice makes [`AgentBuilder::build`] fail.
    pub fn on(mut self, kind: MessageKind, handler: impl MessageHandler + 'static) -> Self {
        if let Err(e) = self.handlers.register(kind, Arc::new(handler)) {
            self.errors.push(e.to_string());
        }
        self
    }

    /// Answer TASK messages with the collaborator's result
    pub fn on_task(self, collaborator: impl Collaborator + 'static) -> Self {
        self.on(MessageKind::Task, TaskHandler::new(collaborator))
    }

    /// Override the bus-wide mailbox capacity for this agent
    pub fn mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = Some(capacity);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self, bus: &MessageBus) -> Result<AgentRuntime> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::Validation("agent id must not be empty".to_string()));
        }
        if !self.errors.is_empty() {
            return Err(Error::Validation(format!(
                "agent '{}': {}",
                self.agent_id,
                self.errors.join("; ")
            )));
        }
        Ok(AgentRuntime {
            agent_id: self.agent_id,
            capabilities: self.capabilities,
            handlers: Arc::new(self.handlers),
            mailbox_capacity: self.mailbox_capacity,
            config: self.config,
            bus: bus.clone(),
            lifecycle: Arc::new(RwLock::new(Lifecycle::Created)),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }
}

/// Runs one agent: registers it on the bus and processes its mailbox
/// sequentially on a spawned task until stopped
pub struct AgentRuntime {
    agent_id: String,
    capabilities: Vec<String>,
    handlers: Arc<HandlerTable>,
    mailbox_capacity: Option<usize>,
    config: RuntimeConfig,
    bus: MessageBus,
    lifecycle: Arc<RwLock<Lifecycle>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentRuntime {
    pub fn builder(agent_id: impl Into<String>) -> AgentBuilder {
        AgentBuilder::new(agent_id)
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read()
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle() == Lifecycle::Started
    }

    /// Register on the bus and spawn the processing loop
    ///
    /// Only a freshly built runtime can be started.
    pub fn start(&self) -> Result<()> {
        let mailbox = {
            let mut lifecycle = self.lifecycle.write();
            if *lifecycle != Lifecycle::Created {
                return Err(Error::Validation(format!(
                    "agent '{}' cannot start from {:?}",
                    self.agent_id, *lifecycle
                )));
            }
            let mailbox = match self.mailbox_capacity {
                Some(capacity) => self.bus.register_with_capacity(
                    &self.agent_id,
                    self.capabilities.iter().cloned(),
                    capacity,
                )?,
                None => self
                    .bus
                    .register(&self.agent_id, self.capabilities.iter().cloned())?,
            };
            *lifecycle = Lifecycle::Started;
            mailbox
        };

        let worker = Worker {
            ctx: AgentContext::new(
                self.agent_id.clone(),
                self.capabilities.clone(),
                self.bus.clone(),
            ),
            handlers: self.handlers.clone(),
            catch_panics: self.config.catch_handler_panics,
            mailbox,
            shutdown: self.shutdown.clone(),
            state: LocalState::default(),
        };
        let handle = tokio::spawn(supervise(worker, self.lifecycle.clone()));
        *self.task.lock() = Some(handle);

        info!("Agent {} started", self.agent_id);
        Ok(())
    }

    /// Stop the loop and wait for it to exit
    ///
    /// A message mid-handling finishes first. Anything still queued is
    /// discarded and the agent stays registered as STOPPED with a closed
    /// mailbox, so later sends fail.
    pub async fn stop(&self) {
        {
            let mut lifecycle = self.lifecycle.write();
            match *lifecycle {
                Lifecycle::Created => {
                    *lifecycle = Lifecycle::Stopped;
                    return;
                }
                Lifecycle::Stopped => return,
                Lifecycle::Started | Lifecycle::Stopping => *lifecycle = Lifecycle::Stopping,
            }
        }

        self.shutdown.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Agent {} supervisor did not finish cleanly: {}", self.agent_id, e);
            }
        }
        info!("Agent {} stopped", self.agent_id);
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Watches the loop task; a panic that escapes it marks the agent ERROR
async fn supervise(worker: Worker, lifecycle: Arc<RwLock<Lifecycle>>) {
    let agent_id = worker.ctx.agent_id().to_string();
    let bus = worker.ctx.bus().clone();

    let final_state = match tokio::spawn(worker.run()).await {
        Ok(()) => AgentState::Stopped,
        Err(e) => {
            error!("Agent {} loop faulted: {}", agent_id, e);
            AgentState::Error
        }
    };

    if let Err(e) = bus.set_status(&agent_id, final_state) {
        debug!("Agent {} final status not recorded: {}", agent_id, e);
    }
    *lifecycle.write() = Lifecycle::Stopped;
}

#[derive(Default)]
struct LocalState {
    busy: bool,
    current_task: Option<String>,
    processed: u64,
    failed: u64,
}

struct Worker {
    ctx: AgentContext,
    handlers: Arc<HandlerTable>,
    catch_panics: bool,
    mailbox: Mailbox,
    shutdown: CancellationToken,
    state: LocalState,
}

impl Worker {
    async fn run(mut self) {
        debug!("Agent {} loop running", self.ctx.agent_id());

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                message = self.mailbox.recv() => message,
            };
            let Some(message) = next else {
                break;
            };
            self.process(message).await;
        }

        let discarded = self.mailbox.close();
        if discarded > 0 {
            warn!(
                "Agent {} discarded {} pending message(s) on stop",
                self.ctx.agent_id(),
                discarded
            );
        }
        debug!("Agent {} loop exited", self.ctx.agent_id());
    }

    async fn process(&mut self, message: Message) {
        debug!("Agent {} received {}", self.ctx.agent_id(), message);

        if message.kind() == MessageKind::Status && !self.handlers.handles(MessageKind::Status) {
            self.answer_status(&message);
            return;
        }

        self.state.busy = true;
        self.state.current_task = (message.kind() == MessageKind::Task).then(|| task_id_of(&message));
        self.publish(AgentState::Busy);

        match self.dispatch(&message).await {
            Ok(Some(reply)) => self.deliver(reply),
            Ok(None) => {}
            Err(e) => {
                self.state.failed += 1;
                error!(
                    "Agent {} failed handling {} message {}: {}",
                    self.ctx.agent_id(),
                    message.kind(),
                    short_id(message.id(), 8),
                    e
                );
                self.reply_error(&message, &e);
            }
        }

        self.state.processed += 1;
        self.state.busy = false;
        self.state.current_task = None;
        self.publish(AgentState::Idle);
    }

    async fn dispatch(&self, message: &Message) -> Result<Option<Message>> {
        let Some(handler) = self.handlers.get(message.kind()) else {
            return Err(Error::Validation(format!(
                "agent '{}' has no handler for {} messages",
                self.ctx.agent_id(),
                message.kind()
            )));
        };

        if !self.catch_panics {
            return handler.handle(message, &self.ctx).await;
        }
        match AssertUnwindSafe(handler.handle(message, &self.ctx))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::Handler(DomainError::new(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))),
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            agent_id: self.ctx.agent_id().to_string(),
            state: if self.state.busy {
                AgentState::Busy
            } else {
                AgentState::Idle
            },
            current_task: self.state.current_task.clone(),
            capabilities: self.ctx.capabilities().to_vec(),
            workload: if self.state.busy { 0.5 } else { 0.0 },
            processed: self.state.processed,
            failed: self.state.failed,
        }
    }

    fn answer_status(&self, request: &Message) {
        let body = payload::status_response(&self.status());
        match request.reply_as(self.ctx.agent_id(), MessageKind::StatusResponse, body) {
            Ok(reply) => self.deliver(reply),
            Err(e) => warn!("Agent {} cannot answer status: {}", self.ctx.agent_id(), e),
        }
    }

    fn reply_error(&self, original: &Message, failure: &Error) {
        // Never answer an ERROR with an ERROR
        if original.kind() == MessageKind::Error {
            return;
        }
        let text = match failure {
            Error::Handler(e) => e.message().to_string(),
            other => other.to_string(),
        };
        match original.reply_as(
            self.ctx.agent_id(),
            MessageKind::Error,
            payload::error(&text, original.id()),
        ) {
            Ok(reply) => self.deliver(reply),
            Err(e) => warn!("Agent {} cannot build error reply: {}", self.ctx.agent_id(), e),
        }
    }

    fn deliver(&self, reply: Message) {
        let outcome = match reply.recipient() {
            Some(_) => self.ctx.bus().send(reply),
            None => self.ctx.bus().broadcast(reply).map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!("Agent {} could not deliver reply: {}", self.ctx.agent_id(), e);
        }
    }

    fn publish(&self, state: AgentState) {
        if let Err(e) = self.ctx.bus().set_status(self.ctx.agent_id(), state) {
            debug!("Agent {} status not published: {}", self.ctx.agent_id(), e);
        }
    }
}

fn task_id_of(message: &Message) -> String {
    message
        .payload()
        .get("task_id")
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| message.correlation_key())
        .to_string()
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use agent_hive_core::config::BusConfig;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    struct Echo;

    struct Panics(&'static str);

    #[async_trait]
    impl MessageHandler for Panics {
        async fn handle(&self, _message: &Message, _ctx: &AgentContext) -> Result<Option<Message>> {
            panic!("{}", self.0)
        }
    }

    #[async_trait]
    impl Collaborator for Echo {
        async fn handle(&self, payload: &Value) -> std::result::Result<Value, DomainError> {
            if payload == &json!("boom") {
                return Err(DomainError::new("cannot echo boom"));
            }
            Ok(json!({"echo": payload}))
        }
    }

    async fn next(mailbox: &mut Mailbox) -> Message {
        timeout(Duration::from_secs(2), mailbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("mailbox closed")
    }

    async fn wait_for_state(bus: &MessageBus, agent_id: &str, state: AgentState) {
        timeout(Duration::from_secs(2), async {
            while bus.agent(agent_id).map(|a| a.state) != Some(state) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("agent never reached expected state");
    }

    #[tokio::test]
    async fn test_duplicate_handler_fails_build() {
        let bus = MessageBus::default();
        let err = AgentRuntime::builder("writer")
            .on_task(Echo)
            .on_task(Echo)
            .build(&bus)
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let bus = MessageBus::default();
        let agent = AgentRuntime::builder("writer").on_task(Echo).build(&bus).unwrap();
        agent.start().unwrap();
        assert!(agent.start().is_err());
        assert!(agent.is_running());
        agent.stop().await;
        assert_eq!(agent.lifecycle(), Lifecycle::Stopped);
    }

    #[tokio::test]
    async fn test_task_answered_with_result() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();
        let agent = AgentRuntime::builder("writer")
            .capability("writing")
            .on_task(Echo)
            .build(&bus)
            .unwrap();
        agent.start().unwrap();

        let task = Message::directed(MessageKind::Task, "boss", "writer", json!("hi"))
            .unwrap()
            .with_correlation_id("t1");
        bus.send(task).unwrap();

        let reply = next(&mut boss).await;
        assert_eq!(reply.kind(), MessageKind::Result);
        assert_eq!(reply.correlation_id(), Some("t1"));
        assert_eq!(reply.payload(), &json!({"echo": "hi"}));

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_handler_error_becomes_single_error_reply() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();
        let agent = AgentRuntime::builder("writer").on_task(Echo).build(&bus).unwrap();
        agent.start().unwrap();

        let bad = Message::directed(MessageKind::Task, "boss", "writer", json!("boom")).unwrap();
        let bad_id = bad.id().to_string();
        bus.send(bad).unwrap();
        bus.send(Message::directed(MessageKind::Task, "boss", "writer", json!("ok")).unwrap())
            .unwrap();

        let failure = next(&mut boss).await;
        assert_eq!(failure.kind(), MessageKind::Error);
        assert_eq!(failure.correlation_id(), Some(bad_id.as_str()));
        assert_eq!(payload::error_text(failure.payload()), "cannot echo boom");

        let success = next(&mut boss).await;
        assert_eq!(success.kind(), MessageKind::Result);
        assert!(boss.try_recv().is_none());

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_missing_handler_reported() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();
        let agent = AgentRuntime::builder("writer").on_task(Echo).build(&bus).unwrap();
        agent.start().unwrap();

        bus.send(Message::directed(MessageKind::Request, "boss", "writer", json!({})).unwrap())
            .unwrap();
        let failure = next(&mut boss).await;
        assert_eq!(failure.kind(), MessageKind::Error);
        assert!(payload::error_text(failure.payload()).contains("no handler for REQUEST"));

        // An unhandled ERROR is logged, never answered
        bus.send(Message::directed(MessageKind::Error, "boss", "writer", json!("x")).unwrap())
            .unwrap();
        bus.send(Message::directed(MessageKind::Task, "boss", "writer", json!("ok")).unwrap())
            .unwrap();
        assert_eq!(next(&mut boss).await.kind(), MessageKind::Result);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_panicking_handler_is_contained() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();
        let agent = AgentRuntime::builder("writer")
            .on(
                MessageKind::Request,
                Panics("lost the plot"),
            )
            .on_task(Echo)
            .build(&bus)
            .unwrap();
        agent.start().unwrap();

        bus.send(Message::directed(MessageKind::Request, "boss", "writer", json!({})).unwrap())
            .unwrap();
        let failure = next(&mut boss).await;
        assert_eq!(failure.kind(), MessageKind::Error);
        assert!(payload::error_text(failure.payload()).contains("lost the plot"));

        bus.send(Message::directed(MessageKind::Task, "boss", "writer", json!("still here")).unwrap())
            .unwrap();
        assert_eq!(next(&mut boss).await.kind(), MessageKind::Result);
        assert!(agent.is_running());

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_uncaught_panic_marks_agent_error() {
        let bus = MessageBus::default();
        let agent = AgentRuntime::builder("fragile")
            .config(RuntimeConfig {
                catch_handler_panics: false,
            })
            .on(
                MessageKind::Request,
                Panics("fatal"),
            )
            .build(&bus)
            .unwrap();
        agent.start().unwrap();

        bus.send(Message::directed(MessageKind::Request, "boss", "fragile", json!({})).unwrap())
            .unwrap();
        wait_for_state(&bus, "fragile", AgentState::Error).await;

        let err = bus
            .send(Message::directed(MessageKind::Task, "boss", "fragile", json!({})).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::MailboxClosed(_)));
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_builtin_status_reply() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();
        let agent = AgentRuntime::builder("writer")
            .capabilities(["writing", "analysis"])
            .on_task(Echo)
            .build(&bus)
            .unwrap();
        agent.start().unwrap();

        bus.send(Message::directed(MessageKind::Task, "boss", "writer", json!("a")).unwrap())
            .unwrap();
        next(&mut boss).await;

        let request =
            Message::directed(MessageKind::Status, "boss", "writer", payload::status_request())
                .unwrap();
        let request_id = request.id().to_string();
        bus.send(request).unwrap();

        let reply = next(&mut boss).await;
        assert_eq!(reply.kind(), MessageKind::StatusResponse);
        assert_eq!(reply.correlation_id(), Some(request_id.as_str()));
        let status = payload::parse_status_response(reply.payload()).unwrap();
        assert_eq!(status.agent_id, "writer");
        assert_eq!(status.state, AgentState::Idle);
        assert_eq!(status.capabilities, vec!["writing", "analysis"]);
        assert_eq!(status.processed, 1);
        assert_eq!(status.failed, 0);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_stop_discards_queue_and_closes_mailbox() {
        let bus = MessageBus::new(BusConfig {
            mailbox_capacity: 16,
            ..Default::default()
        });
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let calls = Arc::new(AtomicUsize::new(0));
        let handled = calls.clone();
        let agent = AgentRuntime::builder("slow")
            .on(
                MessageKind::Task,
                handler_fn(move |_message: Message, _ctx: AgentContext| {
                    handled.fetch_add(1, Ordering::SeqCst);
                    let mut release = release_rx.clone();
                    async move {
                        let _ = release.wait_for(|released| *released).await;
                        Ok::<Option<Message>, Error>(None)
                    }
                }),
            )
            .build(&bus)
            .unwrap();
        agent.start().unwrap();

        for _ in 0..3 {
            bus.send(Message::directed(MessageKind::Task, "boss", "slow", json!({})).unwrap())
                .unwrap();
        }
        wait_for_state(&bus, "slow", AgentState::Busy).await;

        let stopping = agent.stop();
        tokio::pin!(stopping);
        // The in-flight handler holds the loop until released
        assert!(timeout(Duration::from_millis(50), &mut stopping).await.is_err());
        release_tx.send(true).unwrap();
        stopping.await;

        // Only the in-flight message was handled; the two queued behind it were discarded
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let info = bus.agent("slow").unwrap();
        assert_eq!(info.state, AgentState::Stopped);
        let err = bus
            .send(Message::directed(MessageKind::Task, "boss", "slow", json!({})).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::MailboxClosed(_)));
    }
}
