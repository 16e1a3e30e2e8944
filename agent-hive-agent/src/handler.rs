//! Message handlers and the per-agent dispatch table

use agent_hive_core::bus::{BroadcastReport, MessageBus};
use agent_hive_core::protocol::{Message, MessageKind};
use agent_hive_core::{DomainError, Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// What a handler sees of its owning agent
#[derive(Clone)]
pub struct AgentContext {
    agent_id: String,
    capabilities: Arc<Vec<String>>,
    bus: MessageBus,
}

impl AgentContext {
    pub fn new(agent_id: impl Into<String>, capabilities: Vec<String>, bus: MessageBus) -> Self {
        Self {
            agent_id: agent_id.into(),
            capabilities: Arc::new(capabilities),
            bus,
        }
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

    /// Send a fresh message from this agent; returns its id
    pub fn send(&self, recipient: &str, kind: MessageKind, payload: Value) -> Result<String> {
        let message = Message::directed(kind, self.agent_id.as_str(), recipient, payload)?;
        let id = message.id().to_string();
        self.bus.send(message)?;
        Ok(id)
    }

    /// Answer `original` from this agent, correlated to it
    pub fn reply(&self, original: &Message, kind: MessageKind, payload: Value) -> Result<()> {
        self.bus
            .send(original.reply_as(self.agent_id.as_str(), kind, payload)?)
    }

    /// Broadcast from this agent to every other registered agent
    pub fn broadcast(&self, payload: Value) -> Result<BroadcastReport> {
        self.bus
            .broadcast(Message::broadcast(self.agent_id.as_str(), payload)?)
    }
}

/// Handles one kind of message for an agent
///
/// Returning `Ok(Some(reply))` routes the reply through the bus. An `Err`
/// never escapes the agent: the runtime turns it into an ERROR reply to the
/// original sender and moves on to the next message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message, ctx: &AgentContext) -> Result<Option<Message>>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F>(F);

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Message, AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, AgentContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Message>>> + Send + 'static,
{
    async fn handle(&self, message: &Message, ctx: &AgentContext) -> Result<Option<Message>> {
        (self.0)(message.clone(), ctx.clone()).await
    }
}

/// Domain logic an agent wraps: text generation, research, analysis...
///
/// Invoked inline on the owning agent's loop. It must always terminate;
/// the only bound on total wait time is the coordinator's task deadline.
#[async_trait]
pub trait Collaborator: Send + Sync {
    async fn handle(&self, payload: &Value) -> std::result::Result<Value, DomainError>;
}

/// TASK handler that delegates to a [`Collaborator`] and answers with RESULT
pub struct TaskHandler<C> {
    collaborator: C,
}

impl<C: Collaborator> TaskHandler<C> {
    pub fn new(collaborator: C) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl<C: Collaborator> MessageHandler for TaskHandler<C> {
    async fn handle(&self, message: &Message, ctx: &AgentContext) -> Result<Option<Message>> {
        let result = self.collaborator.handle(message.payload()).await?;
        Ok(Some(message.reply_as(
            ctx.agent_id(),
            MessageKind::Result,
            result,
        )?))
    }
}

/// Exactly one handler per message kind
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<MessageKind, Arc<dyn MessageHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `kind`; a second registration is rejected
    pub fn register(&mut self, kind: MessageKind, handler: Arc<dyn MessageHandler>) -> Result<()> {
        if self.handlers.contains_key(&kind) {
            return Err(Error::Validation(format!(
                "a handler for {} messages is already registered",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    pub fn get(&self, kind: MessageKind) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in wire order
    pub fn kinds(&self) -> Vec<MessageKind> {
        MessageKind::ALL
            .into_iter()
            .filter(|kind| self.handlers.contains_key(kind))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Upper;

    #[async_trait]
    impl Collaborator for Upper {
        async fn handle(&self, payload: &Value) -> std::result::Result<Value, DomainError> {
            payload
                .as_str()
                .map(|s| json!(s.to_uppercase()))
                .ok_or_else(|| DomainError::new("expected a string payload"))
        }
    }

    fn ctx(bus: &MessageBus) -> AgentContext {
        AgentContext::new("worker", vec!["writing".into()], bus.clone())
    }

    #[test]
    fn test_duplicate_kind_rejected() {
        let mut table = HandlerTable::new();
        table
            .register(MessageKind::Task, Arc::new(TaskHandler::new(Upper)))
            .unwrap();

        let err = table
            .register(MessageKind::Task, Arc::new(TaskHandler::new(Upper)))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(table.kinds(), vec![MessageKind::Task]);
        assert!(!table.handles(MessageKind::Request));
    }

    #[tokio::test]
    async fn test_task_handler_replies_with_result() {
        let bus = MessageBus::default();
        let task = Message::directed(MessageKind::Task, "boss", "worker", json!("draft"))
            .unwrap()
            .with_correlation_id("t9");

        let reply = TaskHandler::new(Upper)
            .handle(&task, &ctx(&bus))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.kind(), MessageKind::Result);
        assert_eq!(reply.sender(), "worker");
        assert_eq!(reply.recipient(), Some("boss"));
        assert_eq!(reply.correlation_id(), Some("t9"));
        assert_eq!(reply.payload(), &json!("DRAFT"));
    }

    #[tokio::test]
    async fn test_task_handler_surfaces_domain_error() {
        let bus = MessageBus::default();
        let task = Message::directed(MessageKind::Task, "boss", "worker", json!(42)).unwrap();

        let err = TaskHandler::new(Upper)
            .handle(&task, &ctx(&bus))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handler(e) if e.message() == "expected a string payload"));
    }

    #[tokio::test]
    async fn test_handler_fn_and_context_send() {
        let bus = MessageBus::default();
        let mut boss = bus.register("boss", ["coordination"]).unwrap();

        let handler = handler_fn(|message: Message, ctx: AgentContext| async move {
            ctx.send(message.sender(), MessageKind::Response, json!("ack"))?;
            Ok::<Option<Message>, Error>(None)
        });
        let request = Message::directed(MessageKind::Request, "boss", "worker", json!(null)).unwrap();

        assert!(handler.handle(&request, &ctx(&bus)).await.unwrap().is_none());
        let ack = boss.try_recv().unwrap();
        assert_eq!(ack.payload(), &json!("ack"));
        assert_eq!(ack.sender(), "worker");
    }
}
