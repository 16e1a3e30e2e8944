//! The message envelope exchanged between agents

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::utils::{new_id, short_id};

/// Kinds of messages that can travel over the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Task,
    Result,
    Request,
    Response,
    Broadcast,
    Status,
    StatusResponse,
    Error,
}

impl MessageKind {
    /// Every kind, in wire order
    pub const ALL: [MessageKind; 8] = [
        MessageKind::Task,
        MessageKind::Result,
        MessageKind::Request,
        MessageKind::Response,
        MessageKind::Broadcast,
        MessageKind::Status,
        MessageKind::StatusResponse,
        MessageKind::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Task => "TASK",
            MessageKind::Result => "RESULT",
            MessageKind::Request => "REQUEST",
            MessageKind::Response => "RESPONSE",
            MessageKind::Broadcast => "BROADCAST",
            MessageKind::Status => "STATUS",
            MessageKind::StatusResponse => "STATUS_RESPONSE",
            MessageKind::Error => "ERROR",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        let normalized = s.trim().to_ascii_uppercase();
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| crate::Error::Validation(format!("unknown message kind '{}'", s)))
    }
}

/// Immutable envelope routed by the bus
///
/// The payload and metadata are opaque to the bus and runtime. A reply
/// must carry the `correlation_id` of the message it answers; use
/// [`Message::reply`] or [`Message::reply_as`] to get that right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMessage")]
pub struct Message {
    id: String,
    kind: MessageKind,
    sender: String,
    recipient: Option<String>,
    correlation_id: Option<String>,
    payload: Value,
    metadata: HashMap<String, Value>,
    created_at: DateTime<Utc>,
}

impl Message {
    /// Create a new message with a fresh id
    ///
    /// Fails with a validation error when the sender is empty, or when the
    /// recipient is absent for anything but a broadcast.
    pub fn new(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: Option<String>,
        payload: Value,
    ) -> crate::Result<Self> {
        let message = Self {
            id: new_id(),
            kind,
            sender: sender.into(),
            recipient,
            correlation_id: None,
            payload,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        };
        message.validate()?;
        Ok(message)
    }

    /// Create a message addressed to a single agent
    pub fn directed(
        kind: MessageKind,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: Value,
    ) -> crate::Result<Self> {
        Self::new(kind, sender, Some(recipient.into()), payload)
    }

    /// Create a broadcast message
    pub fn broadcast(sender: impl Into<String>, payload: Value) -> crate::Result<Self> {
        Self::new(MessageKind::Broadcast, sender, None, payload)
    }

    /// Replace the generated id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the correlation id linking this message to an earlier one
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Add metadata to the message
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check the envelope invariants
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.trim().is_empty() {
            return Err(crate::Error::Validation("message id must not be empty".into()));
        }
        if self.sender.trim().is_empty() {
            return Err(crate::Error::Validation("message sender must not be empty".into()));
        }
        match &self.recipient {
            Some(recipient) if recipient.trim().is_empty() => Err(crate::Error::Validation(
                "message recipient must not be empty".into(),
            )),
            None if self.kind != MessageKind::Broadcast => Err(crate::Error::Validation(format!(
                "{} message from '{}' has no recipient",
                self.kind, self.sender
            ))),
            _ => Ok(()),
        }
    }

    /// Build a reply: sender and recipient swapped, correlation propagated
    pub fn reply(&self, kind: MessageKind, payload: Value) -> crate::Result<Self> {
        let responder = self.recipient.as_deref().ok_or_else(|| {
            crate::Error::Validation(format!(
                "message {} has no recipient to reply from; use reply_as",
                self.id
            ))
        })?;
        self.reply_as(responder, kind, payload)
    }

    /// Build a reply sent by `responder`, used for broadcast copies
    pub fn reply_as(
        &self,
        responder: impl Into<String>,
        kind: MessageKind,
        payload: Value,
    ) -> crate::Result<Self> {
        Ok(
            Self::new(kind, responder, Some(self.sender.clone()), payload)?
                .with_correlation_id(self.correlation_key()),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> Option<&str> {
        self.recipient.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    /// The id a reply to this message must carry as its correlation id
    pub fn correlation_key(&self) -> &str {
        self.correlation_id.as_deref().unwrap_or(&self.id)
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize to the canonical wire shape
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a message from its wire shape
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        let wire: WireMessage = serde_json::from_str(raw)?;
        Message::try_from(wire)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message(id={}..., from={}, to={}, kind={})",
            short_id(&self.id, 8),
            self.sender,
            self.recipient.as_deref().unwrap_or("*"),
            self.kind
        )
    }
}

#[derive(Deserialize)]
struct WireMessage {
    id: String,
    kind: String,
    sender: String,
    #[serde(default)]
    recipient: Option<String>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    metadata: HashMap<String, Value>,
    created_at: DateTime<Utc>,
}

impl TryFrom<WireMessage> for Message {
    type Error = crate::Error;

    fn try_from(wire: WireMessage) -> crate::Result<Self> {
        let message = Message {
            id: wire.id,
            kind: wire.kind.parse()?,
            sender: wire.sender,
            recipient: wire.recipient,
            correlation_id: wire.correlation_id,
            payload: wire.payload,
            metadata: wire.metadata,
            created_at: wire.created_at,
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use serde_json::json;

    #[test]
    fn test_message_creation() {
        let msg = Message::directed(
            MessageKind::Task,
            "agent_1",
            "agent_2",
            json!({"data": "test"}),
        )
        .unwrap();

        assert_eq!(msg.sender(), "agent_1");
        assert_eq!(msg.recipient(), Some("agent_2"));
        assert_eq!(msg.kind(), MessageKind::Task);
        assert_eq!(msg.payload(), &json!({"data": "test"}));
        assert!(msg.correlation_id().is_none());
        assert!(!msg.id().is_empty());
    }

    #[test]
    fn test_missing_recipient_rejected_unless_broadcast() {
        let err = Message::new(MessageKind::Task, "agent_1", None, json!(null)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let msg = Message::broadcast("manager", json!({"announcement": "hi"})).unwrap();
        assert!(msg.recipient().is_none());
    }

    #[test]
    fn test_empty_sender_rejected() {
        let err = Message::directed(MessageKind::Request, " ", "b", json!(null)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_reply_swaps_and_correlates() {
        let original = Message::directed(
            MessageKind::Task,
            "agent_1",
            "agent_2",
            json!({"data": "test"}),
        )
        .unwrap();

        let reply = original
            .reply(MessageKind::Response, json!({"result": "done"}))
            .unwrap();

        assert_eq!(reply.recipient(), Some("agent_1"));
        assert_eq!(reply.sender(), "agent_2");
        assert_eq!(reply.correlation_id(), Some(original.id()));
        assert_eq!(reply.payload(), &json!({"result": "done"}));
        assert_ne!(reply.id(), original.id());
    }

    #[test]
    fn test_reply_propagates_existing_correlation() {
        let original = Message::directed(MessageKind::Task, "coordinator", "worker", json!({}))
            .unwrap()
            .with_correlation_id("task-7");

        let reply = original.reply(MessageKind::Result, json!(1)).unwrap();
        assert_eq!(reply.correlation_id(), Some("task-7"));
    }

    #[test]
    fn test_reply_to_broadcast_requires_responder() {
        let original = Message::broadcast("manager", json!("ping")).unwrap();
        assert!(original.reply(MessageKind::Response, json!("pong")).is_err());

        let reply = original
            .reply_as("worker", MessageKind::Response, json!("pong"))
            .unwrap();
        assert_eq!(reply.sender(), "worker");
        assert_eq!(reply.recipient(), Some("manager"));
        assert_eq!(reply.correlation_id(), Some(original.id()));
    }

    #[test]
    fn test_wire_shape_uses_canonical_fields() {
        let msg = Message::directed(MessageKind::StatusResponse, "a", "b", json!({"x": 1}))
            .unwrap()
            .with_metadata("priority", 3);
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert_eq!(value["kind"], "STATUS_RESPONSE");
        assert_eq!(value["sender"], "a");
        assert_eq!(value["recipient"], "b");
        assert_eq!(value["correlation_id"], Value::Null);
        assert_eq!(value["metadata"]["priority"], 3);
        assert!(value.get("created_at").is_some());

        let parsed = Message::from_json(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_wire_rejects_unknown_kind() {
        let raw = r#"{"id":"m1","kind":"GOSSIP","sender":"a","recipient":"b",
            "payload":null,"created_at":"2024-01-01T00:00:00Z"}"#;
        let err = Message::from_json(raw).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_wire_rejects_missing_recipient() {
        let raw = r#"{"id":"m1","kind":"TASK","sender":"a",
            "payload":null,"created_at":"2024-01-01T00:00:00Z"}"#;
        assert!(Message::from_json(raw).is_err());
    }

    #[test]
    fn test_kind_parsing_is_case_insensitive() {
        assert_eq!("status_response".parse::<MessageKind>().unwrap(), MessageKind::StatusResponse);
        assert!("nope".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_display_truncates_id() {
        let msg = Message::directed(MessageKind::Task, "a", "b", json!(null))
            .unwrap()
            .with_id("0123456789abcdef");
        assert_eq!(
            msg.to_string(),
            "Message(id=01234567..., from=a, to=b, kind=TASK)"
        );
    }
}
