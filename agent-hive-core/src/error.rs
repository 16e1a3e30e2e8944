//! Error types for agent-hive

use thiserror::Error;

/// The main error type for agent-hive operations
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed message construction or invalid arguments
    #[error("Validation error: {0}")]
    Validation(String),

    /// An agent with this id is already registered
    #[error("Agent already registered: {0}")]
    DuplicateAgent(String),

    /// No agent with this id is registered
    #[error("Unknown recipient: {0}")]
    UnknownRecipient(String),

    /// The recipient's mailbox is at capacity
    #[error("Mailbox full: {0}")]
    MailboxFull(String),

    /// The recipient is registered but no longer consuming its mailbox
    #[error("Mailbox closed: {0}")]
    MailboxClosed(String),

    /// No registered agent advertises the requested capability
    #[error("No agent with capability: {0}")]
    NoCapableAgent(String),

    /// A handler failed while processing a message
    #[error("Handler error: {0}")]
    Handler(#[from] DomainError),

    /// A wait elapsed without a reply
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A specialized Result type for agent-hive operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Failure reported by a domain collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DomainError {
    message: String,
}

impl DomainError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for DomainError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for DomainError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}
