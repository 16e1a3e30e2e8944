//! Core types for agent-hive
//!
//! This crate provides the message envelope and protocol vocabulary, the
//! routing bus shared by every agent, and the configuration and logging
//! used by the other agent-hive crates.

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod utils;

pub use error::{DomainError, Error, Result};
