//! Domain-level error types.

use thiserror::Error;

/// Validation errors raised while building value objects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueObjectError {
    #[error("{0} must not be empty")]
    Empty(&'static str),

    #[error("{kind} is too long ({actual} > {max})")]
    TooLong {
        kind: &'static str,
        max: usize,
        actual: usize,
    },

    #[error("{kind} contains invalid character {character:?}")]
    InvalidCharacter {
        kind: &'static str,
        character: char,
    },

    #[error("invalid connection id: {0}")]
    InvalidConnectionId(String),

    #[error("unknown room kind: {0}")]
    UnknownRoomKind(String),

    #[error("unknown message type: {0}")]
    UnknownMessageKind(String),
}

/// Shared store failures (presence / room metadata / stats)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),

    #[error("store command failed: {0}")]
    Command(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Publish/subscribe bus failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("failed to publish to {subject}: {reason}")]
    Publish { subject: String, reason: String },

    #[error("failed to subscribe to {subject}: {reason}")]
    Subscribe { subject: String, reason: String },
}
