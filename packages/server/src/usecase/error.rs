//! UseCase 層のエラー定義

use thiserror::Error;

use crate::domain::{ErrorCode, StoreError, ValueObjectError};

/// Room Directory / membership errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room '{0}' not found")]
    NotFound(String),

    #[error("room '{0}' is full")]
    Full(String),

    #[error("not a member of room '{0}'")]
    NotMember(String),

    #[error("connection '{0}' is not connected")]
    ConnectionNotFound(String),

    #[error("invalid room: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<ValueObjectError> for RoomError {
    fn from(e: ValueObjectError) -> Self {
        RoomError::Invalid(e.to_string())
    }
}

impl RoomError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RoomError::NotFound(_) => ErrorCode::RoomNotFound,
            RoomError::Full(_) => ErrorCode::RoomFull,
            RoomError::NotMember(_) => ErrorCode::NotMember,
            RoomError::Invalid(_) => ErrorCode::InvalidMessage,
            RoomError::ConnectionNotFound(_) | RoomError::Store(_) => ErrorCode::Internal,
        }
    }
}

/// Event Bridge errors: bus payload decoding and inbound client dispatch
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error(transparent)]
    Invalid(#[from] ValueObjectError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("chat is disabled in room '{0}'")]
    ChatDisabled(String),

    #[error("rate limit exceeded in room '{0}'")]
    RateLimited(String),
}

impl From<serde_json::Error> for BridgeError {
    fn from(e: serde_json::Error) -> Self {
        BridgeError::Decode(e.to_string())
    }
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Decode(_) | BridgeError::MissingField(_) | BridgeError::Invalid(_) => {
                ErrorCode::InvalidMessage
            }
            BridgeError::Room(e) => e.code(),
            BridgeError::ChatDisabled(_) => ErrorCode::ChatDisabled,
            BridgeError::RateLimited(_) => ErrorCode::RateLimited,
        }
    }
}
