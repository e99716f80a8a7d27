//! WebSocket wire DTOs.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::MessageKind;

/// Public part of a sender identity. The contact reference never leaves the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SenderDto {
    pub user_id: String,
    pub display_name: String,
}

/// Outbound envelope as written to a socket.
///
/// At most one of `recipient_id`, `room_id` and `global` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeDto {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub global: bool,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: i64,
}

/// Inbound frame sent by a client.
///
/// `type` stays a string here so an unknown type can be logged and ignored
/// instead of failing the whole frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrameDto {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}
