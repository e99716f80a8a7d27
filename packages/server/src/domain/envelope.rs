//! The message envelope exchanged between clients, the gateway and the bus.

use std::{fmt, str::FromStr};

use hiroba_shared::time::get_timestamp_millis;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::{
    entity::Identity,
    error::ValueObjectError,
    value_object::{RoomId, Timestamp, UserId},
};

/// Closed catalogue of message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    // system
    Connect,
    Disconnect,
    Ping,
    Pong,
    Error,
    // room control
    JoinRoom,
    LeaveRoom,
    RoomUpdate,
    // domain
    EventUpdate,
    Registration,
    Reminder,
    LiveLocation,
    LiveAttendance,
    LivePoll,
    LiveQna,
    Notification,
    // chat
    Message,
    RoomMessage,
    Typing,
}

impl MessageKind {
    pub const ALL: [MessageKind; 19] = [
        MessageKind::Connect,
        MessageKind::Disconnect,
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Error,
        MessageKind::JoinRoom,
        MessageKind::LeaveRoom,
        MessageKind::RoomUpdate,
        MessageKind::EventUpdate,
        MessageKind::Registration,
        MessageKind::Reminder,
        MessageKind::LiveLocation,
        MessageKind::LiveAttendance,
        MessageKind::LivePoll,
        MessageKind::LiveQna,
        MessageKind::Notification,
        MessageKind::Message,
        MessageKind::RoomMessage,
        MessageKind::Typing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Connect => "connect",
            MessageKind::Disconnect => "disconnect",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::Error => "error",
            MessageKind::JoinRoom => "join_room",
            MessageKind::LeaveRoom => "leave_room",
            MessageKind::RoomUpdate => "room_update",
            MessageKind::EventUpdate => "event_update",
            MessageKind::Registration => "registration",
            MessageKind::Reminder => "reminder",
            MessageKind::LiveLocation => "live_location",
            MessageKind::LiveAttendance => "live_attendance",
            MessageKind::LivePoll => "live_poll",
            MessageKind::LiveQna => "live_qna",
            MessageKind::Notification => "notification",
            MessageKind::Message => "message",
            MessageKind::RoomMessage => "room_message",
            MessageKind::Typing => "typing",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageKind {
    type Err = ValueObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ValueObjectError::UnknownMessageKind(s.to_string()))
    }
}

/// Where an envelope is supposed to go. Exactly one scope per envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeliveryScope {
    /// Handled by the connection that produced or receives it; never fanned out
    Local,
    User(UserId),
    Room(RoomId),
    Global,
}

/// Error codes reported back to a client in an `error` envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    RoomNotFound,
    NotMember,
    RoomFull,
    ChatDisabled,
    RateLimited,
    Internal,
}

/// Immutable message unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: Uuid,
    kind: MessageKind,
    sender: Option<Identity>,
    scope: DeliveryScope,
    payload: Value,
    timestamp: Timestamp,
}

impl Envelope {
    /// Build a new envelope stamped with the current time.
    pub fn new(kind: MessageKind, scope: DeliveryScope, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            sender: None,
            scope,
            payload,
            timestamp: Timestamp::new(get_timestamp_millis()),
        }
    }

    /// Rebuild an envelope received from the wire, keeping its identity.
    pub fn from_parts(
        id: Uuid,
        kind: MessageKind,
        sender: Option<Identity>,
        scope: DeliveryScope,
        payload: Value,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id,
            kind,
            sender,
            scope,
            payload,
            timestamp,
        }
    }

    pub fn with_sender(mut self, sender: Identity) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            MessageKind::Error,
            DeliveryScope::Local,
            json!({ "code": code, "message": message.into() }),
        )
    }

    pub fn pong() -> Self {
        Self::new(MessageKind::Pong, DeliveryScope::Local, Value::Null)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> Option<&Identity> {
        self.sender.as_ref()
    }

    pub fn scope(&self) -> &DeliveryScope {
        &self.scope
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match &self.scope {
            DeliveryScope::Room(room_id) => Some(room_id),
            _ => None,
        }
    }

    pub fn recipient(&self) -> Option<&UserId> {
        match &self.scope {
            DeliveryScope::User(user_id) => Some(user_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_kind_wire_tags_are_unique_and_parseable() {
        // テスト項目: すべての MessageKind がワイヤ表現から復元できる
        for kind in MessageKind::ALL {
            assert_eq!(kind.as_str().parse::<MessageKind>().unwrap(), kind);
            // serde と as_str の表現が一致していること
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                Value::String(kind.as_str().to_string())
            );
        }
        assert!("shout".parse::<MessageKind>().is_err());
    }

    #[test]
    fn test_error_envelope_is_local_and_carries_code() {
        // テスト項目: error エンベロープはローカルスコープでコードとメッセージを持つ
        // when (操作):
        let envelope = Envelope::error(ErrorCode::NotMember, "not a member of lobby");

        // then (期待する結果):
        assert_eq!(envelope.kind(), MessageKind::Error);
        assert_eq!(envelope.scope(), &DeliveryScope::Local);
        assert_eq!(envelope.payload()["code"], "not_member");
        assert_eq!(envelope.payload()["message"], "not a member of lobby");
    }

    #[test]
    fn test_scope_accessors_follow_delivery_scope() {
        // テスト項目: room_id / recipient は DeliveryScope に従う
        // given (前提条件):
        let room_id = RoomId::new("lobby".to_string()).unwrap();
        let user_id = UserId::new("alice".to_string()).unwrap();

        // when (操作):
        let to_room = Envelope::new(
            MessageKind::Message,
            DeliveryScope::Room(room_id.clone()),
            Value::Null,
        );
        let to_user = Envelope::new(
            MessageKind::Notification,
            DeliveryScope::User(user_id.clone()),
            Value::Null,
        );

        // then (期待する結果):
        assert_eq!(to_room.room_id(), Some(&room_id));
        assert_eq!(to_room.recipient(), None);
        assert_eq!(to_user.recipient(), Some(&user_id));
        assert_eq!(to_user.room_id(), None);
    }
}
