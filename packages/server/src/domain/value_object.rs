//! Value objects shared by every layer of the gateway.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ValueObjectError;

/// Upper bound for user and room identifiers.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Characters that would break a bus subject token.
const FORBIDDEN_IDENTIFIER_CHARS: [char; 3] = ['.', '*', '>'];

fn validate_identifier(kind: &'static str, value: &str) -> Result<(), ValueObjectError> {
    if value.is_empty() {
        return Err(ValueObjectError::Empty(kind));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValueObjectError::TooLong {
            kind,
            max: MAX_IDENTIFIER_LEN,
            actual: value.len(),
        });
    }
    if let Some(c) = value
        .chars()
        .find(|c| c.is_whitespace() || FORBIDDEN_IDENTIFIER_CHARS.contains(c))
    {
        return Err(ValueObjectError::InvalidCharacter { kind, character: c });
    }
    Ok(())
}

/// Identifier assigned to a connection when it is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = ValueObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ValueObjectError::InvalidConnectionId(s.to_string()))
    }
}

/// Identity of an authenticated user, as handed over by the upstream auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        validate_identifier("user id", &value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ValueObjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable room identifier such as `event:42` or `private:alice:bob`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: String) -> Result<Self, ValueObjectError> {
        validate_identifier("room id", &value)?;
        Ok(Self(value))
    }

    /// Room used for discussion around an external event.
    pub fn event_discussion(event_id: &str) -> Result<Self, ValueObjectError> {
        Self::new(format!("{EVENT_DISCUSSION_PREFIX}{event_id}"))
    }

    /// Room used for live features (polls, Q&A, attendance) of an external event.
    pub fn event_live(event_id: &str) -> Result<Self, ValueObjectError> {
        Self::new(format!("{EVENT_LIVE_PREFIX}{event_id}"))
    }

    /// Deterministic room for two participants; argument order does not matter.
    pub fn private_chat(a: &UserId, b: &UserId) -> Result<Self, ValueObjectError> {
        let (first, second) = if a <= b { (a, b) } else { (b, a) };
        Self::new(format!("{PRIVATE_CHAT_PREFIX}{first}:{second}"))
    }

    /// The external event this room is tied to, if it is an event room.
    pub fn linked_event(&self) -> Option<&str> {
        self.0
            .strip_prefix(EVENT_LIVE_PREFIX)
            .or_else(|| self.0.strip_prefix(EVENT_DISCUSSION_PREFIX))
            .filter(|id| !id.is_empty())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

const EVENT_DISCUSSION_PREFIX: &str = "event:";
const EVENT_LIVE_PREFIX: &str = "event_live:";
const PRIVATE_CHAT_PREFIX: &str = "private:";

impl TryFrom<String> for RoomId {
    type Error = ValueObjectError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoomId> for String {
    fn from(value: RoomId) -> Self {
        value.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds (UTC).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub fn new(millis: i64) -> Self {
        Self(millis)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    /// Milliseconds elapsed from `self` until `later` (zero if `later` is earlier).
    pub fn elapsed_until(&self, later: Timestamp) -> i64 {
        (later.0 - self.0).max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_rejects_empty_and_subject_breaking_characters() {
        // テスト項目: 空文字やサブジェクトを壊す文字を含む UserId は作成できない
        // when (操作):
        let empty = UserId::new(String::new());
        let dotted = UserId::new("alice.smith".to_string());
        let spaced = UserId::new("alice smith".to_string());
        let wildcard = UserId::new("alice>".to_string());

        // then (期待する結果):
        assert_eq!(empty, Err(ValueObjectError::Empty("user id")));
        assert!(matches!(
            dotted,
            Err(ValueObjectError::InvalidCharacter { character: '.', .. })
        ));
        assert!(spaced.is_err());
        assert!(wildcard.is_err());
    }

    #[test]
    fn test_room_id_rejects_too_long_value() {
        // テスト項目: 最大長を超える RoomId は作成できない
        // given (前提条件):
        let value = "r".repeat(MAX_IDENTIFIER_LEN + 1);

        // when (操作):
        let result = RoomId::new(value);

        // then (期待する結果):
        assert!(matches!(result, Err(ValueObjectError::TooLong { .. })));
    }

    #[test]
    fn test_private_chat_room_id_is_order_independent() {
        // テスト項目: private chat の RoomId は参加者の順序に依存しない
        // given (前提条件):
        let alice = UserId::new("alice".to_string()).unwrap();
        let bob = UserId::new("bob".to_string()).unwrap();

        // when (操作):
        let ab = RoomId::private_chat(&alice, &bob).unwrap();
        let ba = RoomId::private_chat(&bob, &alice).unwrap();

        // then (期待する結果):
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str(), "private:alice:bob");
    }

    #[test]
    fn test_linked_event_is_extracted_from_event_rooms_only() {
        // テスト項目: イベント系の RoomId からのみイベント ID が取り出せる
        // when (操作):
        let discussion = RoomId::event_discussion("42").unwrap();
        let live = RoomId::event_live("7").unwrap();
        let general = RoomId::new("lobby".to_string()).unwrap();

        // then (期待する結果):
        assert_eq!(discussion.linked_event(), Some("42"));
        assert_eq!(live.linked_event(), Some("7"));
        assert_eq!(general.linked_event(), None);
    }

    #[test]
    fn test_connection_id_round_trips_through_display() {
        // テスト項目: ConnectionId は文字列表現から復元できる
        // given (前提条件):
        let id = ConnectionId::generate();

        // when (操作):
        let parsed: ConnectionId = id.to_string().parse().unwrap();

        // then (期待する結果):
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<ConnectionId>().is_err());
    }

    #[test]
    fn test_timestamp_elapsed_until_never_negative() {
        // テスト項目: elapsed_until は負の値を返さない
        // given (前提条件):
        let earlier = Timestamp::new(1_000);
        let later = Timestamp::new(4_000);

        // then (期待する結果):
        assert_eq!(earlier.elapsed_until(later), 3_000);
        assert_eq!(later.elapsed_until(earlier), 0);
    }
}
