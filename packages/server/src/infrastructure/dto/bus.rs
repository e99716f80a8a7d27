//! Bus payload DTOs.
//!
//! Domain subjects (event updates, registrations, live features, ...) carry a
//! free-form JSON object; the gateway only reads the identifiers it needs to
//! resolve a delivery target. Broadcast subjects carry a [`BroadcastDto`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::websocket::SenderDto;

/// Payload on the user / room / global broadcast subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastDto {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SenderDto>,
    /// Instance that already delivered this envelope to its local connections
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_connection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Structured payload of a domain subject.
#[derive(Debug, Clone, PartialEq)]
pub struct DomainPayload(Map<String, Value>);

impl DomainPayload {
    /// Decode a domain payload; anything but a JSON object is rejected.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes).map(Self)
    }

    /// The external event id, accepting both numbers and strings.
    pub fn event_id(&self) -> Option<String> {
        self.identifier("event_id")
    }

    pub fn user_id(&self) -> Option<String> {
        self.identifier("user_id")
    }

    fn identifier(&self, field: &str) -> Option<String> {
        match self.0.get(field)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_accept_numbers_and_strings() {
        // テスト項目: event_id / user_id は数値でも文字列でも取り出せる
        // given (前提条件):
        let numeric = DomainPayload::decode(br#"{"event_id": 42, "user_id": "alice"}"#).unwrap();
        let textual = DomainPayload::decode(br#"{"event_id": "42", "user_id": 7}"#).unwrap();

        // then (期待する結果):
        assert_eq!(numeric.event_id().as_deref(), Some("42"));
        assert_eq!(numeric.user_id().as_deref(), Some("alice"));
        assert_eq!(textual.event_id().as_deref(), Some("42"));
        assert_eq!(textual.user_id().as_deref(), Some("7"));
    }

    #[test]
    fn test_missing_or_empty_identifiers_are_none() {
        let payload = DomainPayload::decode(br#"{"event_id": "", "title": "x"}"#).unwrap();
        assert_eq!(payload.event_id(), None);
        assert_eq!(payload.user_id(), None);
    }

    #[test]
    fn test_non_object_payload_is_rejected() {
        assert!(DomainPayload::decode(b"[1, 2, 3]").is_err());
        assert!(DomainPayload::decode(b"not json").is_err());
    }

    #[test]
    fn test_broadcast_dto_minimal_form() {
        // テスト項目: 外部サービスは type と payload だけで送信できる
        // when (操作):
        let dto: BroadcastDto =
            serde_json::from_str(r#"{"type": "notification", "payload": {"text": "hi"}}"#)
                .unwrap();

        // then (期待する結果):
        assert_eq!(dto.kind, "notification");
        assert_eq!(dto.payload["text"], "hi");
        assert!(dto.origin.is_none());
        assert!(dto.id.is_none());
    }
}
