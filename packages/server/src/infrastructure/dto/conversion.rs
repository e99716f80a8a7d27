//! Conversion logic between DTOs and domain entities.

use hiroba_shared::time::{get_timestamp_millis, timestamp_to_rfc3339};
use uuid::Uuid;

use crate::domain::{
    ConnectionId, DeliveryScope, Envelope, Identity, NewRoom, Room, RoomId, RoomUpdate,
    Timestamp, UserId, ValueObjectError,
};

use super::{
    bus::BroadcastDto,
    http::{CreateRoomRequest, RoomDetailDto, UpdateRoomRequest},
    websocket::{EnvelopeDto, SenderDto},
};

// ========================================
// Domain Entity → DTO
// ========================================

impl From<&Identity> for SenderDto {
    fn from(identity: &Identity) -> Self {
        Self {
            user_id: identity.user_id.as_str().to_string(),
            display_name: identity.display_name.clone(),
        }
    }
}

impl From<&Envelope> for EnvelopeDto {
    fn from(envelope: &Envelope) -> Self {
        let (recipient_id, room_id, global) = match envelope.scope() {
            DeliveryScope::Local => (None, None, false),
            DeliveryScope::User(user_id) => (Some(user_id.as_str().to_string()), None, false),
            DeliveryScope::Room(room_id) => (None, Some(room_id.as_str().to_string()), false),
            DeliveryScope::Global => (None, None, true),
        };
        Self {
            id: envelope.id(),
            kind: envelope.kind(),
            sender: envelope.sender().map(SenderDto::from),
            recipient_id,
            room_id,
            global,
            payload: envelope.payload().clone(),
            timestamp: envelope.timestamp().value(),
        }
    }
}

impl BroadcastDto {
    /// Wrap an envelope for republication on a broadcast subject.
    pub fn from_envelope(
        envelope: &Envelope,
        origin: &str,
        exclude: Option<&ConnectionId>,
    ) -> Self {
        Self {
            kind: envelope.kind().as_str().to_string(),
            payload: envelope.payload().clone(),
            sender: envelope.sender().map(SenderDto::from),
            origin: Some(origin.to_string()),
            exclude_connection_id: exclude.map(ConnectionId::to_string),
            id: Some(envelope.id()),
            timestamp: Some(envelope.timestamp().value()),
        }
    }

    /// Rebuild the envelope for the given scope. Missing id / timestamp are filled in.
    pub fn into_envelope(self, scope: DeliveryScope) -> Result<Envelope, ValueObjectError> {
        let kind = self.kind.parse()?;
        let sender = self.sender.map(Identity::try_from).transpose()?;
        Ok(Envelope::from_parts(
            self.id.unwrap_or_else(Uuid::new_v4),
            kind,
            sender,
            scope,
            self.payload,
            Timestamp::new(self.timestamp.unwrap_or_else(get_timestamp_millis)),
        ))
    }
}

impl From<&Room> for RoomDetailDto {
    fn from(room: &Room) -> Self {
        Self {
            id: room.id.as_str().to_string(),
            kind: room.kind,
            name: room.name.clone(),
            description: room.description.clone(),
            created_by: room.created_by.as_ref().map(|u| u.as_str().to_string()),
            created_at: timestamp_to_rfc3339(room.created_at.value()),
            updated_at: timestamp_to_rfc3339(room.updated_at.value()),
            max_size: room.max_size,
            is_private: room.is_private,
            settings: room.settings.clone(),
            member_count: room.member_count,
            last_activity: room
                .last_activity
                .map(|t| timestamp_to_rfc3339(t.value())),
        }
    }
}

// ========================================
// DTO → Domain Entity
// ========================================

impl TryFrom<SenderDto> for Identity {
    type Error = ValueObjectError;

    fn try_from(dto: SenderDto) -> Result<Self, Self::Error> {
        Ok(Identity::new(UserId::new(dto.user_id)?, dto.display_name, None))
    }
}

impl TryFrom<EnvelopeDto> for Envelope {
    type Error = ValueObjectError;

    fn try_from(dto: EnvelopeDto) -> Result<Self, Self::Error> {
        let scope = match (dto.recipient_id, dto.room_id, dto.global) {
            (Some(user_id), _, _) => DeliveryScope::User(UserId::new(user_id)?),
            (None, Some(room_id), _) => DeliveryScope::Room(RoomId::new(room_id)?),
            (None, None, true) => DeliveryScope::Global,
            (None, None, false) => DeliveryScope::Local,
        };
        let sender = dto.sender.map(Identity::try_from).transpose()?;
        Ok(Envelope::from_parts(
            dto.id,
            dto.kind,
            sender,
            scope,
            dto.payload,
            Timestamp::new(dto.timestamp),
        ))
    }
}

impl TryFrom<CreateRoomRequest> for NewRoom {
    type Error = ValueObjectError;

    fn try_from(req: CreateRoomRequest) -> Result<Self, Self::Error> {
        Ok(Self {
            id: req.id.map(RoomId::new).transpose()?,
            kind: req.kind,
            name: req.name,
            description: req.description,
            created_by: req.created_by.map(UserId::new).transpose()?,
            max_size: req.max_size,
            is_private: req.is_private,
            settings: req.settings,
        })
    }
}

impl From<UpdateRoomRequest> for RoomUpdate {
    fn from(req: UpdateRoomRequest) -> Self {
        Self {
            name: req.name,
            description: req.description,
            max_size: req.max_size,
            is_private: req.is_private,
            settings: req.settings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::MessageKind;
    use serde_json::json;

    fn alice() -> Identity {
        Identity::new(
            UserId::new("alice".to_string()).unwrap(),
            "Alice".to_string(),
            Some("alice@example.com".to_string()),
        )
    }

    #[test]
    fn test_envelope_to_dto_sets_exactly_one_scope_field() {
        // テスト項目: DTO には配送スコープに対応するフィールドが 1 つだけ設定される
        // given (前提条件):
        let room_id = RoomId::new("lobby".to_string()).unwrap();
        let envelope = Envelope::new(
            MessageKind::Message,
            DeliveryScope::Room(room_id),
            json!({"text": "hi"}),
        )
        .with_sender(alice());

        // when (操作):
        let dto = EnvelopeDto::from(&envelope);

        // then (期待する結果):
        assert_eq!(dto.room_id.as_deref(), Some("lobby"));
        assert_eq!(dto.recipient_id, None);
        assert!(!dto.global);
        assert_eq!(dto.id, envelope.id());
    }

    #[test]
    fn test_sender_contact_is_not_exposed() {
        // テスト項目: 送信者の連絡先はワイヤに出ない
        // given (前提条件):
        let envelope = Envelope::new(MessageKind::Typing, DeliveryScope::Global, json!({}))
            .with_sender(alice());

        // when (操作):
        let json = serde_json::to_string(&EnvelopeDto::from(&envelope)).unwrap();

        // then (期待する結果):
        assert!(json.contains("\"display_name\":\"Alice\""));
        assert!(!json.contains("alice@example.com"));
        assert!(json.contains("\"global\":true"));
    }

    #[test]
    fn test_broadcast_dto_keeps_envelope_identity() {
        // テスト項目: バス経由で再構築したエンベロープは元の ID と種類を保つ
        // given (前提条件):
        let user_id = UserId::new("bob".to_string()).unwrap();
        let envelope = Envelope::new(
            MessageKind::Notification,
            DeliveryScope::User(user_id.clone()),
            json!({"text": "hello"}),
        );
        let exclude = ConnectionId::generate();

        // when (操作):
        let dto = BroadcastDto::from_envelope(&envelope, "gw-1", Some(&exclude));
        let exclude_id = dto.exclude_connection_id.clone();
        let rebuilt = dto.into_envelope(DeliveryScope::User(user_id)).unwrap();

        // then (期待する結果):
        assert_eq!(rebuilt.id(), envelope.id());
        assert_eq!(rebuilt.kind(), MessageKind::Notification);
        assert_eq!(rebuilt.payload(), envelope.payload());
        assert_eq!(exclude_id, Some(exclude.to_string()));
    }

    #[test]
    fn test_broadcast_dto_with_unknown_type_is_rejected() {
        let dto: BroadcastDto = serde_json::from_str(r#"{"type": "shout"}"#).unwrap();
        assert!(dto.into_envelope(DeliveryScope::Global).is_err());
    }

    #[test]
    fn test_create_room_request_validates_ids() {
        // テスト項目: 不正な room id を含む作成リクエストはドメインに変換できない
        // given (前提条件):
        let invalid = CreateRoomRequest {
            id: Some("has space".to_string()),
            ..Default::default()
        };
        let valid = CreateRoomRequest {
            id: Some("lobby".to_string()),
            name: "Lobby".to_string(),
            ..Default::default()
        };

        // then (期待する結果):
        assert!(NewRoom::try_from(invalid).is_err());
        let new_room = NewRoom::try_from(valid).unwrap();
        assert_eq!(new_room.id.unwrap().as_str(), "lobby");
    }
}
