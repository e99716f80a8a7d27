//! UseCase: Event Bridge
//!
//! バスとローカル接続の間の橋渡しを行います。
//!
//! - バス → クライアント：ドメインイベントを subject ごとに配送先（ユーザー・ルーム）へ振り分ける
//! - クライアント → ゲートウェイ：受信フレームを種別ごとに処理する
//! - 公開ヘルパー：ローカルへ配送したうえで broadcast subject に再発行する
//!
//! 再発行したメッセージには `origin`（このインスタンスの ID）を付け、
//! 自分自身の発行分を受信したときは配送をスキップする。

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    domain::{
        BusError, BusMessage, Connection, ConnectionId, DeliveryScope, Envelope, ErrorCode,
        Identity, MessageBus, MessageKind, Room, RoomId, UserId,
        subject::{self, SUBSCRIPTIONS, Subject},
    },
    infrastructure::dto::{
        bus::{BroadcastDto, DomainPayload},
        websocket::ClientFrameDto,
    },
};

use super::{
    connection_registry::{ConnectionRegistry, DeliveryOutcome},
    error::{BridgeError, RoomError},
    room_directory::RoomDirectory,
};

pub struct EventBridge {
    registry: Arc<ConnectionRegistry>,
    rooms: Arc<RoomDirectory>,
    bus: Arc<dyn MessageBus>,
}

fn required_room(room_id: Option<String>) -> Result<RoomId, BridgeError> {
    let room_id = room_id.ok_or(BridgeError::MissingField("room_id"))?;
    Ok(RoomId::new(room_id)?)
}

fn combine(a: DeliveryOutcome, b: DeliveryOutcome) -> DeliveryOutcome {
    match (a, b) {
        (DeliveryOutcome::Delivered(x), DeliveryOutcome::Delivered(y)) => {
            DeliveryOutcome::Delivered(x + y)
        }
        (DeliveryOutcome::Delivered(_), _) => a,
        (_, DeliveryOutcome::Delivered(_)) => b,
        _ => a,
    }
}

impl EventBridge {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        rooms: Arc<RoomDirectory>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            registry,
            rooms,
            bus,
        }
    }

    fn instance_id(&self) -> &str {
        self.registry.instance_id()
    }

    /// 全 subject を購読し、購読ごとの受信ループと切断通知のループを起動する
    pub async fn start(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut tasks = Vec::with_capacity(SUBSCRIPTIONS.len() + 1);

        for pattern in SUBSCRIPTIONS {
            let mut subscription = self.bus.subscribe(pattern).await?;
            let bridge = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        message = subscription.next() => match message {
                            Some(message) => bridge.dispatch_bus_message(&message).await,
                            None => {
                                tracing::warn!("Subscription '{}' ended", pattern);
                                break;
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }

        let mut departures = self.registry.departures().await;
        let bridge = Arc::clone(self);
        let mut shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    departed = departures.recv() => match departed {
                        Some(connection) => bridge.announce_departure(&connection).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));

        tracing::info!("Event bridge subscribed to {} subject(s)", SUBSCRIPTIONS.len());
        Ok(tasks)
    }

    async fn dispatch_bus_message(&self, message: &BusMessage) {
        match self
            .handle_bus_message(&message.subject, &message.payload)
            .await
        {
            Ok(Some(outcome)) => {
                tracing::debug!("Routed '{}': {:?}", message.subject, outcome);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Dropping message on '{}': {}", message.subject, e);
            }
        }
    }

    /// バスから受信したメッセージを配送先に振り分ける
    ///
    /// 未知の subject と自インスタンスが発行したブロードキャストは `Ok(None)`。
    pub async fn handle_bus_message(
        &self,
        subject_name: &str,
        payload: &[u8],
    ) -> Result<Option<DeliveryOutcome>, BridgeError> {
        let Some(parsed) = Subject::parse(subject_name) else {
            tracing::debug!("Ignoring unknown subject '{}'", subject_name);
            return Ok(None);
        };

        let outcome = match parsed {
            Subject::EventUpdate => {
                let payload = DomainPayload::decode(payload)?;
                let event_id = payload.event_id().ok_or(BridgeError::MissingField("event_id"))?;
                self.touch_event(&event_id).await;
                let room_id = RoomId::event_discussion(&event_id)?;
                self.deliver_to_room(&room_id, MessageKind::EventUpdate, payload.into_value())
                    .await
            }
            Subject::LiveLocation => self.route_live(MessageKind::LiveLocation, payload).await?,
            Subject::LiveAttendance => {
                self.route_live(MessageKind::LiveAttendance, payload).await?
            }
            Subject::LivePoll => self.route_live(MessageKind::LivePoll, payload).await?,
            Subject::LiveQna => self.route_live(MessageKind::LiveQna, payload).await?,
            Subject::EventRegistration => {
                let payload = DomainPayload::decode(payload)?;
                let event_id = payload.event_id().ok_or(BridgeError::MissingField("event_id"))?;
                let user_id = UserId::new(
                    payload.user_id().ok_or(BridgeError::MissingField("user_id"))?,
                )?;
                self.touch_event(&event_id).await;
                let room_id = RoomId::event_discussion(&event_id)?;
                let value = payload.into_value();

                let to_user = self
                    .registry
                    .send_to_user(
                        &user_id,
                        Envelope::new(
                            MessageKind::Registration,
                            DeliveryScope::User(user_id.clone()),
                            value.clone(),
                        ),
                    )
                    .await;
                let to_room = self
                    .deliver_to_room(&room_id, MessageKind::Registration, value)
                    .await;
                combine(to_user, to_room)
            }
            Subject::EventReminder => {
                self.route_to_user(MessageKind::Reminder, payload).await?
            }
            Subject::Notification => {
                self.route_to_user(MessageKind::Notification, payload).await?
            }
            Subject::UserBroadcast(user) => {
                let Some(dto) = self.foreign_broadcast(payload)? else {
                    return Ok(None);
                };
                let user_id = UserId::new(user.to_string())?;
                let envelope = dto.into_envelope(DeliveryScope::User(user_id.clone()))?;
                self.registry.send_to_user(&user_id, envelope).await
            }
            Subject::RoomBroadcast(room) => {
                let Some(dto) = self.foreign_broadcast(payload)? else {
                    return Ok(None);
                };
                let room_id = RoomId::new(room.to_string())?;
                let exclude = dto
                    .exclude_connection_id
                    .as_deref()
                    .map(str::parse::<ConnectionId>)
                    .transpose()?;
                let envelope = dto.into_envelope(DeliveryScope::Room(room_id.clone()))?;
                self.registry
                    .broadcast_to_room(&room_id, envelope, exclude.as_ref())
                    .await
            }
            Subject::GlobalBroadcast => {
                let Some(dto) = self.foreign_broadcast(payload)? else {
                    return Ok(None);
                };
                let envelope = dto.into_envelope(DeliveryScope::Global)?;
                self.registry.broadcast_global(envelope).await
            }
        };

        Ok(Some(outcome))
    }

    /// 他インスタンスが発行したブロードキャストのみを返す
    fn foreign_broadcast(&self, payload: &[u8]) -> Result<Option<BroadcastDto>, BridgeError> {
        let dto: BroadcastDto = serde_json::from_slice(payload)?;
        if dto.origin.as_deref() == Some(self.instance_id()) {
            tracing::trace!("Skipping broadcast published by this instance");
            return Ok(None);
        }
        Ok(Some(dto))
    }

    async fn route_live(
        &self,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<DeliveryOutcome, BridgeError> {
        let payload = DomainPayload::decode(payload)?;
        let event_id = payload.event_id().ok_or(BridgeError::MissingField("event_id"))?;
        self.touch_event(&event_id).await;
        let room_id = RoomId::event_live(&event_id)?;
        Ok(self
            .deliver_to_room(&room_id, kind, payload.into_value())
            .await)
    }

    async fn route_to_user(
        &self,
        kind: MessageKind,
        payload: &[u8],
    ) -> Result<DeliveryOutcome, BridgeError> {
        let payload = DomainPayload::decode(payload)?;
        let user_id = UserId::new(payload.user_id().ok_or(BridgeError::MissingField("user_id"))?)?;
        if let Some(event_id) = payload.event_id() {
            self.touch_event(&event_id).await;
        }
        let envelope = Envelope::new(
            kind,
            DeliveryScope::User(user_id.clone()),
            payload.into_value(),
        );
        Ok(self.registry.send_to_user(&user_id, envelope).await)
    }

    async fn deliver_to_room(
        &self,
        room_id: &RoomId,
        kind: MessageKind,
        payload: Value,
    ) -> DeliveryOutcome {
        let envelope = Envelope::new(kind, DeliveryScope::Room(room_id.clone()), payload);
        self.registry
            .broadcast_to_room(room_id, envelope, None)
            .await
    }

    async fn touch_event(&self, event_id: &str) {
        if let Err(e) = self.rooms.mark_event_active(event_id).await {
            tracing::warn!("Failed to mark event '{}' active: {}", event_id, e);
        }
    }

    // ========================================
    // Publishing
    // ========================================

    async fn republish(&self, subject_name: &str, envelope: &Envelope, exclude: Option<&ConnectionId>) {
        let dto = BroadcastDto::from_envelope(envelope, self.instance_id(), exclude);
        let bytes = match serde_json::to_vec(&dto) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Failed to encode broadcast for '{}': {}", subject_name, e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(subject_name, Bytes::from(bytes)).await {
            tracing::warn!("Failed to publish to '{}': {}", subject_name, e);
        }
    }

    /// ローカル配送のうえ、他インスタンスへ再発行する
    pub async fn publish_to_user(&self, user_id: &UserId, envelope: Envelope) -> DeliveryOutcome {
        let outcome = self
            .registry
            .send_to_user(user_id, envelope.clone())
            .await;
        self.republish(&subject::user_broadcast(user_id), &envelope, None)
            .await;
        outcome
    }

    /// ローカル配送のうえ、他インスタンスへ再発行する
    pub async fn publish_to_room(
        &self,
        room_id: &RoomId,
        envelope: Envelope,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryOutcome {
        let outcome = self
            .registry
            .broadcast_to_room(room_id, envelope.clone(), exclude)
            .await;
        self.republish(&subject::room_broadcast(room_id), &envelope, exclude)
            .await;
        outcome
    }

    pub async fn publish_global(&self, envelope: Envelope) -> DeliveryOutcome {
        let outcome = self.registry.broadcast_global(envelope.clone()).await;
        self.republish(subject::BROADCAST_GLOBAL, &envelope, None)
            .await;
        outcome
    }

    async fn announce_departure(&self, connection: &Connection) {
        for room_id in &connection.rooms {
            let envelope = Envelope::new(
                MessageKind::RoomUpdate,
                DeliveryScope::Room(room_id.clone()),
                json!({
                    "action": "user_left",
                    "room_id": room_id,
                    "user_id": connection.identity.user_id,
                    "display_name": connection.identity.display_name,
                    "reason": "disconnected",
                }),
            );
            self.publish_to_room(room_id, envelope, None).await;
        }
    }

    // ========================================
    // Membership
    // ========================================

    /// ルームに参加させ、本人に確認を、他のメンバーに参加通知を送る
    pub async fn join_room(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Result<Room, BridgeError> {
        let identity = self.identity_of(connection_id).await?;
        let room = self.registry.join_room(connection_id, room_id).await?;

        let ack = Envelope::new(
            MessageKind::RoomUpdate,
            DeliveryScope::Room(room_id.clone()),
            json!({
                "action": "joined",
                "room_id": room_id,
                "name": room.name,
                "kind": room.kind,
                "member_count": room.member_count,
            }),
        );
        self.registry.send_to_connection(connection_id, ack).await;

        let notice = Envelope::new(
            MessageKind::RoomUpdate,
            DeliveryScope::Room(room_id.clone()),
            json!({
                "action": "user_joined",
                "room_id": room_id,
                "user_id": identity.user_id,
                "display_name": identity.display_name,
                "member_count": room.member_count,
            }),
        );
        self.publish_to_room(room_id, notice, Some(connection_id))
            .await;

        Ok(room)
    }

    /// ルームから退出させ、本人に確認を、残りのメンバーに退出通知を送る
    pub async fn leave_room(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Result<usize, BridgeError> {
        let identity = self.identity_of(connection_id).await?;
        let remaining = self.registry.leave_room(connection_id, room_id).await?;

        let ack = Envelope::new(
            MessageKind::RoomUpdate,
            DeliveryScope::Room(room_id.clone()),
            json!({
                "action": "left",
                "room_id": room_id,
                "member_count": remaining,
            }),
        );
        self.registry.send_to_connection(connection_id, ack).await;

        let notice = Envelope::new(
            MessageKind::RoomUpdate,
            DeliveryScope::Room(room_id.clone()),
            json!({
                "action": "user_left",
                "room_id": room_id,
                "user_id": identity.user_id,
                "display_name": identity.display_name,
                "member_count": remaining,
            }),
        );
        self.publish_to_room(room_id, notice, None).await;

        Ok(remaining)
    }

    async fn identity_of(&self, connection_id: &ConnectionId) -> Result<Identity, BridgeError> {
        self.registry
            .connection(connection_id)
            .await
            .map(|c| c.identity)
            .ok_or_else(|| RoomError::ConnectionNotFound(connection_id.to_string()).into())
    }

    // ========================================
    // Client → gateway
    // ========================================

    /// クライアントから受信したテキストフレームを処理する
    ///
    /// 不正な JSON にはエラーエンベロープを返し、未知の種別は記録して無視する。
    pub async fn handle_client_text(&self, connection_id: &ConnectionId, text: &str) {
        let frame: ClientFrameDto = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!("Malformed frame from {}: {}", connection_id, e);
                self.reply_error(connection_id, ErrorCode::InvalidMessage, "malformed frame")
                    .await;
                return;
            }
        };
        self.registry.touch(connection_id).await;

        let kind = match frame.kind.parse::<MessageKind>() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::warn!(
                    "Ignoring frame of unknown type '{}' from {}",
                    frame.kind,
                    connection_id
                );
                return;
            }
        };

        if let Err(e) = self
            .handle_client_frame(connection_id, kind, frame.room_id, frame.payload)
            .await
        {
            tracing::debug!("Rejected '{}' from {}: {}", kind, connection_id, e);
            self.reply_error(connection_id, e.code(), e.to_string())
                .await;
        }
    }

    async fn reply_error(
        &self,
        connection_id: &ConnectionId,
        code: ErrorCode,
        message: impl Into<String>,
    ) {
        self.registry
            .send_to_connection(connection_id, Envelope::error(code, message))
            .await;
    }

    async fn handle_client_frame(
        &self,
        connection_id: &ConnectionId,
        kind: MessageKind,
        room_id: Option<String>,
        payload: Value,
    ) -> Result<(), BridgeError> {
        match kind {
            MessageKind::Ping => {
                self.registry
                    .send_to_connection(connection_id, Envelope::pong())
                    .await;
            }
            MessageKind::Pong => {}
            MessageKind::JoinRoom => {
                let room_id = required_room(room_id)?;
                self.join_room(connection_id, &room_id).await?;
            }
            MessageKind::LeaveRoom => {
                let room_id = required_room(room_id)?;
                self.leave_room(connection_id, &room_id).await?;
            }
            MessageKind::RoomMessage => {
                let room_id = required_room(room_id)?;
                let identity = self.check_chat(connection_id, &room_id, true).await?;
                let envelope = Envelope::new(kind, DeliveryScope::Room(room_id.clone()), payload)
                    .with_sender(identity);
                self.publish_to_room(&room_id, envelope, Some(connection_id))
                    .await;
                self.count_message(&room_id).await;
            }
            MessageKind::Message => {
                let room_id = required_room(room_id)?;
                let identity = self.check_chat(connection_id, &room_id, true).await?;
                let wrapped = json!({
                    "user_id": identity.user_id,
                    "display_name": identity.display_name,
                    "content": payload,
                });
                let envelope = Envelope::new(kind, DeliveryScope::Room(room_id.clone()), wrapped)
                    .with_sender(identity);
                self.publish_to_room(&room_id, envelope, None).await;
                self.count_message(&room_id).await;
            }
            MessageKind::Typing => {
                let room_id = required_room(room_id)?;
                let identity = self.check_chat(connection_id, &room_id, false).await?;
                let envelope = Envelope::new(kind, DeliveryScope::Room(room_id.clone()), payload)
                    .with_sender(identity);
                self.publish_to_room(&room_id, envelope, Some(connection_id))
                    .await;
            }
            MessageKind::Connect
            | MessageKind::Disconnect
            | MessageKind::Error
            | MessageKind::RoomUpdate
            | MessageKind::EventUpdate
            | MessageKind::Registration
            | MessageKind::Reminder
            | MessageKind::LiveLocation
            | MessageKind::LiveAttendance
            | MessageKind::LivePoll
            | MessageKind::LiveQna
            | MessageKind::Notification => {
                tracing::warn!(
                    "Ignoring server-only type '{}' sent by {}",
                    kind,
                    connection_id
                );
            }
        }
        Ok(())
    }

    /// ルームへの送信可否を確認し、送信者の Identity を返す
    ///
    /// ルーム設定の読み込みに失敗した場合は設定の確認を省略する。
    async fn check_chat(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        counts_toward_limit: bool,
    ) -> Result<Identity, BridgeError> {
        let identity = self.identity_of(connection_id).await?;
        if !self.registry.is_member(connection_id, room_id).await {
            return Err(RoomError::NotMember(room_id.to_string()).into());
        }

        let room = match self.rooms.get_room(room_id).await {
            Ok(room) => room,
            Err(RoomError::Store(e)) => {
                tracing::warn!("Room settings of '{}' unavailable: {}", room_id, e);
                return Ok(identity);
            }
            Err(e) => return Err(e.into()),
        };
        if !room.settings.chat_allowed {
            return Err(BridgeError::ChatDisabled(room_id.to_string()));
        }
        if counts_toward_limit
            && !self
                .registry
                .consume_rate(connection_id, room_id, room.settings.rate_limit_per_minute)
                .await
        {
            return Err(BridgeError::RateLimited(room_id.to_string()));
        }
        Ok(identity)
    }

    async fn count_message(&self, room_id: &RoomId) {
        if let Err(e) = self.rooms.increment_message_count(room_id).await {
            tracing::warn!("Failed to count message in '{}': {}", room_id, e);
        }
    }
}
