//! UseCase: Connection Registry
//!
//! このインスタンスに接続しているクライアントの唯一の情報源です。
//! ローカルの配送（ユーザー・ルーム・全体）はここで完結し、共有ストアには
//! プレゼンスとメンバーシップの写しを書き込むだけです。
//!
//! ## 配送とバックプレッシャ
//!
//! 各接続は上限付きのメールボックスを持ちます。配送は `try_send` のみで行い、
//! 送信側が待たされることはありません。メールボックスが満杯の接続は
//! 切断扱いとし、ロックを手放したあとで登録解除します。
//!
//! ## ロック
//!
//! 状態は 1 つの Mutex で保護します。配送先の決定はロック内、実際の送信と
//! ストアへの書き込みはロック外で行います。

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use hiroba_shared::time::Clock;
use serde_json::json;
use tokio::{
    sync::{Mutex, Notify, mpsc, watch},
    task::JoinHandle,
};

use crate::domain::{
    ClientMeta, Connection, ConnectionId, DeliveryScope, Envelope, Identity, InstanceStats,
    MessageKind, PresenceRecord, PresenceStore, Room, RoomId, Timestamp, UserId,
};

use super::{error::RoomError, room_directory::RoomDirectory};

const RATE_WINDOW_MILLIS: i64 = 60_000;

/// 配送の結果。配送先がいないことはエラーではない。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Number of local connections the envelope was queued for
    Delivered(usize),
    NotConnected,
    RoomNotFound,
}

impl DeliveryOutcome {
    pub fn delivered(&self) -> usize {
        match self {
            DeliveryOutcome::Delivered(n) => *n,
            DeliveryOutcome::NotConnected | DeliveryOutcome::RoomNotFound => 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub instance_id: String,
    /// Per-connection outbound queue size
    pub mailbox_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            instance_id: "local".to_string(),
            mailbox_capacity: 256,
        }
    }
}

struct ConnectionHandle {
    id: ConnectionId,
    identity: Identity,
    meta: ClientMeta,
    created_at: Timestamp,
    last_heartbeat: AtomicI64,
    mailbox: mpsc::Sender<Arc<Envelope>>,
    closed: Arc<Notify>,
}

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started_at: i64,
    count: u32,
}

struct Slot {
    handle: Arc<ConnectionHandle>,
    rooms: BTreeSet<RoomId>,
    rate: HashMap<RoomId, RateWindow>,
}

impl Slot {
    fn snapshot(&self) -> Connection {
        Connection {
            id: self.handle.id,
            identity: self.handle.identity.clone(),
            meta: self.handle.meta.clone(),
            created_at: self.handle.created_at,
            last_heartbeat: Timestamp::new(self.handle.last_heartbeat.load(Ordering::Relaxed)),
            rooms: self.rooms.clone(),
        }
    }
}

#[derive(Default)]
struct LiveState {
    connections: HashMap<ConnectionId, Slot>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
    rooms: HashMap<RoomId, HashSet<ConnectionId>>,
}

impl LiveState {
    fn handles<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ConnectionId>,
    ) -> Vec<Arc<ConnectionHandle>> {
        ids.into_iter()
            .filter_map(|id| self.connections.get(id))
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// Whether another connection of `user_id` is still in `room_id`.
    fn user_in_room(&self, user_id: &UserId, room_id: &RoomId) -> bool {
        let (Some(conns), Some(members)) = (self.users.get(user_id), self.rooms.get(room_id))
        else {
            return false;
        };
        conns.iter().any(|id| members.contains(id))
    }
}

/// 書き込みタスク側の受信口
pub struct Outbound {
    mailbox: mpsc::Receiver<Arc<Envelope>>,
    closed: Arc<Notify>,
}

impl Outbound {
    /// 次の送信メッセージ。接続が閉じられたら `None`。
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        tokio::select! {
            biased;
            _ = self.closed.notified() => None,
            envelope = self.mailbox.recv() => envelope,
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.mailbox.try_recv().ok()
    }
}

/// `register` の結果
pub struct Registration {
    pub connection_id: ConnectionId,
    pub outbound: Outbound,
}

pub struct ConnectionRegistry {
    state: Mutex<LiveState>,
    rooms: Arc<RoomDirectory>,
    presence: Arc<dyn PresenceStore>,
    clock: Arc<dyn Clock>,
    config: RegistryConfig,
    started_at: Timestamp,
    departures: Mutex<Option<mpsc::UnboundedSender<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new(
        rooms: Arc<RoomDirectory>,
        presence: Arc<dyn PresenceStore>,
        clock: Arc<dyn Clock>,
        config: RegistryConfig,
    ) -> Self {
        let started_at = Timestamp::new(clock.now_millis());
        Self {
            state: Mutex::new(LiveState::default()),
            rooms,
            presence,
            clock,
            config,
            started_at,
            departures: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now_millis())
    }

    /// 登録解除された接続の通知を受け取る
    ///
    /// 受け取り手は 1 つだけで、呼び直すと以前の受信側は通知を受け取らなくなる。
    /// 通知は取りこぼさない。
    pub async fn departures(&self) -> mpsc::UnboundedReceiver<Connection> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.departures.lock().await = Some(tx);
        rx
    }

    /// 接続を登録し、書き込みタスク用の受信口を返す
    ///
    /// 登録直後に `connect` エンベロープ（接続 ID・ユーザー ID・サーバー時刻）が
    /// メールボックスに積まれる。
    pub async fn register(&self, identity: Identity, meta: ClientMeta) -> Registration {
        let id = ConnectionId::generate();
        let now = self.now();
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let closed = Arc::new(Notify::new());
        let handle = Arc::new(ConnectionHandle {
            id,
            identity: identity.clone(),
            meta,
            created_at: now,
            last_heartbeat: AtomicI64::new(now.value()),
            mailbox: tx,
            closed: closed.clone(),
        });

        {
            let mut state = self.state.lock().await;
            state.connections.insert(
                id,
                Slot {
                    handle: handle.clone(),
                    rooms: BTreeSet::new(),
                    rate: HashMap::new(),
                },
            );
            state
                .users
                .entry(identity.user_id.clone())
                .or_default()
                .insert(id);
        }

        let record = PresenceRecord {
            connection_id: id,
            identity: identity.clone(),
            instance_id: self.config.instance_id.clone(),
            connected_at: now,
        };
        if let Err(e) = self.presence.put_presence(&record).await {
            tracing::warn!("Failed to write presence of {}: {}", id, e);
        }

        let connected = Envelope::new(
            MessageKind::Connect,
            DeliveryScope::Local,
            json!({
                "connection_id": id,
                "user_id": identity.user_id,
                "display_name": identity.display_name,
                "server_time": now.value(),
            }),
        );
        // 空のメールボックスなので必ず積める
        let _ = handle.mailbox.try_send(Arc::new(connected));

        tracing::info!(
            "Connection {} registered for user '{}'",
            id,
            identity.user_id
        );

        Registration {
            connection_id: id,
            outbound: Outbound {
                mailbox: rx,
                closed,
            },
        }
    }

    /// 接続の登録を解除する。2 回目以降の呼び出しは何もしない。
    ///
    /// 参加していた全ルームから退出させ、プレゼンスを削除したうえで
    /// 解除された接続のスナップショットを返す。
    pub async fn unregister(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let (slot, released_rooms) = {
            let mut state = self.state.lock().await;
            let slot = state.connections.remove(connection_id)?;
            let user_id = &slot.handle.identity.user_id;

            if let Some(conns) = state.users.get_mut(user_id) {
                conns.remove(connection_id);
                if conns.is_empty() {
                    state.users.remove(user_id);
                }
            }
            for room_id in &slot.rooms {
                if let Some(members) = state.rooms.get_mut(room_id) {
                    members.remove(connection_id);
                    if members.is_empty() {
                        state.rooms.remove(room_id);
                    }
                }
            }
            let released: Vec<RoomId> = slot
                .rooms
                .iter()
                .filter(|room_id| !state.user_in_room(user_id, room_id))
                .cloned()
                .collect();
            (slot, released)
        };

        slot.handle.closed.notify_one();
        let snapshot = slot.snapshot();
        drop(slot);

        for room_id in &snapshot.rooms {
            if let Err(e) = self.rooms.leave(room_id, connection_id).await {
                tracing::warn!(
                    "Failed to remove {} from room '{}': {}",
                    connection_id,
                    room_id,
                    e
                );
            }
        }
        let user_id = &snapshot.identity.user_id;
        for room_id in &released_rooms {
            if let Err(e) = self.presence.remove_user_room(user_id, room_id).await {
                tracing::warn!("Failed to release room '{}' of '{}': {}", room_id, user_id, e);
            }
        }
        if let Err(e) = self.presence.remove_presence(connection_id, user_id).await {
            tracing::warn!("Failed to remove presence of {}: {}", connection_id, e);
        }

        tracing::info!(
            "Connection {} unregistered (user '{}', {} room(s))",
            connection_id,
            user_id,
            snapshot.rooms.len()
        );

        let listener = self.departures.lock().await.clone();
        if let Some(tx) = listener {
            if tx.send(snapshot.clone()).is_err() {
                tracing::debug!("Departure listener is gone");
            }
        }
        Some(snapshot)
    }

    /// キューに積み、満杯・切断済みの接続 ID を返す
    fn deliver(
        &self,
        targets: &[Arc<ConnectionHandle>],
        envelope: Arc<Envelope>,
    ) -> (usize, Vec<ConnectionId>) {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for handle in targets {
            match handle.mailbox.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        "Mailbox of {} is full, disconnecting slow consumer",
                        handle.id
                    );
                    handle.closed.notify_one();
                    dead.push(handle.id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(handle.id),
            }
        }
        (delivered, dead)
    }

    async fn reap(&self, dead: Vec<ConnectionId>) {
        for id in dead {
            self.unregister(&id).await;
        }
    }

    async fn deliver_and_reap(
        &self,
        targets: Vec<Arc<ConnectionHandle>>,
        envelope: Envelope,
    ) -> usize {
        let (delivered, dead) = self.deliver(&targets, Arc::new(envelope));
        self.reap(dead).await;
        delivered
    }

    /// ユーザーのローカル接続すべてに配送
    pub async fn send_to_user(&self, user_id: &UserId, envelope: Envelope) -> DeliveryOutcome {
        let targets = {
            let state = self.state.lock().await;
            match state.users.get(user_id) {
                Some(conns) => state.handles(conns),
                None => Vec::new(),
            }
        };
        if targets.is_empty() {
            tracing::debug!("User '{}' has no local connection", user_id);
            return DeliveryOutcome::NotConnected;
        }
        DeliveryOutcome::Delivered(self.deliver_and_reap(targets, envelope).await)
    }

    /// 単一の接続に配送
    pub async fn send_to_connection(
        &self,
        connection_id: &ConnectionId,
        envelope: Envelope,
    ) -> DeliveryOutcome {
        let targets = {
            let state = self.state.lock().await;
            state.handles([connection_id])
        };
        if targets.is_empty() {
            return DeliveryOutcome::NotConnected;
        }
        DeliveryOutcome::Delivered(self.deliver_and_reap(targets, envelope).await)
    }

    /// ルームのローカルメンバーに配送（`exclude` の接続は除く）
    pub async fn broadcast_to_room(
        &self,
        room_id: &RoomId,
        envelope: Envelope,
        exclude: Option<&ConnectionId>,
    ) -> DeliveryOutcome {
        let targets = {
            let state = self.state.lock().await;
            let Some(members) = state.rooms.get(room_id) else {
                tracing::debug!("Room '{}' has no local member", room_id);
                return DeliveryOutcome::RoomNotFound;
            };
            state.handles(members.iter().filter(|id| Some(*id) != exclude))
        };
        DeliveryOutcome::Delivered(self.deliver_and_reap(targets, envelope).await)
    }

    /// 全ローカル接続に配送
    ///
    /// 配送先はロック内でスナップショットを取り、送信はロック外で行う。
    pub async fn broadcast_global(&self, envelope: Envelope) -> DeliveryOutcome {
        let targets = {
            let state = self.state.lock().await;
            state.handles(state.connections.keys())
        };
        DeliveryOutcome::Delivered(self.deliver_and_reap(targets, envelope).await)
    }

    /// 接続をルームに参加させる
    ///
    /// 参加可否は Room Directory が判定する。判定中に接続が切れていた場合は
    /// ストア上のメンバーシップを取り消す。
    pub async fn join_room(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Result<Room, RoomError> {
        let user_id = {
            let state = self.state.lock().await;
            let slot = state
                .connections
                .get(connection_id)
                .ok_or_else(|| RoomError::ConnectionNotFound(connection_id.to_string()))?;
            slot.handle.identity.user_id.clone()
        };

        let room = self.rooms.join(room_id, connection_id).await?;

        let still_connected = {
            let mut state = self.state.lock().await;
            match state.connections.get_mut(connection_id) {
                Some(slot) => {
                    slot.rooms.insert(room_id.clone());
                    state
                        .rooms
                        .entry(room_id.clone())
                        .or_default()
                        .insert(*connection_id);
                    true
                }
                None => false,
            }
        };
        if !still_connected {
            if let Err(e) = self.rooms.leave(room_id, connection_id).await {
                tracing::warn!("Failed to roll back membership in '{}': {}", room_id, e);
            }
            return Err(RoomError::ConnectionNotFound(connection_id.to_string()));
        }

        if let Err(e) = self.presence.add_user_room(&user_id, room_id).await {
            tracing::warn!("Failed to record room '{}' of '{}': {}", room_id, user_id, e);
        }

        tracing::info!("Connection {} joined room '{}'", connection_id, room_id);
        Ok(room)
    }

    /// 接続をルームから外し、残りのメンバー数を返す
    pub async fn leave_room(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
    ) -> Result<usize, RoomError> {
        let (user_id, user_still_in_room, local_remaining) = {
            let mut state = self.state.lock().await;
            let slot = state
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| RoomError::ConnectionNotFound(connection_id.to_string()))?;
            if !slot.rooms.remove(room_id) {
                return Err(RoomError::NotMember(room_id.to_string()));
            }
            slot.rate.remove(room_id);
            let user_id = slot.handle.identity.user_id.clone();

            let mut local_remaining = 0;
            if let Some(members) = state.rooms.get_mut(room_id) {
                members.remove(connection_id);
                local_remaining = members.len();
                if members.is_empty() {
                    state.rooms.remove(room_id);
                }
            }
            let still = state.user_in_room(&user_id, room_id);
            (user_id, still, local_remaining)
        };

        let remaining = match self.rooms.leave(room_id, connection_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                tracing::warn!(
                    "Failed to remove {} from room '{}': {}",
                    connection_id,
                    room_id,
                    e
                );
                local_remaining
            }
        };
        if !user_still_in_room {
            if let Err(e) = self.presence.remove_user_room(&user_id, room_id).await {
                tracing::warn!("Failed to release room '{}' of '{}': {}", room_id, user_id, e);
            }
        }

        tracing::info!("Connection {} left room '{}'", connection_id, room_id);
        Ok(remaining)
    }

    pub async fn is_member(&self, connection_id: &ConnectionId, room_id: &RoomId) -> bool {
        let state = self.state.lock().await;
        state
            .rooms
            .get(room_id)
            .is_some_and(|members| members.contains(connection_id))
    }

    pub async fn connection(&self, connection_id: &ConnectionId) -> Option<Connection> {
        let state = self.state.lock().await;
        state.connections.get(connection_id).map(Slot::snapshot)
    }

    /// ルームのローカルメンバー
    pub async fn local_room_members(&self, room_id: &RoomId) -> Vec<Connection> {
        let state = self.state.lock().await;
        let mut members: Vec<Connection> = state
            .rooms
            .get(room_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.connections.get(id))
            .map(Slot::snapshot)
            .collect();
        members.sort_by_key(|c| c.id);
        members
    }

    /// ハートビートを更新
    pub async fn touch(&self, connection_id: &ConnectionId) {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        if let Some(slot) = state.connections.get(connection_id) {
            slot.handle.last_heartbeat.store(now, Ordering::Relaxed);
        }
    }

    /// ルームごとの送信レート（1 分間の固定ウィンドウ）を消費する
    ///
    /// `limit_per_minute` が 0 の場合は無制限。上限を超えていれば `false`。
    pub async fn consume_rate(
        &self,
        connection_id: &ConnectionId,
        room_id: &RoomId,
        limit_per_minute: u32,
    ) -> bool {
        if limit_per_minute == 0 {
            return true;
        }
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let Some(slot) = state.connections.get_mut(connection_id) else {
            return false;
        };
        let window = slot.rate.entry(room_id.clone()).or_insert(RateWindow {
            started_at: now,
            count: 0,
        });
        if now - window.started_at >= RATE_WINDOW_MILLIS {
            *window = RateWindow {
                started_at: now,
                count: 0,
            };
        }
        if window.count >= limit_per_minute {
            return false;
        }
        window.count += 1;
        true
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    pub async fn stats(&self) -> InstanceStats {
        let state = self.state.lock().await;
        InstanceStats {
            instance_id: self.config.instance_id.clone(),
            connections: state.connections.len(),
            users: state.users.len(),
            rooms: state.rooms.len(),
            started_at: self.started_at,
            updated_at: self.now(),
        }
    }

    /// 集計値を定期的に共有ストアへ書き込む
    pub fn spawn_stats_publisher(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = self.stats().await;
                        if let Err(e) = self.presence.put_instance_stats(&stats).await {
                            tracing::warn!("Failed to publish instance stats: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Stats publisher stopped");
                        break;
                    }
                }
            }
        })
    }
}
