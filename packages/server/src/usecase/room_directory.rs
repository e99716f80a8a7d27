//! UseCase: Room Directory
//!
//! ルームのメタデータ・メンバーシップ・統計を共有ストア上で管理します。
//! ローカルの配送判断はこのモジュールでは行わず（Connection Registry の責務）、
//! インスタンス間で共有すべき情報だけを扱います。
//!
//! ## アイドルルームの回収
//!
//! 定期スイープで以下をすべて満たすルームを削除します：
//! - 種別が回収対象（`general` 以外）
//! - 紐づくイベントが有効でない
//! - 最終アクティビティが閾値より古い
//! - メンバーがいない（削除自体もストア上で空であることを再確認する）

use std::{sync::Arc, time::Duration};

use hiroba_shared::time::Clock;
use tokio::{sync::watch, task::JoinHandle};
use uuid::Uuid;

use crate::domain::{
    ConnectionId, GuardedDelete, MemberAdd, NewRoom, Room, RoomId, RoomKind, RoomSettings,
    RoomStats, RoomStore, RoomUpdate, Timestamp, UserId,
};

use super::error::RoomError;

/// Room Directory の設定値
#[derive(Debug, Clone)]
pub struct RoomDirectoryConfig {
    /// max_size 未指定時の上限
    pub default_max_size: usize,
    /// これより長く活動のないルームは回収対象
    pub idle_threshold: Duration,
    /// イベントを「有効」とみなす期間
    pub entity_active_ttl: Duration,
}

impl Default for RoomDirectoryConfig {
    fn default() -> Self {
        Self {
            default_max_size: 1000,
            idle_threshold: Duration::from_secs(24 * 60 * 60),
            entity_active_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

/// Why a room survived an idle sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepReason {
    Permanent,
    EventActive,
    RecentlyActive,
    Occupied(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimDecision {
    Keep(KeepReason),
    Reclaim,
}

/// Result of one idle sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    pub examined: usize,
    pub reclaimed: Vec<RoomId>,
    /// Rooms that gained a member between the check and the guarded delete
    pub rescued: usize,
}

pub struct RoomDirectory {
    store: Arc<dyn RoomStore>,
    clock: Arc<dyn Clock>,
    config: RoomDirectoryConfig,
}

impl RoomDirectory {
    pub fn new(
        store: Arc<dyn RoomStore>,
        clock: Arc<dyn Clock>,
        config: RoomDirectoryConfig,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    fn now(&self) -> Timestamp {
        Timestamp::new(self.clock.now_millis())
    }

    /// ルームを作成する。同じ ID のルームが既にあればメタデータを上書きする。
    pub async fn create_room(&self, new_room: NewRoom) -> Result<Room, RoomError> {
        let id = match new_room.id {
            Some(id) => id,
            None => RoomId::new(format!("room_{}", Uuid::new_v4().simple()))?,
        };
        let max_size = match new_room.max_size {
            Some(0) => return Err(RoomError::Invalid("max_size must be positive".to_string())),
            Some(size) => size,
            None => self.config.default_max_size,
        };
        let name = if new_room.name.trim().is_empty() {
            id.as_str().to_string()
        } else {
            new_room.name
        };
        let now = self.now();
        let room = Room {
            id,
            kind: new_room.kind.unwrap_or(RoomKind::General),
            name,
            description: new_room.description,
            created_by: new_room.created_by,
            created_at: now,
            updated_at: now,
            max_size,
            is_private: new_room.is_private,
            settings: new_room.settings.unwrap_or_default(),
            member_count: 0,
            last_activity: None,
        };

        self.store.save_room(&room).await?;
        // 作成直後のルームが次のスイープで回収されないよう、作成時刻を最終アクティビティとして記録
        let stats = self.store.record_activity(&room.id, 0, now).await?;

        tracing::info!("Room '{}' ({}) created", room.id, room.kind.as_str());

        let member_count = self.store.member_count(&room.id).await?;
        Ok(Room {
            member_count,
            last_activity: Some(stats.last_activity),
            ..room
        })
    }

    /// メタデータに現在のメンバー数と最終アクティビティを重ねて返す
    pub async fn get_room(&self, room_id: &RoomId) -> Result<Room, RoomError> {
        let room = self
            .store
            .load_room(room_id)
            .await?
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
        self.with_live_counters(room).await
    }

    async fn with_live_counters(&self, mut room: Room) -> Result<Room, RoomError> {
        room.member_count = self.store.member_count(&room.id).await?;
        room.last_activity = self
            .store
            .load_stats(&room.id)
            .await?
            .map(|stats| stats.last_activity);
        Ok(room)
    }

    pub async fn update_room(
        &self,
        room_id: &RoomId,
        update: RoomUpdate,
    ) -> Result<Room, RoomError> {
        let mut room = self
            .store
            .load_room(room_id)
            .await?
            .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;

        if let Some(name) = update.name {
            room.name = name;
        }
        if let Some(description) = update.description {
            room.description = description;
        }
        if let Some(max_size) = update.max_size {
            if max_size == 0 {
                return Err(RoomError::Invalid("max_size must be positive".to_string()));
            }
            room.max_size = max_size;
        }
        if let Some(is_private) = update.is_private {
            room.is_private = is_private;
        }
        if let Some(settings) = update.settings {
            room.settings = settings;
        }
        room.updated_at = self.now();

        self.store.save_room(&room).await?;
        tracing::debug!("Room '{}' updated", room.id);
        self.with_live_counters(room).await
    }

    /// メタデータ・メンバーシップ・統計を削除する
    pub async fn delete_room(&self, room_id: &RoomId) -> Result<(), RoomError> {
        if self.store.load_room(room_id).await?.is_none() {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        self.store.delete_room(room_id).await?;
        tracing::info!("Room '{}' deleted", room_id);
        Ok(())
    }

    /// 公開ルームの一覧（private は含めない）
    pub async fn list_rooms(
        &self,
        kind: Option<RoomKind>,
        limit: usize,
    ) -> Result<Vec<Room>, RoomError> {
        let mut rooms = Vec::new();
        for room_id in self.store.list_room_ids().await? {
            if rooms.len() >= limit {
                break;
            }
            let Some(room) = self.store.load_room(&room_id).await? else {
                // listed but deleted in the meantime
                continue;
            };
            if room.is_private || kind.is_some_and(|k| k != room.kind) {
                continue;
            }
            rooms.push(self.with_live_counters(room).await?);
        }
        Ok(rooms)
    }

    /// 既存のルームを返し、なければ作成する
    async fn ensure_room(&self, new_room: NewRoom) -> Result<Room, RoomError> {
        if let Some(room_id) = &new_room.id {
            if let Some(existing) = self.store.load_room(room_id).await? {
                return self.with_live_counters(existing).await;
            }
        }
        self.create_room(new_room).await
    }

    pub async fn create_event_discussion_room(
        &self,
        event_id: &str,
        created_by: Option<UserId>,
    ) -> Result<Room, RoomError> {
        self.ensure_room(NewRoom {
            id: Some(RoomId::event_discussion(event_id)?),
            kind: Some(RoomKind::EventDiscussion),
            name: format!("Event {event_id} discussion"),
            created_by,
            ..Default::default()
        })
        .await
    }

    pub async fn create_event_live_room(
        &self,
        event_id: &str,
        created_by: Option<UserId>,
    ) -> Result<Room, RoomError> {
        self.ensure_room(NewRoom {
            id: Some(RoomId::event_live(event_id)?),
            kind: Some(RoomKind::EventLive),
            name: format!("Event {event_id} live"),
            created_by,
            settings: Some(RoomSettings {
                moderation_enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
    }

    /// 2 ユーザー間のプライベートルーム。ID は順序に依存しない。
    pub async fn create_private_chat_room(
        &self,
        user_a: &UserId,
        user_b: &UserId,
    ) -> Result<Room, RoomError> {
        self.ensure_room(NewRoom {
            id: Some(RoomId::private_chat(user_a, user_b)?),
            kind: Some(RoomKind::PrivateChat),
            name: format!("{user_a} & {user_b}"),
            created_by: Some(user_a.clone()),
            max_size: Some(2),
            is_private: true,
            ..Default::default()
        })
        .await
    }

    /// イベント系のルーム ID であれば、該当ルームを自動作成する
    async fn provision(&self, room_id: &RoomId) -> Result<Option<Room>, RoomError> {
        let Some(event_id) = room_id.linked_event() else {
            return Ok(None);
        };
        let room = if room_id.as_str().starts_with("event_live:") {
            self.create_event_live_room(event_id, None).await?
        } else {
            self.create_event_discussion_room(event_id, None).await?
        };
        Ok(Some(room))
    }

    /// 接続をルームに参加させる
    ///
    /// 上限チェック・ルームの存在確認・追加はストア上でアトミックに行う。
    /// 読み込みと追加の間にルームが回収された場合、イベント系のルームは作り直し、
    /// それ以外は NotFound とする。
    /// メンバーシップの書き込みに失敗した場合はローカルの参加を優先し、警告だけを残す。
    pub async fn join(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<Room, RoomError> {
        let mut room = self.load_or_provision(room_id).await?;

        let mut added = self
            .store
            .add_member(room_id, connection_id, room.max_size)
            .await;
        if matches!(added, Ok(MemberAdd::RoomMissing)) {
            tracing::info!("Room '{}' was reclaimed while joining", room_id);
            room = self
                .provision(room_id)
                .await?
                .ok_or_else(|| RoomError::NotFound(room_id.to_string()))?;
            added = self
                .store
                .add_member(room_id, connection_id, room.max_size)
                .await;
        }

        match added {
            Ok(MemberAdd::Added(count)) | Ok(MemberAdd::AlreadyMember(count)) => {
                room.member_count = count;
            }
            Ok(MemberAdd::Full) => return Err(RoomError::Full(room_id.to_string())),
            Ok(MemberAdd::RoomMissing) => return Err(RoomError::NotFound(room_id.to_string())),
            Err(e) => {
                tracing::warn!(
                    "Failed to record membership of {} in '{}': {}",
                    connection_id,
                    room_id,
                    e
                );
                // 書き込めなかった本人の分を足す
                room.member_count = match self.store.member_count(room_id).await {
                    Ok(count) => count + 1,
                    Err(_) => 1,
                };
            }
        }

        match self.store.record_activity(room_id, 0, self.now()).await {
            Ok(stats) => room.last_activity = Some(stats.last_activity),
            Err(e) => tracing::warn!("Failed to record activity of '{}': {}", room_id, e),
        }

        Ok(room)
    }

    async fn load_or_provision(&self, room_id: &RoomId) -> Result<Room, RoomError> {
        match self.store.load_room(room_id).await? {
            Some(room) => Ok(room),
            None => self
                .provision(room_id)
                .await?
                .ok_or_else(|| RoomError::NotFound(room_id.to_string())),
        }
    }

    /// 接続をルームから外し、残りのメンバー数を返す
    pub async fn leave(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<usize, RoomError> {
        let remaining = self.store.remove_member(room_id, connection_id).await?;
        if let Err(e) = self.store.record_activity(room_id, 0, self.now()).await {
            tracing::warn!("Failed to record activity of '{}': {}", room_id, e);
        }
        Ok(remaining)
    }

    pub async fn members(&self, room_id: &RoomId) -> Result<Vec<ConnectionId>, RoomError> {
        Ok(self.store.members(room_id).await?)
    }

    pub async fn increment_message_count(&self, room_id: &RoomId) -> Result<RoomStats, RoomError> {
        Ok(self.store.record_activity(room_id, 1, self.now()).await?)
    }

    /// 統計とメンバー数（ルームが存在しない場合は NotFound）
    pub async fn room_stats(&self, room_id: &RoomId) -> Result<(RoomStats, usize), RoomError> {
        if self.store.load_room(room_id).await?.is_none() {
            return Err(RoomError::NotFound(room_id.to_string()));
        }
        let stats = self.store.load_stats(room_id).await?.unwrap_or_default();
        let member_count = self.store.member_count(room_id).await?;
        Ok((stats, member_count))
    }

    /// イベントを有効として記録（TTL 付き）
    pub async fn mark_event_active(&self, event_id: &str) -> Result<(), RoomError> {
        self.store
            .mark_entity_active(event_id, self.config.entity_active_ttl)
            .await?;
        Ok(())
    }

    /// 1 ルームについて回収の可否を判定する
    pub async fn evaluate(&self, room: &Room, now: Timestamp) -> Result<ReclaimDecision, RoomError> {
        if !room.kind.is_reclaimable() {
            return Ok(ReclaimDecision::Keep(KeepReason::Permanent));
        }
        if let Some(event_id) = room.id.linked_event() {
            if self.store.is_entity_active(event_id).await? {
                return Ok(ReclaimDecision::Keep(KeepReason::EventActive));
            }
        }

        let last_activity = self
            .store
            .load_stats(&room.id)
            .await?
            .map(|stats| stats.last_activity)
            .unwrap_or(room.updated_at)
            .max(room.updated_at);
        let threshold = i64::try_from(self.config.idle_threshold.as_millis()).unwrap_or(i64::MAX);
        if last_activity.elapsed_until(now) < threshold {
            return Ok(ReclaimDecision::Keep(KeepReason::RecentlyActive));
        }

        let members = self.store.member_count(&room.id).await?;
        if members > 0 {
            return Ok(ReclaimDecision::Keep(KeepReason::Occupied(members)));
        }
        Ok(ReclaimDecision::Reclaim)
    }

    /// アイドルルームを 1 回スイープする
    ///
    /// 個別のルームで失敗してもスイープ全体は継続する。
    pub async fn reclaim_idle_rooms(&self) -> Result<ReclaimReport, RoomError> {
        let now = self.now();
        let mut report = ReclaimReport::default();

        for room_id in self.store.list_room_ids().await? {
            let room = match self.store.load_room(&room_id).await {
                Ok(Some(room)) => room,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!("Skipping room '{}' during idle sweep: {}", room_id, e);
                    continue;
                }
            };
            report.examined += 1;

            match self.evaluate(&room, now).await {
                Ok(ReclaimDecision::Reclaim) => {}
                Ok(ReclaimDecision::Keep(reason)) => {
                    tracing::trace!("Keeping room '{}': {:?}", room_id, reason);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Skipping room '{}' during idle sweep: {}", room_id, e);
                    continue;
                }
            }

            match self.store.delete_room_if_empty(&room_id).await {
                Ok(GuardedDelete::Deleted) => {
                    tracing::info!("Reclaimed idle room '{}'", room_id);
                    report.reclaimed.push(room_id);
                }
                Ok(GuardedDelete::HasMembers(count)) => {
                    tracing::info!(
                        "Room '{}' gained {} member(s) during idle sweep, keeping it",
                        room_id,
                        count
                    );
                    report.rescued += 1;
                }
                Ok(GuardedDelete::Missing) => {}
                Err(e) => tracing::warn!("Failed to reclaim room '{}': {}", room_id, e),
            }
        }

        Ok(report)
    }

    /// アイドルルーム回収をバックグラウンドで定期実行する
    pub fn spawn_reclaimer(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // 起動直後の即時スイープはしない
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.reclaim_idle_rooms().await {
                            Ok(report) => tracing::debug!(
                                "Idle sweep examined {} room(s), reclaimed {}",
                                report.examined,
                                report.reclaimed.len()
                            ),
                            Err(e) => tracing::warn!("Idle sweep failed: {}", e),
                        }
                    }
                    _ = shutdown.changed() => {
                        tracing::debug!("Idle room reclaimer stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{StoreError, repository::MockRoomStore},
        infrastructure::store::InMemoryStore,
    };
    use async_trait::async_trait;
    use hiroba_shared::time::ManualClock;
    use std::sync::atomic::{AtomicBool, Ordering};

    const HOUR: i64 = 60 * 60 * 1000;

    fn setup() -> (Arc<InMemoryStore>, Arc<ManualClock>, RoomDirectory) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let directory = RoomDirectory::new(
            store.clone(),
            clock.clone(),
            RoomDirectoryConfig::default(),
        );
        (store, clock, directory)
    }

    fn room_id(s: &str) -> RoomId {
        RoomId::new(s.to_string()).unwrap()
    }

    fn new_room(id: &str, kind: RoomKind) -> NewRoom {
        NewRoom {
            id: Some(room_id(id)),
            kind: Some(kind),
            name: id.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_room_applies_defaults() {
        // テスト項目: 未指定の項目にデフォルト値が適用される
        // given (前提条件):
        let (_store, _clock, directory) = setup();

        // when (操作):
        let room = directory.create_room(NewRoom::default()).await.unwrap();

        // then (期待する結果):
        assert!(room.id.as_str().starts_with("room_"));
        assert_eq!(room.kind, RoomKind::General);
        assert_eq!(room.name, room.id.as_str());
        assert_eq!(room.max_size, 1000);
        assert!(room.settings.chat_allowed);
        assert_eq!(room.member_count, 0);
        assert_eq!(room.last_activity, Some(room.created_at));
    }

    #[tokio::test]
    async fn test_create_room_rejects_zero_max_size() {
        // テスト項目: max_size = 0 は拒否される
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        let request = NewRoom {
            max_size: Some(0),
            ..Default::default()
        };

        // when (操作):
        let result = directory.create_room(request).await;

        // then (期待する結果):
        assert!(matches!(result, Err(RoomError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_update_room_overwrites_given_fields_only() {
        // テスト項目: 更新は指定したフィールドのみを書き換える
        // given (前提条件):
        let (_store, clock, directory) = setup();
        let created = directory
            .create_room(new_room("lobby", RoomKind::General))
            .await
            .unwrap();
        clock.advance(1_000);

        // when (操作):
        let updated = directory
            .update_room(
                &created.id,
                RoomUpdate {
                    description: Some("welcome".to_string()),
                    max_size: Some(10),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(updated.name, "lobby");
        assert_eq!(updated.description, "welcome");
        assert_eq!(updated.max_size, 10);
        assert_eq!(updated.created_at, created.created_at);
        assert!(updated.updated_at > created.updated_at);
    }

    #[tokio::test]
    async fn test_get_and_delete_missing_room_is_not_found() {
        // テスト項目: 存在しないルームの取得・削除は NotFound
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        let missing = room_id("missing");

        // when (操作):
        let get = directory.get_room(&missing).await;
        let delete = directory.delete_room(&missing).await;

        // then (期待する結果):
        assert_eq!(get.unwrap_err(), RoomError::NotFound("missing".to_string()));
        assert_eq!(delete.unwrap_err(), RoomError::NotFound("missing".to_string()));
    }

    #[tokio::test]
    async fn test_list_rooms_skips_private_and_filters_kind() {
        // テスト項目: 一覧は private を除外し、種別で絞り込める
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        directory
            .create_room(new_room("a", RoomKind::General))
            .await
            .unwrap();
        directory
            .create_room(new_room("b", RoomKind::Support))
            .await
            .unwrap();
        let alice = UserId::new("alice".to_string()).unwrap();
        let bob = UserId::new("bob".to_string()).unwrap();
        directory
            .create_private_chat_room(&alice, &bob)
            .await
            .unwrap();

        // when (操作):
        let all = directory.list_rooms(None, 100).await.unwrap();
        let support = directory
            .list_rooms(Some(RoomKind::Support), 100)
            .await
            .unwrap();
        let limited = directory.list_rooms(None, 1).await.unwrap();

        // then (期待する結果):
        let ids: Vec<&str> = all.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(support.len(), 1);
        assert_eq!(support[0].id.as_str(), "b");
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_private_chat_room_is_order_independent_and_idempotent() {
        // テスト項目: プライベートルームはユーザーの順序に依存せず、再作成しても同じルーム
        // given (前提条件):
        let (_store, clock, directory) = setup();
        let alice = UserId::new("alice".to_string()).unwrap();
        let bob = UserId::new("bob".to_string()).unwrap();

        // when (操作):
        let first = directory
            .create_private_chat_room(&alice, &bob)
            .await
            .unwrap();
        clock.advance(5_000);
        let second = directory
            .create_private_chat_room(&bob, &alice)
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.max_size, 2);
        assert!(second.is_private);
    }

    #[tokio::test]
    async fn test_join_auto_provisions_event_rooms() {
        // テスト項目: イベント系ルームへの参加でルームが自動作成される
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        let conn = ConnectionId::generate();

        // when (操作):
        let discussion = directory.join(&room_id("event:42"), &conn).await.unwrap();
        let live = directory
            .join(&room_id("event_live:42"), &conn)
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(discussion.kind, RoomKind::EventDiscussion);
        assert_eq!(discussion.member_count, 1);
        assert_eq!(live.kind, RoomKind::EventLive);
        assert!(live.settings.moderation_enabled);
    }

    #[tokio::test]
    async fn test_join_unknown_room_is_not_found() {
        // テスト項目: イベント系以外の未知のルームには参加できない
        // given (前提条件):
        let (store, _clock, directory) = setup();
        let conn = ConnectionId::generate();

        // when (操作):
        let result = directory.join(&room_id("nowhere"), &conn).await;

        // then (期待する結果):
        assert!(matches!(result, Err(RoomError::NotFound(_))));
        assert!(store.load_room(&room_id("nowhere")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_join_rejects_when_full() {
        // テスト項目: 上限に達したルームへの参加は Full
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        let mut request = new_room("tiny", RoomKind::GroupChat);
        request.max_size = Some(1);
        let room = directory.create_room(request).await.unwrap();
        directory
            .join(&room.id, &ConnectionId::generate())
            .await
            .unwrap();

        // when (操作):
        let result = directory.join(&room.id, &ConnectionId::generate()).await;

        // then (期待する結果):
        assert_eq!(result.unwrap_err(), RoomError::Full("tiny".to_string()));
    }

    #[tokio::test]
    async fn test_join_proceeds_when_membership_write_fails() {
        // テスト項目: メンバーシップの書き込みに失敗しても参加は成功する
        // given (前提条件):
        let room = Room {
            id: room_id("lobby"),
            kind: RoomKind::General,
            name: "lobby".to_string(),
            description: String::new(),
            created_by: None,
            created_at: Timestamp::new(0),
            updated_at: Timestamp::new(0),
            max_size: 10,
            is_private: false,
            settings: RoomSettings::default(),
            member_count: 0,
            last_activity: None,
        };
        let mut store = MockRoomStore::new();
        let loaded = room.clone();
        store
            .expect_load_room()
            .returning(move |_| Ok(Some(loaded.clone())));
        store
            .expect_add_member()
            .returning(|_, _, _| Err(StoreError::Connection("down".to_string())));
        store
            .expect_member_count()
            .returning(|_| Err(StoreError::Connection("down".to_string())));
        store
            .expect_record_activity()
            .returning(|_, _, _| Err(StoreError::Connection("down".to_string())));
        let directory = RoomDirectory::new(
            Arc::new(store),
            Arc::new(ManualClock::new(0)),
            RoomDirectoryConfig::default(),
        );

        // when (操作):
        let result = directory.join(&room.id, &ConnectionId::generate()).await;

        // then (期待する結果):
        let joined = result.unwrap();
        assert_eq!(joined.id, room.id);
        assert_eq!(joined.member_count, 1);
    }

    #[tokio::test]
    async fn test_join_counts_existing_members_when_membership_write_fails() {
        // テスト項目: 書き込みに失敗しても、読み出せた人数に本人を加えた値が返る
        // given (前提条件):
        let mut store = MockRoomStore::new();
        store.expect_load_room().returning(|id| {
            Ok(Some(Room {
                id: id.clone(),
                kind: RoomKind::GroupChat,
                name: id.to_string(),
                description: String::new(),
                created_by: None,
                created_at: Timestamp::new(0),
                updated_at: Timestamp::new(0),
                max_size: 10,
                is_private: false,
                settings: RoomSettings::default(),
                member_count: 0,
                last_activity: None,
            }))
        });
        store
            .expect_add_member()
            .returning(|_, _, _| Err(StoreError::Connection("timeout".to_string())));
        store.expect_member_count().returning(|_| Ok(2));
        store
            .expect_record_activity()
            .returning(|_, _, _| Err(StoreError::Connection("timeout".to_string())));
        let directory = RoomDirectory::new(
            Arc::new(store),
            Arc::new(ManualClock::new(0)),
            RoomDirectoryConfig::default(),
        );

        // when (操作):
        let joined = directory
            .join(&room_id("team"), &ConnectionId::generate())
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(joined.member_count, 3);
    }

    /// 最初の `add_member` の直前に、スイープによるガード付き削除を割り込ませるストア
    struct SweepingStore {
        inner: Arc<InMemoryStore>,
        swept: AtomicBool,
    }

    impl SweepingStore {
        fn new(inner: Arc<InMemoryStore>) -> Self {
            Self {
                inner,
                swept: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RoomStore for SweepingStore {
        async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
            self.inner.save_room(room).await
        }

        async fn load_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
            self.inner.load_room(room_id).await
        }

        async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
            self.inner.delete_room(room_id).await
        }

        async fn delete_room_if_empty(
            &self,
            room_id: &RoomId,
        ) -> Result<GuardedDelete, StoreError> {
            self.inner.delete_room_if_empty(room_id).await
        }

        async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
            self.inner.list_room_ids().await
        }

        async fn add_member(
            &self,
            room_id: &RoomId,
            connection_id: &ConnectionId,
            max_size: usize,
        ) -> Result<MemberAdd, StoreError> {
            if !self.swept.swap(true, Ordering::SeqCst) {
                let deleted = self.inner.delete_room_if_empty(room_id).await?;
                assert_eq!(deleted, GuardedDelete::Deleted);
            }
            self.inner.add_member(room_id, connection_id, max_size).await
        }

        async fn remove_member(
            &self,
            room_id: &RoomId,
            connection_id: &ConnectionId,
        ) -> Result<usize, StoreError> {
            self.inner.remove_member(room_id, connection_id).await
        }

        async fn members(&self, room_id: &RoomId) -> Result<Vec<ConnectionId>, StoreError> {
            self.inner.members(room_id).await
        }

        async fn member_count(&self, room_id: &RoomId) -> Result<usize, StoreError> {
            self.inner.member_count(room_id).await
        }

        async fn record_activity(
            &self,
            room_id: &RoomId,
            messages: u64,
            at: Timestamp,
        ) -> Result<RoomStats, StoreError> {
            self.inner.record_activity(room_id, messages, at).await
        }

        async fn load_stats(&self, room_id: &RoomId) -> Result<Option<RoomStats>, StoreError> {
            self.inner.load_stats(room_id).await
        }

        async fn mark_entity_active(
            &self,
            entity_id: &str,
            ttl: Duration,
        ) -> Result<(), StoreError> {
            self.inner.mark_entity_active(entity_id, ttl).await
        }

        async fn is_entity_active(&self, entity_id: &str) -> Result<bool, StoreError> {
            self.inner.is_entity_active(entity_id).await
        }
    }

    fn sweeping_setup() -> (Arc<InMemoryStore>, RoomDirectory) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let inner = Arc::new(InMemoryStore::with_clock(clock.clone()));
        let directory = RoomDirectory::new(
            Arc::new(SweepingStore::new(inner.clone())),
            clock,
            RoomDirectoryConfig::default(),
        );
        (inner, directory)
    }

    #[tokio::test]
    async fn test_join_into_room_reclaimed_mid_join_is_not_found() {
        // テスト項目: 読み込み後・追加前に回収されたルームへの参加は NotFound となり、
        //            メタデータのないメンバー集合が残らない
        // given (前提条件):
        let (inner, directory) = sweeping_setup();
        directory
            .create_room(new_room("team", RoomKind::GroupChat))
            .await
            .unwrap();

        // when (操作):
        let result = directory.join(&room_id("team"), &ConnectionId::generate()).await;

        // then (期待する結果):
        assert_eq!(result.unwrap_err(), RoomError::NotFound("team".to_string()));
        assert!(inner.load_room(&room_id("team")).await.unwrap().is_none());
        assert!(inner.members(&room_id("team")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_recreates_event_room_reclaimed_mid_join() {
        // テスト項目: 参加中に回収されたイベントルームは作り直され、参加が記録される
        // given (前提条件):
        let (inner, directory) = sweeping_setup();
        let event_room = room_id("event:42");
        directory
            .create_event_discussion_room("42", None)
            .await
            .unwrap();
        let connection_id = ConnectionId::generate();

        // when (操作):
        let joined = directory.join(&event_room, &connection_id).await.unwrap();

        // then (期待する結果):
        assert_eq!(joined.kind, RoomKind::EventDiscussion);
        assert_eq!(joined.member_count, 1);
        assert!(inner.load_room(&event_room).await.unwrap().is_some());
        assert_eq!(inner.members(&event_room).await.unwrap(), vec![connection_id]);
        assert_eq!(directory.get_room(&event_room).await.unwrap().member_count, 1);
    }

    #[tokio::test]
    async fn test_leave_returns_remaining_members() {
        // テスト項目: 退出後の残りメンバー数が返る
        // given (前提条件):
        let (_store, _clock, directory) = setup();
        let room = directory
            .create_room(new_room("lobby", RoomKind::General))
            .await
            .unwrap();
        let a = ConnectionId::generate();
        let b = ConnectionId::generate();
        directory.join(&room.id, &a).await.unwrap();
        directory.join(&room.id, &b).await.unwrap();

        // when (操作):
        let remaining = directory.leave(&room.id, &a).await.unwrap();

        // then (期待する結果):
        assert_eq!(remaining, 1);
        assert_eq!(directory.members(&room.id).await.unwrap(), vec![b]);
    }

    #[tokio::test]
    async fn test_message_count_accumulates() {
        // テスト項目: メッセージ数が加算され、統計として取得できる
        // given (前提条件):
        let (_store, clock, directory) = setup();
        let room = directory
            .create_room(new_room("lobby", RoomKind::General))
            .await
            .unwrap();

        // when (操作):
        directory.increment_message_count(&room.id).await.unwrap();
        clock.advance(1_000);
        directory.increment_message_count(&room.id).await.unwrap();
        let (stats, members) = directory.room_stats(&room.id).await.unwrap();

        // then (期待する結果):
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.last_activity, Timestamp::new(clock.now_millis()));
        assert_eq!(members, 0);
    }

    #[tokio::test]
    async fn test_reclaim_deletes_only_idle_empty_reclaimable_rooms() {
        // テスト項目: 回収は「回収対象の種別・イベント無効・アイドル・空」のルームのみ
        // given (前提条件):
        let (store, clock, directory) = setup();
        directory
            .create_room(new_room("permanent", RoomKind::General))
            .await
            .unwrap();
        directory
            .create_room(new_room("idle", RoomKind::GroupChat))
            .await
            .unwrap();
        directory
            .create_room(new_room("occupied", RoomKind::GroupChat))
            .await
            .unwrap();
        directory
            .create_event_discussion_room("7", None)
            .await
            .unwrap();
        directory
            .join(&room_id("occupied"), &ConnectionId::generate())
            .await
            .unwrap();
        clock.advance(25 * HOUR);
        directory.mark_event_active("7").await.unwrap();
        directory
            .create_room(new_room("fresh", RoomKind::GroupChat))
            .await
            .unwrap();

        // when (操作):
        let report = directory.reclaim_idle_rooms().await.unwrap();

        // then (期待する結果):
        assert_eq!(report.examined, 5);
        assert_eq!(report.reclaimed, vec![room_id("idle")]);
        assert!(store.load_room(&room_id("idle")).await.unwrap().is_none());
        for kept in ["permanent", "occupied", "event:7", "fresh"] {
            assert!(store.load_room(&room_id(kept)).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_evaluate_reports_keep_reason() {
        // テスト項目: 判定結果に保持の理由が含まれる
        // given (前提条件):
        let (_store, clock, directory) = setup();
        let event_room = directory
            .create_event_live_room("9", None)
            .await
            .unwrap();
        let general = directory
            .create_room(new_room("main", RoomKind::General))
            .await
            .unwrap();
        clock.advance(HOUR);
        let now = Timestamp::new(clock.now_millis());

        // when (操作):
        let recent = directory.evaluate(&event_room, now).await.unwrap();
        let permanent = directory.evaluate(&general, now).await.unwrap();
        directory.mark_event_active("9").await.unwrap();
        let active = directory.evaluate(&event_room, now).await.unwrap();

        // then (期待する結果):
        assert_eq!(recent, ReclaimDecision::Keep(KeepReason::RecentlyActive));
        assert_eq!(permanent, ReclaimDecision::Keep(KeepReason::Permanent));
        assert_eq!(active, ReclaimDecision::Keep(KeepReason::EventActive));
    }

    #[tokio::test]
    async fn test_reclaim_keeps_room_that_gains_member_before_delete() {
        // テスト項目: 判定後・削除前に参加者が現れたルームは削除されない
        // given (前提条件):
        let idle = Room {
            id: room_id("race"),
            kind: RoomKind::GroupChat,
            name: "race".to_string(),
            description: String::new(),
            created_by: None,
            created_at: Timestamp::new(0),
            updated_at: Timestamp::new(0),
            max_size: 10,
            is_private: false,
            settings: RoomSettings::default(),
            member_count: 0,
            last_activity: None,
        };
        let mut store = MockRoomStore::new();
        store
            .expect_list_room_ids()
            .returning(|| Ok(vec![RoomId::new("race".to_string()).unwrap()]));
        store
            .expect_load_room()
            .returning(move |_| Ok(Some(idle.clone())));
        store.expect_load_stats().returning(|_| Ok(None));
        store.expect_member_count().returning(|_| Ok(0));
        store
            .expect_delete_room_if_empty()
            .times(1)
            .returning(|_| Ok(GuardedDelete::HasMembers(1)));
        let directory = RoomDirectory::new(
            Arc::new(store),
            Arc::new(ManualClock::new(48 * HOUR)),
            RoomDirectoryConfig::default(),
        );

        // when (操作):
        let report = directory.reclaim_idle_rooms().await.unwrap();

        // then (期待する結果):
        assert!(report.reclaimed.is_empty());
        assert_eq!(report.rescued, 1);
    }
}
