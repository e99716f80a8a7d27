//! InMemory shared store 実装
//!
//! `RoomStore` と `PresenceStore` を HashMap で実装します。
//! 単一インスタンス構成とテストで使用します。複数インスタンス間では共有されません。

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use hiroba_shared::time::{Clock, SystemClock};
use tokio::sync::Mutex;

use crate::domain::{
    ConnectionId, GuardedDelete, InstanceStats, MemberAdd, PresenceRecord, PresenceStore, Room,
    RoomId, RoomStats, RoomStore, StoreError, Timestamp, UserId,
};

#[derive(Default)]
struct Tables {
    rooms: HashMap<RoomId, Room>,
    members: HashMap<RoomId, HashSet<ConnectionId>>,
    stats: HashMap<RoomId, RoomStats>,
    /// entity id -> expiry (millis)
    active_entities: HashMap<String, i64>,
    presence: HashMap<ConnectionId, PresenceRecord>,
    user_connections: HashMap<UserId, HashSet<ConnectionId>>,
    user_rooms: HashMap<UserId, BTreeSet<RoomId>>,
    instances: HashMap<String, InstanceStats>,
}

/// インメモリ共有ストア
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// TTL 判定に使う時計を差し替えて作成
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            clock,
        }
    }

    /// Last aggregate stats written by an instance
    pub async fn instance_stats(&self, instance_id: &str) -> Option<InstanceStats> {
        self.tables.lock().await.instances.get(instance_id).cloned()
    }

    pub async fn presence(&self, connection_id: &ConnectionId) -> Option<PresenceRecord> {
        self.tables.lock().await.presence.get(connection_id).cloned()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomStore for InMemoryStore {
    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn load_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.rooms.get(room_id).cloned())
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.rooms.remove(room_id);
        tables.members.remove(room_id);
        tables.stats.remove(room_id);
        Ok(())
    }

    async fn delete_room_if_empty(&self, room_id: &RoomId) -> Result<GuardedDelete, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.rooms.contains_key(room_id) {
            return Ok(GuardedDelete::Missing);
        }
        let count = tables.members.get(room_id).map_or(0, HashSet::len);
        if count > 0 {
            return Ok(GuardedDelete::HasMembers(count));
        }
        tables.rooms.remove(room_id);
        tables.members.remove(room_id);
        tables.stats.remove(room_id);
        Ok(GuardedDelete::Deleted)
    }

    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
        let tables = self.tables.lock().await;
        let mut ids: Vec<RoomId> = tables.rooms.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn add_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        max_size: usize,
    ) -> Result<MemberAdd, StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.rooms.contains_key(room_id) {
            return Ok(MemberAdd::RoomMissing);
        }
        let members = tables.members.entry(room_id.clone()).or_default();
        if members.contains(connection_id) {
            return Ok(MemberAdd::AlreadyMember(members.len()));
        }
        if members.len() >= max_size {
            return Ok(MemberAdd::Full);
        }
        members.insert(*connection_id);
        Ok(MemberAdd::Added(members.len()))
    }

    async fn remove_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<usize, StoreError> {
        let mut tables = self.tables.lock().await;
        let Some(members) = tables.members.get_mut(room_id) else {
            return Ok(0);
        };
        members.remove(connection_id);
        let remaining = members.len();
        if remaining == 0 {
            tables.members.remove(room_id);
        }
        Ok(remaining)
    }

    async fn members(&self, room_id: &RoomId) -> Result<Vec<ConnectionId>, StoreError> {
        let tables = self.tables.lock().await;
        let mut members: Vec<ConnectionId> = tables
            .members
            .get(room_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn member_count(&self, room_id: &RoomId) -> Result<usize, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.members.get(room_id).map_or(0, HashSet::len))
    }

    async fn record_activity(
        &self,
        room_id: &RoomId,
        messages: u64,
        at: Timestamp,
    ) -> Result<RoomStats, StoreError> {
        let mut tables = self.tables.lock().await;
        let stats = tables.stats.entry(room_id.clone()).or_default();
        stats.message_count += messages;
        stats.last_activity = stats.last_activity.max(at);
        Ok(*stats)
    }

    async fn load_stats(&self, room_id: &RoomId) -> Result<Option<RoomStats>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables.stats.get(room_id).copied())
    }

    async fn mark_entity_active(&self, entity_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self.clock.now_millis() + ttl.as_millis() as i64;
        let mut tables = self.tables.lock().await;
        tables
            .active_entities
            .insert(entity_id.to_string(), expires_at);
        Ok(())
    }

    async fn is_entity_active(&self, entity_id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_millis();
        let mut tables = self.tables.lock().await;
        match tables.active_entities.get(entity_id) {
            Some(expires_at) if *expires_at > now => Ok(true),
            Some(_) => {
                tables.active_entities.remove(entity_id);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl PresenceStore for InMemoryStore {
    async fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .user_connections
            .entry(record.identity.user_id.clone())
            .or_default()
            .insert(record.connection_id);
        tables.presence.insert(record.connection_id, record.clone());
        Ok(())
    }

    async fn remove_presence(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables.presence.remove(connection_id);
        if let Some(connections) = tables.user_connections.get_mut(user_id) {
            connections.remove(connection_id);
            if connections.is_empty() {
                tables.user_connections.remove(user_id);
            }
        }
        Ok(())
    }

    async fn user_connections(&self, user_id: &UserId) -> Result<Vec<ConnectionId>, StoreError> {
        let tables = self.tables.lock().await;
        let mut connections: Vec<ConnectionId> = tables
            .user_connections
            .get(user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        connections.sort();
        Ok(connections)
    }

    async fn add_user_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .user_rooms
            .entry(user_id.clone())
            .or_default()
            .insert(room_id.clone());
        Ok(())
    }

    async fn remove_user_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(rooms) = tables.user_rooms.get_mut(user_id) {
            rooms.remove(room_id);
            if rooms.is_empty() {
                tables.user_rooms.remove(user_id);
            }
        }
        Ok(())
    }

    async fn user_rooms(&self, user_id: &UserId) -> Result<Vec<RoomId>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .user_rooms
            .get(user_id)
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_instance_stats(&self, stats: &InstanceStats) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        tables
            .instances
            .insert(stats.instance_id.clone(), stats.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Identity, RoomKind, RoomSettings};
    use hiroba_shared::time::ManualClock;

    // ========================================
    // テスト作業記録
    // ========================================
    // 【何をテストするか】
    // - メンバー追加の上限チェックと冪等性
    // - 削除済みルームへのメンバー追加の拒否
    // - ガード付き削除（メンバーがいれば削除しない）
    // - エンティティの TTL
    // - プレゼンスとユーザー単位の集合の整合性
    // ========================================

    fn room(id: &str) -> Room {
        Room {
            id: RoomId::new(id.to_string()).unwrap(),
            kind: RoomKind::GroupChat,
            name: id.to_string(),
            description: String::new(),
            created_by: None,
            created_at: Timestamp::new(0),
            updated_at: Timestamp::new(0),
            max_size: 2,
            is_private: false,
            settings: RoomSettings::default(),
            member_count: 0,
            last_activity: None,
        }
    }

    #[tokio::test]
    async fn test_add_member_respects_max_size_and_is_idempotent() {
        // テスト項目: 上限を超える追加は拒否され、重複追加は人数を変えない
        // given (前提条件):
        let store = InMemoryStore::new();
        let lobby = room("lobby");
        store.save_room(&lobby).await.unwrap();
        let room_id = lobby.id.clone();
        let (a, b, c) = (
            ConnectionId::generate(),
            ConnectionId::generate(),
            ConnectionId::generate(),
        );

        // when (操作):
        let first = store.add_member(&room_id, &a, 2).await.unwrap();
        let again = store.add_member(&room_id, &a, 2).await.unwrap();
        let second = store.add_member(&room_id, &b, 2).await.unwrap();
        let third = store.add_member(&room_id, &c, 2).await.unwrap();

        // then (期待する結果):
        assert_eq!(first, MemberAdd::Added(1));
        assert_eq!(again, MemberAdd::AlreadyMember(1));
        assert_eq!(second, MemberAdd::Added(2));
        assert_eq!(third, MemberAdd::Full);
        assert_eq!(store.member_count(&room_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_add_member_to_deleted_room_is_rejected() {
        // テスト項目: 削除済みのルームにはメンバーを追加できず、メンバー集合も作られない
        // given (前提条件):
        let store = InMemoryStore::new();
        let lobby = room("lobby");
        store.save_room(&lobby).await.unwrap();
        store.delete_room_if_empty(&lobby.id).await.unwrap();

        // when (操作):
        let result = store
            .add_member(&lobby.id, &ConnectionId::generate(), 10)
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(result, MemberAdd::RoomMissing);
        assert_eq!(store.member_count(&lobby.id).await.unwrap(), 0);
        assert!(store.members(&lobby.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_room_if_empty_keeps_populated_room() {
        // テスト項目: メンバーがいるルームはガード付き削除で消えない
        // given (前提条件):
        let store = InMemoryStore::new();
        let lobby = room("lobby");
        store.save_room(&lobby).await.unwrap();
        let member = ConnectionId::generate();
        store.add_member(&lobby.id, &member, 10).await.unwrap();

        // when (操作):
        let kept = store.delete_room_if_empty(&lobby.id).await.unwrap();
        store.remove_member(&lobby.id, &member).await.unwrap();
        let deleted = store.delete_room_if_empty(&lobby.id).await.unwrap();
        let missing = store.delete_room_if_empty(&lobby.id).await.unwrap();

        // then (期待する結果):
        assert_eq!(kept, GuardedDelete::HasMembers(1));
        assert_eq!(deleted, GuardedDelete::Deleted);
        assert_eq!(missing, GuardedDelete::Missing);
        assert!(store.load_room(&lobby.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entity_activity_expires_after_ttl() {
        // テスト項目: エンティティの有効状態は TTL 経過後に失効する
        // given (前提条件):
        let clock = Arc::new(ManualClock::new(0));
        let store = InMemoryStore::with_clock(clock.clone());
        store
            .mark_entity_active("42", Duration::from_secs(60))
            .await
            .unwrap();

        // when (操作):
        let before = store.is_entity_active("42").await.unwrap();
        clock.advance(61_000);
        let after = store.is_entity_active("42").await.unwrap();

        // then (期待する結果):
        assert!(before);
        assert!(!after);
    }

    #[tokio::test]
    async fn test_presence_tracks_user_connections() {
        // テスト項目: プレゼンスの追加・削除がユーザーの接続集合に反映される
        // given (前提条件):
        let store = InMemoryStore::new();
        let user_id = UserId::new("alice".to_string()).unwrap();
        let record = PresenceRecord {
            connection_id: ConnectionId::generate(),
            identity: Identity::new(user_id.clone(), "Alice".to_string(), None),
            instance_id: "gw-1".to_string(),
            connected_at: Timestamp::new(1),
        };

        // when (操作):
        store.put_presence(&record).await.unwrap();
        let connected = store.user_connections(&user_id).await.unwrap();
        store
            .remove_presence(&record.connection_id, &user_id)
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(connected, vec![record.connection_id]);
        assert!(store.user_connections(&user_id).await.unwrap().is_empty());
        assert!(store.presence(&record.connection_id).await.is_none());
    }
}
