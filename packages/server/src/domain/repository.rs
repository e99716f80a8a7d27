//! Shared store trait 定義
//!
//! ドメイン層が必要とする共有ストア（プレゼンス・ルームメタデータ・統計）の
//! インターフェースを定義します。具体的な実装は Infrastructure 層が提供します（依存性の逆転）。
//!
//! ## 一貫性
//!
//! ストアはインスタンス間の唯一の共有状態です。ローカルの配送判断には使わず、
//! インスタンス間のルックアップとアイドルルームの回収にのみ使います。

use std::time::Duration;

use async_trait::async_trait;

use super::{
    ConnectionId, InstanceStats, PresenceRecord, Room, RoomId, RoomStats, StoreError, Timestamp,
    UserId,
};

/// Result of adding a connection to a room's membership index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberAdd {
    /// Added; carries the new member count
    Added(usize),
    /// Was already a member; carries the current member count
    AlreadyMember(usize),
    /// Rejected because the room is at its maximum size
    Full,
    /// Rejected because the room metadata no longer exists
    RoomMissing,
}

/// Outcome of the guarded delete used by idle reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardedDelete {
    Deleted,
    /// Someone joined between the sweep's check and the delete
    HasMembers(usize),
    Missing,
}

/// Room metadata, membership and stats store
///
/// UseCase 層はこの trait に依存し、Redis などの具体的な実装には依存しない。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomStore: Send + Sync {
    /// メタデータを書き込む（既存のものは上書き、メンバーシップには触れない）
    async fn save_room(&self, room: &Room) -> Result<(), StoreError>;

    /// メタデータを読み込む
    async fn load_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError>;

    /// メタデータ・メンバーシップ・統計をすべて削除
    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError>;

    /// メンバーがいない場合に限りルームを削除（確認と削除はアトミック）
    async fn delete_room_if_empty(&self, room_id: &RoomId) -> Result<GuardedDelete, StoreError>;

    /// 登録済みの全ルーム ID
    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError>;

    /// ルームが存在し、最大人数を超えない範囲でメンバーを追加（確認と追加はアトミック）
    async fn add_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        max_size: usize,
    ) -> Result<MemberAdd, StoreError>;

    /// メンバーを削除し、残りの人数を返す
    async fn remove_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<usize, StoreError>;

    async fn members(&self, room_id: &RoomId) -> Result<Vec<ConnectionId>, StoreError>;

    async fn member_count(&self, room_id: &RoomId) -> Result<usize, StoreError>;

    /// メッセージ数を加算し、最終アクティビティを更新
    async fn record_activity(
        &self,
        room_id: &RoomId,
        messages: u64,
        at: Timestamp,
    ) -> Result<RoomStats, StoreError>;

    async fn load_stats(&self, room_id: &RoomId) -> Result<Option<RoomStats>, StoreError>;

    /// 外部エンティティ（イベント）が有効であることを TTL 付きで記録
    async fn mark_entity_active(&self, entity_id: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn is_entity_active(&self, entity_id: &str) -> Result<bool, StoreError>;
}

/// Presence store
///
/// 接続ごとのプレゼンスレコードと、ユーザーごとの接続・ルームの集合を管理する。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// プレゼンスレコードを書き込み、ユーザーの接続集合に追加
    async fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError>;

    /// プレゼンスレコードを削除し、ユーザーの接続集合から外す
    async fn remove_presence(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> Result<(), StoreError>;

    async fn user_connections(&self, user_id: &UserId) -> Result<Vec<ConnectionId>, StoreError>;

    async fn add_user_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), StoreError>;

    async fn remove_user_room(&self, user_id: &UserId, room_id: &RoomId)
    -> Result<(), StoreError>;

    async fn user_rooms(&self, user_id: &UserId) -> Result<Vec<RoomId>, StoreError>;

    /// インスタンス全体の集計値を書き込む
    async fn put_instance_stats(&self, stats: &InstanceStats) -> Result<(), StoreError>;
}
