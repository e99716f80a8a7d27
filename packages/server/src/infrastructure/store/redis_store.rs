//! Redis shared store.
//!
//! Key layout (all under the `hiroba:` prefix):
//!
//! ```text
//! hiroba:rooms                      set of room ids
//! hiroba:room:{room_id}             room metadata (JSON)
//! hiroba:room_members:{room_id}     set of connection ids
//! hiroba:room_stats:{room_id}       hash {message_count, last_activity}
//! hiroba:presence:{connection_id}   presence record (JSON)
//! hiroba:user_connections:{user_id} set of connection ids
//! hiroba:user_rooms:{user_id}       set of room ids
//! hiroba:instance_stats:{instance}  aggregate stats (JSON)
//! hiroba:entity_active:{entity_id}  "1" with a TTL
//! ```

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use redis::{AsyncCommands, Script, aio::MultiplexedConnection};
use serde::{Serialize, de::DeserializeOwned};
use tracing::{info, warn};

use crate::domain::{
    ConnectionId, GuardedDelete, InstanceStats, MemberAdd, PresenceRecord, PresenceStore, Room,
    RoomId, RoomStats, RoomStore, StoreError, Timestamp, UserId,
};

pub const KEY_PREFIX: &str = "hiroba:";

const ROOM_INDEX_KEY: &str = "hiroba:rooms";

/// EXISTS + SISMEMBER + SCARD + SADD in one step so concurrent joins cannot overshoot
/// max size or recreate the member set of a reclaimed room.
const ADD_MEMBER_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return {3, 0}
end
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
  return {1, redis.call('SCARD', KEYS[2])}
end
local n = redis.call('SCARD', KEYS[2])
if n >= tonumber(ARGV[2]) then
  return {2, n}
end
redis.call('SADD', KEYS[2], ARGV[1])
return {0, n + 1}
"#;

const DELETE_IF_EMPTY_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local n = redis.call('SCARD', KEYS[2])
if n > 0 then
  return n
end
redis.call('DEL', KEYS[1], KEYS[2], KEYS[3])
redis.call('SREM', KEYS[4], ARGV[1])
return 0
"#;

const RECORD_ACTIVITY_SCRIPT: &str = r#"
local count = redis.call('HINCRBY', KEYS[1], 'message_count', ARGV[1])
local last = tonumber(redis.call('HGET', KEYS[1], 'last_activity') or '0')
local at = tonumber(ARGV[2])
if at > last then
  redis.call('HSET', KEYS[1], 'last_activity', ARGV[2])
  last = at
end
return {count, last}
"#;

fn room_key(room_id: &RoomId) -> String {
    format!("{KEY_PREFIX}room:{room_id}")
}

fn members_key(room_id: &RoomId) -> String {
    format!("{KEY_PREFIX}room_members:{room_id}")
}

fn stats_key(room_id: &RoomId) -> String {
    format!("{KEY_PREFIX}room_stats:{room_id}")
}

fn presence_key(connection_id: &ConnectionId) -> String {
    format!("{KEY_PREFIX}presence:{connection_id}")
}

fn user_connections_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}user_connections:{user_id}")
}

fn user_rooms_key(user_id: &UserId) -> String {
    format!("{KEY_PREFIX}user_rooms:{user_id}")
}

fn instance_stats_key(instance_id: &str) -> String {
    format!("{KEY_PREFIX}instance_stats:{instance_id}")
}

fn entity_key(entity_id: &str) -> String {
    format!("{KEY_PREFIX}entity_active:{entity_id}")
}

fn command_error(e: redis::RedisError) -> StoreError {
    StoreError::Command(e.to_string())
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(key: &str, json: &str) -> Result<T, StoreError> {
    serde_json::from_str(json).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

fn parse_connection_ids(key: &str, raw: Vec<String>) -> Vec<ConnectionId> {
    raw.into_iter()
        .filter_map(|id| match id.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Skipping malformed connection id in {}: {}", key, e);
                None
            }
        })
        .collect()
}

fn parse_room_ids(key: &str, raw: Vec<String>) -> Vec<RoomId> {
    raw.into_iter()
        .filter_map(|id| match RoomId::new(id) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!("Skipping malformed room id in {}: {}", key, e);
                None
            }
        })
        .collect()
}

/// Redis-backed implementation of both store traits.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    add_member: Script,
    delete_if_empty: Script,
    record_activity: Script,
}

impl RedisStore {
    /// Connect and keep one multiplexed connection for the lifetime of the store.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        info!("Connecting to Redis at {}", redis_url);
        let client =
            redis::Client::open(redis_url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!("Connected to Redis");

        Ok(Self {
            conn,
            add_member: Script::new(ADD_MEMBER_SCRIPT),
            delete_if_empty: Script::new(DELETE_IF_EMPTY_SCRIPT),
            record_activity: Script::new(RECORD_ACTIVITY_SCRIPT),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }
}

#[async_trait]
impl RoomStore for RedisStore {
    async fn save_room(&self, room: &Room) -> Result<(), StoreError> {
        let key = room_key(&room.id);
        let json = encode(&key, room)?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .set(&key, json)
            .ignore()
            .sadd(ROOM_INDEX_KEY, room.id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn load_room(&self, room_id: &RoomId) -> Result<Option<Room>, StoreError> {
        let key = room_key(room_id);
        let mut conn = self.conn();
        let json: Option<String> = conn.get(&key).await.map_err(command_error)?;
        json.map(|j| decode(&key, &j)).transpose()
    }

    async fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .del(vec![room_key(room_id), members_key(room_id), stats_key(room_id)])
            .ignore()
            .srem(ROOM_INDEX_KEY, room_id.as_str())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn delete_room_if_empty(&self, room_id: &RoomId) -> Result<GuardedDelete, StoreError> {
        let mut conn = self.conn();
        let result: i64 = self
            .delete_if_empty
            .key(room_key(room_id))
            .key(members_key(room_id))
            .key(stats_key(room_id))
            .key(ROOM_INDEX_KEY)
            .arg(room_id.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        Ok(match result {
            0 => GuardedDelete::Deleted,
            n if n > 0 => GuardedDelete::HasMembers(n as usize),
            _ => GuardedDelete::Missing,
        })
    }

    async fn list_room_ids(&self) -> Result<Vec<RoomId>, StoreError> {
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(ROOM_INDEX_KEY).await.map_err(command_error)?;
        let mut ids = parse_room_ids(ROOM_INDEX_KEY, raw);
        ids.sort();
        Ok(ids)
    }

    async fn add_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
        max_size: usize,
    ) -> Result<MemberAdd, StoreError> {
        let key = members_key(room_id);
        let mut conn = self.conn();
        let result: Vec<i64> = self
            .add_member
            .key(room_key(room_id))
            .key(&key)
            .arg(connection_id.to_string())
            .arg(max_size)
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;

        match result.as_slice() {
            [0, n] => Ok(MemberAdd::Added(*n as usize)),
            [1, n] => Ok(MemberAdd::AlreadyMember(*n as usize)),
            [2, _] => Ok(MemberAdd::Full),
            [3, _] => Ok(MemberAdd::RoomMissing),
            other => Err(StoreError::Corrupt {
                key,
                reason: format!("unexpected add_member reply {other:?}"),
            }),
        }
    }

    async fn remove_member(
        &self,
        room_id: &RoomId,
        connection_id: &ConnectionId,
    ) -> Result<usize, StoreError> {
        let key = members_key(room_id);
        let mut conn = self.conn();
        let (_, remaining): (i64, usize) = redis::pipe()
            .atomic()
            .srem(&key, connection_id.to_string())
            .scard(&key)
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(remaining)
    }

    async fn members(&self, room_id: &RoomId) -> Result<Vec<ConnectionId>, StoreError> {
        let key = members_key(room_id);
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(&key).await.map_err(command_error)?;
        let mut members = parse_connection_ids(&key, raw);
        members.sort();
        Ok(members)
    }

    async fn member_count(&self, room_id: &RoomId) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        conn.scard(members_key(room_id))
            .await
            .map_err(command_error)
    }

    async fn record_activity(
        &self,
        room_id: &RoomId,
        messages: u64,
        at: Timestamp,
    ) -> Result<RoomStats, StoreError> {
        let mut conn = self.conn();
        let (message_count, last_activity): (u64, i64) = self
            .record_activity
            .key(stats_key(room_id))
            .arg(messages)
            .arg(at.value())
            .invoke_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(RoomStats {
            message_count,
            last_activity: Timestamp::new(last_activity),
        })
    }

    async fn load_stats(&self, room_id: &RoomId) -> Result<Option<RoomStats>, StoreError> {
        let mut conn = self.conn();
        let fields: HashMap<String, i64> = conn
            .hgetall(stats_key(room_id))
            .await
            .map_err(command_error)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(RoomStats {
            message_count: fields.get("message_count").copied().unwrap_or(0).max(0) as u64,
            last_activity: Timestamp::new(fields.get("last_activity").copied().unwrap_or(0)),
        }))
    }

    async fn mark_entity_active(&self, entity_id: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(entity_key(entity_id), 1, ttl.as_secs().max(1))
            .await
            .map_err(command_error)
    }

    async fn is_entity_active(&self, entity_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        conn.exists(entity_key(entity_id))
            .await
            .map_err(command_error)
    }
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn put_presence(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let key = presence_key(&record.connection_id);
        let json = encode(&key, record)?;
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .set(&key, json)
            .ignore()
            .sadd(
                user_connections_key(&record.identity.user_id),
                record.connection_id.to_string(),
            )
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn remove_presence(
        &self,
        connection_id: &ConnectionId,
        user_id: &UserId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        redis::pipe()
            .atomic()
            .del(presence_key(connection_id))
            .ignore()
            .srem(user_connections_key(user_id), connection_id.to_string())
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn user_connections(&self, user_id: &UserId) -> Result<Vec<ConnectionId>, StoreError> {
        let key = user_connections_key(user_id);
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(&key).await.map_err(command_error)?;
        let mut connections = parse_connection_ids(&key, raw);
        connections.sort();
        Ok(connections)
    }

    async fn add_user_room(&self, user_id: &UserId, room_id: &RoomId) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(user_rooms_key(user_id), room_id.as_str())
            .await
            .map_err(command_error)
    }

    async fn remove_user_room(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn();
        conn.srem::<_, _, ()>(user_rooms_key(user_id), room_id.as_str())
            .await
            .map_err(command_error)
    }

    async fn user_rooms(&self, user_id: &UserId) -> Result<Vec<RoomId>, StoreError> {
        let key = user_rooms_key(user_id);
        let mut conn = self.conn();
        let raw: Vec<String> = conn.smembers(&key).await.map_err(command_error)?;
        let mut rooms = parse_room_ids(&key, raw);
        rooms.sort();
        Ok(rooms)
    }

    async fn put_instance_stats(&self, stats: &InstanceStats) -> Result<(), StoreError> {
        let key = instance_stats_key(&stats.instance_id);
        let json = encode(&key, stats)?;
        let mut conn = self.conn();
        conn.set::<_, _, ()>(&key, json)
            .await
            .map_err(command_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_are_namespaced_per_record_kind() {
        // テスト項目: レコード種別ごとに名前空間付きのキーが生成される
        // given (前提条件):
        let room_id = RoomId::event_discussion("42").unwrap();
        let user_id = UserId::new("alice".to_string()).unwrap();

        // then (期待する結果):
        assert_eq!(room_key(&room_id), "hiroba:room:event:42");
        assert_eq!(members_key(&room_id), "hiroba:room_members:event:42");
        assert_eq!(stats_key(&room_id), "hiroba:room_stats:event:42");
        assert_eq!(user_rooms_key(&user_id), "hiroba:user_rooms:alice");
        assert_eq!(
            user_connections_key(&user_id),
            "hiroba:user_connections:alice"
        );
        assert_eq!(instance_stats_key("gw-1"), "hiroba:instance_stats:gw-1");
        assert_eq!(entity_key("42"), "hiroba:entity_active:42");
    }

    #[test]
    fn test_malformed_ids_are_skipped() {
        // テスト項目: 不正な ID はスキップされ、正しい ID のみ返る
        // given (前提条件):
        let valid = ConnectionId::generate();
        let raw = vec![valid.to_string(), "garbage".to_string()];

        // when (操作):
        let parsed = parse_connection_ids("k", raw);
        let rooms = parse_room_ids("k", vec!["lobby".to_string(), "bad room".to_string()]);

        // then (期待する結果):
        assert_eq!(parsed, vec![valid]);
        assert_eq!(rooms.len(), 1);
    }
}
