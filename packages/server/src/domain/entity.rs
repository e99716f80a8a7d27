//! Domain entities: connections, rooms and presence records.

use std::{collections::BTreeSet, fmt, net::SocketAddr, str::FromStr};

use serde::{Deserialize, Serialize};

use super::{
    error::ValueObjectError,
    value_object::{ConnectionId, RoomId, Timestamp, UserId},
};

/// Pre-validated identity attached by the upstream authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    /// Contact reference (e-mail, phone, ...); opaque to the gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
}

impl Identity {
    pub fn new(user_id: UserId, display_name: String, contact: Option<String>) -> Self {
        // fall back to the user id so every envelope has something printable
        let display_name = if display_name.trim().is_empty() {
            user_id.as_str().to_string()
        } else {
            display_name
        };
        Self {
            user_id,
            display_name,
            contact,
        }
    }
}

/// Client metadata captured at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMeta {
    pub remote_addr: Option<SocketAddr>,
    pub user_agent: Option<String>,
}

/// Point-in-time view of a live connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub meta: ClientMeta,
    pub created_at: Timestamp,
    pub last_heartbeat: Timestamp,
    pub rooms: BTreeSet<RoomId>,
}

/// Kind of a room; drives defaults and idle reclamation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    General,
    EventDiscussion,
    EventLive,
    PrivateChat,
    GroupChat,
    Support,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::General => "general",
            RoomKind::EventDiscussion => "event_discussion",
            RoomKind::EventLive => "event_live",
            RoomKind::PrivateChat => "private_chat",
            RoomKind::GroupChat => "group_chat",
            RoomKind::Support => "support",
        }
    }

    /// `general` rooms are permanent.
    pub fn is_reclaimable(&self) -> bool {
        !matches!(self, RoomKind::General)
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomKind {
    type Err = ValueObjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(RoomKind::General),
            "event_discussion" => Ok(RoomKind::EventDiscussion),
            "event_live" => Ok(RoomKind::EventLive),
            "private_chat" => Ok(RoomKind::PrivateChat),
            "group_chat" => Ok(RoomKind::GroupChat),
            "support" => Ok(RoomKind::Support),
            other => Err(ValueObjectError::UnknownRoomKind(other.to_string())),
        }
    }
}

/// Per-room behaviour switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub chat_allowed: bool,
    pub anonymous_allowed: bool,
    pub approval_required: bool,
    pub moderation_enabled: bool,
    /// Messages per member per minute; 0 disables the ceiling
    pub rate_limit_per_minute: u32,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            chat_allowed: true,
            anonymous_allowed: false,
            approval_required: false,
            moderation_enabled: false,
            rate_limit_per_minute: 0,
        }
    }
}

/// Room metadata plus live fields overlaid on read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub kind: RoomKind,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub created_by: Option<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub max_size: usize,
    #[serde(default)]
    pub is_private: bool,
    #[serde(default)]
    pub settings: RoomSettings,
    /// Live: size of the membership index, never persisted
    #[serde(skip)]
    pub member_count: usize,
    /// Live: taken from the stats record, never persisted
    #[serde(skip)]
    pub last_activity: Option<Timestamp>,
}

impl Room {
    pub fn is_full(&self) -> bool {
        self.member_count >= self.max_size
    }
}

/// Input for room creation; unset fields get defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NewRoom {
    pub id: Option<RoomId>,
    pub kind: Option<RoomKind>,
    pub name: String,
    pub description: String,
    pub created_by: Option<UserId>,
    pub max_size: Option<usize>,
    pub is_private: bool,
    pub settings: Option<RoomSettings>,
}

/// Partial update applied by read-modify-write.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_size: Option<usize>,
    pub is_private: Option<bool>,
    pub settings: Option<RoomSettings>,
}

/// Rolling activity counters kept apart from the metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoomStats {
    pub message_count: u64,
    pub last_activity: Timestamp,
}

/// Shared-store entry stating that a connection is live somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub connection_id: ConnectionId,
    pub identity: Identity,
    pub instance_id: String,
    pub connected_at: Timestamp,
}

/// Aggregate numbers for one gateway instance.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstanceStats {
    pub instance_id: String,
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    pub started_at: Timestamp,
    pub updated_at: Timestamp,
}
