//! HTTP API request/response DTOs.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{RoomKind, RoomSettings};

/// Room as returned by the admin API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomDetailDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: RoomKind,
    pub name: String,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub max_size: usize,
    pub is_private: bool,
    pub settings: RoomSettings,
    pub member_count: usize,
    pub last_activity: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListRoomsQuery {
    #[serde(rename = "type")]
    pub kind: Option<RoomKind>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateRoomRequest {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<RoomKind>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub created_by: Option<String>,
    pub max_size: Option<usize>,
    #[serde(default)]
    pub is_private: bool,
    pub settings: Option<RoomSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateRoomRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_size: Option<usize>,
    pub is_private: Option<bool>,
    pub settings: Option<RoomSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrivateRoomRequest {
    pub user_a: String,
    pub user_b: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MembershipRequest {
    pub connection_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipResponse {
    pub room_id: String,
    pub connection_id: String,
    pub member_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberDetailDto {
    pub connection_id: String,
    /// Only known for connections held by this instance
    pub user_id: Option<String>,
    pub display_name: Option<String>,
    pub connected_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMembersDto {
    pub room_id: String,
    pub members: Vec<MemberDetailDto>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStatsDto {
    pub room_id: String,
    pub member_count: usize,
    pub message_count: u64,
    pub last_activity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayStatsDto {
    pub instance_id: String,
    pub connections: usize,
    pub users: usize,
    pub rooms: usize,
    pub started_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastTarget {
    User,
    Room,
    Global,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastRequest {
    pub target: BroadcastTarget,
    /// User id or room id; ignored for global broadcasts
    pub target_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastResponse {
    pub message_id: String,
    pub local_deliveries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
