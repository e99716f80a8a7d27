//! HTTP API endpoint handlers.
//!
//! 運用者向けの薄いラッパーです。独自のロジックは持たず、Room Directory /
//! Connection Registry / Event Bridge を呼び出して DTO に変換するだけです。

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use hiroba_shared::time::timestamp_to_rfc3339;

use crate::{
    domain::{
        ConnectionId, DeliveryScope, Envelope, MessageKind, NewRoom, RoomId, UserId,
        ValueObjectError,
    },
    infrastructure::dto::http::{
        BroadcastRequest, BroadcastResponse, BroadcastTarget, CreateRoomRequest, ErrorResponse,
        GatewayStatsDto, ListRoomsQuery, MemberDetailDto, MembershipRequest, MembershipResponse,
        PrivateRoomRequest, RoomDetailDto, RoomMembersDto, RoomStatsDto, UpdateRoomRequest,
    },
    ui::state::AppState,
    usecase::{BridgeError, RoomError},
};

const DEFAULT_LIST_LIMIT: usize = 100;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn room_error(e: RoomError) -> ApiError {
    let status = match &e {
        RoomError::NotFound(_) | RoomError::ConnectionNotFound(_) => StatusCode::NOT_FOUND,
        RoomError::Full(_) | RoomError::NotMember(_) => StatusCode::CONFLICT,
        RoomError::Invalid(_) => StatusCode::BAD_REQUEST,
        RoomError::Store(_) => {
            tracing::error!("Store failure while serving request: {}", e);
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    api_error(status, e.to_string())
}

fn bridge_error(e: BridgeError) -> ApiError {
    match e {
        BridgeError::Room(e) => room_error(e),
        other => api_error(StatusCode::BAD_REQUEST, other.to_string()),
    }
}

fn parse_room_id(raw: String) -> Result<RoomId, ApiError> {
    RoomId::new(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

fn parse_connection_id(raw: &str) -> Result<ConnectionId, ApiError> {
    raw.parse()
        .map_err(|e: ValueObjectError| api_error(StatusCode::BAD_REQUEST, e.to_string()))
}

/// Health check endpoint (liveness only; store and bus are not probed)
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "instance_id": state.registry.instance_id(),
    }))
}

/// Get list of public rooms
pub async fn list_rooms(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListRoomsQuery>,
) -> Result<Json<Vec<RoomDetailDto>>, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let rooms = state
        .rooms
        .list_rooms(query.kind, limit)
        .await
        .map_err(room_error)?;

    // Domain Model から DTO への変換
    Ok(Json(rooms.iter().map(RoomDetailDto::from).collect()))
}

pub async fn create_room(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomDetailDto>), ApiError> {
    let new_room = NewRoom::try_from(request)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let room = state.rooms.create_room(new_room).await.map_err(room_error)?;
    Ok((StatusCode::CREATED, Json(RoomDetailDto::from(&room))))
}

/// Get room detail by ID
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomDetailDto>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    let room = state.rooms.get_room(&room_id).await.map_err(room_error)?;
    Ok(Json(RoomDetailDto::from(&room)))
}

pub async fn update_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(request): Json<UpdateRoomRequest>,
) -> Result<Json<RoomDetailDto>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    let room = state
        .rooms
        .update_room(&room_id, request.into())
        .await
        .map_err(room_error)?;
    Ok(Json(RoomDetailDto::from(&room)))
}

pub async fn delete_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let room_id = parse_room_id(room_id)?;
    state.rooms.delete_room(&room_id).await.map_err(room_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn create_private_room(
    State(state): State<Arc<AppState>>,
    Json(request): Json<PrivateRoomRequest>,
) -> Result<Json<RoomDetailDto>, ApiError> {
    let parse = |raw: String| {
        UserId::new(raw).map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))
    };
    let user_a = parse(request.user_a)?;
    let user_b = parse(request.user_b)?;
    let room = state
        .rooms
        .create_private_chat_room(&user_a, &user_b)
        .await
        .map_err(room_error)?;
    Ok(Json(RoomDetailDto::from(&room)))
}

/// Members across all instances; identity details only for local connections
pub async fn room_members(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomMembersDto>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    // 404 for unknown rooms
    state.rooms.get_room(&room_id).await.map_err(room_error)?;
    let member_ids = state.rooms.members(&room_id).await.map_err(room_error)?;

    let mut members = Vec::with_capacity(member_ids.len());
    for connection_id in member_ids {
        let local = state.registry.connection(&connection_id).await;
        members.push(MemberDetailDto {
            connection_id: connection_id.to_string(),
            user_id: local
                .as_ref()
                .map(|c| c.identity.user_id.as_str().to_string()),
            display_name: local.as_ref().map(|c| c.identity.display_name.clone()),
            connected_at: local
                .as_ref()
                .map(|c| timestamp_to_rfc3339(c.created_at.value())),
        });
    }

    Ok(Json(RoomMembersDto {
        room_id: room_id.into_string(),
        members,
    }))
}

pub async fn room_stats(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStatsDto>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    let (stats, member_count) = state.rooms.room_stats(&room_id).await.map_err(room_error)?;
    Ok(Json(RoomStatsDto {
        room_id: room_id.into_string(),
        member_count,
        message_count: stats.message_count,
        last_activity: (stats.last_activity.value() > 0)
            .then(|| timestamp_to_rfc3339(stats.last_activity.value())),
    }))
}

pub async fn join_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(request): Json<MembershipRequest>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    let connection_id = parse_connection_id(&request.connection_id)?;
    let room = state
        .bridge
        .join_room(&connection_id, &room_id)
        .await
        .map_err(bridge_error)?;
    Ok(Json(MembershipResponse {
        room_id: room_id.into_string(),
        connection_id: connection_id.to_string(),
        member_count: room.member_count,
    }))
}

pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    Json(request): Json<MembershipRequest>,
) -> Result<Json<MembershipResponse>, ApiError> {
    let room_id = parse_room_id(room_id)?;
    let connection_id = parse_connection_id(&request.connection_id)?;
    let remaining = state
        .bridge
        .leave_room(&connection_id, &room_id)
        .await
        .map_err(bridge_error)?;
    Ok(Json(MembershipResponse {
        room_id: room_id.into_string(),
        connection_id: connection_id.to_string(),
        member_count: remaining,
    }))
}

/// Aggregate statistics of this instance
pub async fn gateway_stats(State(state): State<Arc<AppState>>) -> Json<GatewayStatsDto> {
    let stats = state.registry.stats().await;
    Json(GatewayStatsDto {
        instance_id: stats.instance_id,
        connections: stats.connections,
        users: stats.users,
        rooms: stats.rooms,
        started_at: timestamp_to_rfc3339(stats.started_at.value()),
    })
}

/// Deliver locally and republish on the bus so other instances deliver too
pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>, ApiError> {
    let kind: MessageKind = request
        .kind
        .parse()
        .map_err(|e: ValueObjectError| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let target_id = || {
        request
            .target_id
            .clone()
            .ok_or_else(|| api_error(StatusCode::BAD_REQUEST, "target_id is required"))
    };

    let (envelope, outcome) = match request.target {
        BroadcastTarget::User => {
            let user_id = UserId::new(target_id()?)
                .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
            let envelope = Envelope::new(
                kind,
                DeliveryScope::User(user_id.clone()),
                request.payload.clone(),
            );
            let outcome = state.bridge.publish_to_user(&user_id, envelope.clone()).await;
            (envelope, outcome)
        }
        BroadcastTarget::Room => {
            let room_id = parse_room_id(target_id()?)?;
            let envelope = Envelope::new(
                kind,
                DeliveryScope::Room(room_id.clone()),
                request.payload.clone(),
            );
            let outcome = state
                .bridge
                .publish_to_room(&room_id, envelope.clone(), None)
                .await;
            (envelope, outcome)
        }
        BroadcastTarget::Global => {
            let envelope = Envelope::new(kind, DeliveryScope::Global, request.payload.clone());
            let outcome = state.bridge.publish_global(envelope.clone()).await;
            (envelope, outcome)
        }
    };

    Ok(Json(BroadcastResponse {
        message_id: envelope.id().to_string(),
        local_deliveries: outcome.delivered(),
    }))
}
