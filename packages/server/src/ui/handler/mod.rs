//! Request handlers.

mod http;
mod websocket;

pub use http::{
    broadcast, create_private_room, create_room, delete_room, gateway_stats, get_room,
    health_check, join_room, leave_room, list_rooms, room_members, room_stats, update_room,
};
pub use websocket::websocket_handler;
