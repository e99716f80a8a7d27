//! Data Transfer Objects (DTOs) for the gateway.
//!
//! DTOs are organized by protocol:
//! - `websocket`: WebSocket frames
//! - `bus`: bus payloads
//! - `http`: HTTP API requests and responses

pub mod bus;
pub mod conversion;
pub mod http;
pub mod websocket;
