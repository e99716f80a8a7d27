//! Hiroba real-time messaging gateway.
//!
//! Keeps WebSocket connections, rooms and presence in sync across gateway
//! instances through a shared store and a publish/subscribe bus.

pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod ui;
pub mod usecase;
