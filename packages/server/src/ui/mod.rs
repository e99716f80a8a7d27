//! HTTP / WebSocket surface of the gateway.

mod handler;
mod server;
mod signal;
pub mod state;

pub use server::Server;
pub use signal::shutdown_signal;
pub use state::{AppState, ConnectionSettings};
