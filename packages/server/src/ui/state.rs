//! Shared application state.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::usecase::{ConnectionRegistry, EventBridge, RoomDirectory};

/// Per-connection transport limits
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Interval between heartbeat pings on the write path
    pub ping_interval: Duration,
    /// Idle-read deadline, renewed by every inbound frame
    pub pong_wait: Duration,
    /// Deadline for a single outbound frame
    pub write_wait: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            write_wait: Duration::from_secs(10),
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Shared application state
pub struct AppState {
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomDirectory>,
    pub bridge: Arc<EventBridge>,
    pub connection: ConnectionSettings,
    /// Flips to `true` when the server starts shutting down
    pub shutdown: watch::Receiver<bool>,
}
