//! Gateway configuration (command-line flags with environment fallbacks).

use std::time::Duration;

use clap::Parser;

use crate::{
    ui::ConnectionSettings,
    usecase::{RegistryConfig, RoomDirectoryConfig},
};

#[derive(Parser, Debug, Clone)]
#[command(name = "hiroba-server")]
#[command(about = "Real-time messaging gateway for Hiroba", long_about = None)]
pub struct GatewayConfig {
    /// Host address to bind the server to
    #[arg(short = 'H', long, env = "HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Redis URL of the shared store; in-memory store when unset
    #[arg(long, env = "REDIS_URL")]
    pub redis_url: Option<String>,

    /// NATS URL of the message bus; in-process bus when unset
    #[arg(long, env = "NATS_URL")]
    pub nats_url: Option<String>,

    /// Identifier of this gateway instance; random when unset
    #[arg(long, env = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Outbound queue size per connection
    #[arg(long, env = "MAILBOX_CAPACITY", default_value_t = 256)]
    pub mailbox_capacity: usize,

    /// Member ceiling for rooms created without an explicit max size
    #[arg(long, env = "DEFAULT_MAX_ROOM_SIZE", default_value_t = 1000)]
    pub default_max_room_size: usize,

    /// Seconds between heartbeat pings
    #[arg(long, env = "PING_INTERVAL_SECS", default_value_t = 54)]
    pub ping_interval_secs: u64,

    /// Seconds a connection may stay silent before it is closed
    #[arg(long, env = "PONG_WAIT_SECS", default_value_t = 60)]
    pub pong_wait_secs: u64,

    /// Seconds allowed for a single outbound frame
    #[arg(long, env = "WRITE_WAIT_SECS", default_value_t = 10)]
    pub write_wait_secs: u64,

    /// Maximum inbound frame size in bytes
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = 64 * 1024)]
    pub max_frame_bytes: usize,

    /// Seconds without activity after which an empty room is reclaimed
    #[arg(long, env = "IDLE_ROOM_THRESHOLD_SECS", default_value_t = 24 * 60 * 60)]
    pub idle_room_threshold_secs: u64,

    /// Seconds between idle-room sweeps
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value_t = 10 * 60)]
    pub sweep_interval_secs: u64,

    /// Seconds between instance stats writes
    #[arg(long, env = "STATS_INTERVAL_SECS", default_value_t = 30)]
    pub stats_interval_secs: u64,

    /// Seconds an event stays active after its last bus message
    #[arg(long, env = "EVENT_ACTIVE_TTL_SECS", default_value_t = 6 * 60 * 60)]
    pub event_active_ttl_secs: u64,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            redis_url: None,
            nats_url: None,
            instance_id: None,
            mailbox_capacity: 256,
            default_max_room_size: 1000,
            ping_interval_secs: 54,
            pong_wait_secs: 60,
            write_wait_secs: 10,
            max_frame_bytes: 64 * 1024,
            idle_room_threshold_secs: 24 * 60 * 60,
            sweep_interval_secs: 10 * 60,
            stats_interval_secs: 30,
            event_active_ttl_secs: 6 * 60 * 60,
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn registry(&self, instance_id: String) -> RegistryConfig {
        RegistryConfig {
            instance_id,
            mailbox_capacity: self.mailbox_capacity,
        }
    }

    pub fn room_directory(&self) -> RoomDirectoryConfig {
        RoomDirectoryConfig {
            default_max_size: self.default_max_room_size,
            idle_threshold: Duration::from_secs(self.idle_room_threshold_secs),
            entity_active_ttl: Duration::from_secs(self.event_active_ttl_secs),
        }
    }

    pub fn connection(&self) -> ConnectionSettings {
        ConnectionSettings {
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}
