//! Hiroba messaging gateway.
//!
//! Run with:
//! ```not_rust
//! cargo run --bin hiroba-server
//! cargo run --bin hiroba-server -- --host 0.0.0.0 --port 3000 \
//!     --redis-url redis://127.0.0.1:6379 --nats-url nats://127.0.0.1:4222
//! ```

use std::sync::Arc;

use clap::Parser;
use hiroba_server::{
    config::GatewayConfig,
    domain::{MessageBus, PresenceStore, RoomStore},
    infrastructure::{
        bus::{InMemoryBus, NatsBus},
        store::{InMemoryStore, RedisStore},
    },
    ui::Server,
};
use hiroba_shared::logger::setup_logger;

#[tokio::main]
async fn main() {
    let config = GatewayConfig::parse();

    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), &config.log_level);

    // 1. Shared store
    let (room_store, presence_store): (Arc<dyn RoomStore>, Arc<dyn PresenceStore>) =
        match &config.redis_url {
            Some(url) => match RedisStore::connect(url).await {
                Ok(store) => {
                    let store = Arc::new(store);
                    (store.clone(), store)
                }
                Err(e) => {
                    tracing::error!("Failed to connect to Redis: {}", e);
                    std::process::exit(1);
                }
            },
            None => {
                tracing::warn!("REDIS_URL not set, using in-memory store (single instance only)");
                let store = Arc::new(InMemoryStore::new());
                (store.clone(), store)
            }
        };

    // 2. Bus
    let bus: Arc<dyn MessageBus> = match &config.nats_url {
        Some(url) => match NatsBus::connect(url).await {
            Ok(bus) => Arc::new(bus),
            Err(e) => {
                tracing::error!("Failed to connect to NATS: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            tracing::warn!("NATS_URL not set, using in-process bus (single instance only)");
            Arc::new(InMemoryBus::default())
        }
    };

    // 3. Create and run the server
    let server = Server::new(&config, room_store, presence_store, bus);
    if let Err(e) = server.run(config.host.clone(), config.port).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
