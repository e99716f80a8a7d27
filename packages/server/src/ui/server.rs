//! Server execution logic.

use std::{future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Router,
    routing::{get, post},
};
use hiroba_shared::time::{Clock, SystemClock};
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::{
    config::GatewayConfig,
    domain::{MessageBus, PresenceStore, RoomStore},
    usecase::{ConnectionRegistry, EventBridge, RoomDirectory},
};

use super::{
    handler::{
        broadcast, create_private_room, create_room, delete_room, gateway_stats, get_room,
        health_check, join_room, leave_room, list_rooms, room_members, room_stats, update_room,
        websocket_handler,
    },
    state::AppState,
};

pub type ServerError = Box<dyn std::error::Error + Send + Sync>;

/// Messaging gateway server
///
/// Wires the Room Directory, the Connection Registry and the Event Bridge on
/// top of the given store and bus, and serves the WebSocket and admin endpoints.
///
/// # Example
///
/// ```ignore
/// let server = Server::new(&config, store.clone(), store, bus);
/// server.run("127.0.0.1".to_string(), 8080).await?;
/// ```
pub struct Server {
    state: Arc<AppState>,
    config: GatewayConfig,
    stop: watch::Sender<bool>,
}

impl Server {
    pub fn new(
        config: &GatewayConfig,
        room_store: Arc<dyn RoomStore>,
        presence_store: Arc<dyn PresenceStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self::with_clock(config, room_store, presence_store, bus, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: &GatewayConfig,
        room_store: Arc<dyn RoomStore>,
        presence_store: Arc<dyn PresenceStore>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("gw-{}", Uuid::new_v4().simple()));

        // Initialize dependencies in order:
        // 1. Room Directory (shared store)
        // 2. Connection Registry (local state + presence)
        // 3. Event Bridge (bus)
        let rooms = Arc::new(RoomDirectory::new(
            room_store,
            clock.clone(),
            config.room_directory(),
        ));
        let registry = Arc::new(ConnectionRegistry::new(
            rooms.clone(),
            presence_store,
            clock,
            config.registry(instance_id),
        ));
        let bridge = Arc::new(EventBridge::new(registry.clone(), rooms.clone(), bus));

        let (stop, shutdown) = watch::channel(false);
        let state = Arc::new(AppState {
            registry,
            rooms,
            bridge,
            connection: config.connection(),
            shutdown,
        });

        Self {
            state,
            config: config.clone(),
            stop,
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            // WebSocket エンドポイント
            .route("/ws", get(websocket_handler))
            // HTTP エンドポイント
            .route("/api/health", get(health_check))
            .route("/api/stats", get(gateway_stats))
            .route("/api/broadcast", post(broadcast))
            .route("/api/rooms", get(list_rooms).post(create_room))
            .route("/api/rooms/private", post(create_private_room))
            .route(
                "/api/rooms/{room_id}",
                get(get_room).patch(update_room).delete(delete_room),
            )
            .route("/api/rooms/{room_id}/members", get(room_members))
            .route("/api/rooms/{room_id}/stats", get(room_stats))
            .route("/api/rooms/{room_id}/join", post(join_room))
            .route("/api/rooms/{room_id}/leave", post(leave_room))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Run the gateway until Ctrl+C / SIGTERM
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind, if the bus subscriptions
    /// cannot be opened, or if there's an error during server execution.
    pub async fn run(self, host: String, port: u16) -> Result<(), ServerError> {
        let bind_addr = format!("{}:{}", host, port);
        let listener = TcpListener::bind(&bind_addr).await?;
        tracing::info!("Connect to: ws://{}/ws?user_id=<id>", bind_addr);
        tracing::info!("Press Ctrl+C to shutdown gracefully");
        self.serve(listener, super::signal::shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let state = self.state.clone();
        let app = self.router();

        let mut tasks = state.bridge.start(state.shutdown.clone()).await?;
        tasks.push(
            state
                .rooms
                .clone()
                .spawn_reclaimer(self.config.sweep_interval(), state.shutdown.clone()),
        );
        tasks.push(
            state
                .registry
                .clone()
                .spawn_stats_publisher(self.config.stats_interval(), state.shutdown.clone()),
        );

        tracing::info!(
            "Gateway {} listening on {}",
            state.registry.instance_id(),
            listener.local_addr()?
        );

        let stop = self.stop;
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            // Stop background tasks and open WebSocket sessions
            let _ = stop.send(true);
        })
        .await?;

        for task in tasks {
            let _ = task.await;
        }
        tracing::info!("Server shutdown complete");

        Ok(())
    }
}
