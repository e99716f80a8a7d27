//! WebSocket connection handlers.
//!
//! 1 接続につき 2 つのタスクを動かします。
//! - 読み込み側：受信フレームを Event Bridge に渡す。無通信が続けば切断する
//! - 書き込み側：メールボックスを取り出してソケットに書く。定期的に ping を送る
//!
//! どちらかが終了したらもう一方も止め、登録を解除します。

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::USER_AGENT},
    response::IntoResponse,
};
use bytes::Bytes;
use futures_util::{
    sink::SinkExt,
    stream::{SplitSink, SplitStream, StreamExt},
};
use serde::Deserialize;
use tokio::{
    task::JoinHandle,
    time::{Instant, timeout},
};

use crate::{
    domain::{ClientMeta, ConnectionId, Identity, UserId},
    infrastructure::dto::websocket::EnvelopeDto,
    ui::state::{AppState, ConnectionSettings},
    usecase::{Outbound, Registration},
};

/// Identity attached by the upstream authentication layer
#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub user_id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
}

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<ConnectQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = match UserId::new(query.user_id) {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!("Rejecting handshake from {}: {}", remote_addr, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };
    let identity = Identity::new(user_id, query.display_name.unwrap_or_default(), query.contact);
    let meta = ClientMeta {
        remote_addr: Some(remote_addr),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    let max_frame_bytes = state.connection.max_frame_bytes;
    Ok(ws
        .max_message_size(max_frame_bytes)
        .max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state, identity, meta)))
}

/// Drains the connection's mailbox into the socket and emits the heartbeat ping.
///
/// A frame that cannot be written within `write_wait` ends the loop, which
/// tears the connection down.
fn pusher_loop(
    mut outbound: Outbound,
    mut sender: SplitSink<WebSocket, Message>,
    settings: ConnectionSettings,
    connection_id: ConnectionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(
            Instant::now() + settings.ping_interval,
            settings.ping_interval,
        );

        loop {
            let message = tokio::select! {
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => match serde_json::to_string(&EnvelopeDto::from(envelope.as_ref())) {
                        Ok(json) => Message::Text(json.into()),
                        Err(e) => {
                            tracing::error!("Failed to encode envelope {}: {}", envelope.id(), e);
                            continue;
                        }
                    },
                    None => {
                        let _ = timeout(settings.write_wait, sender.send(Message::Close(None))).await;
                        break;
                    }
                },
                _ = ping.tick() => Message::Ping(Bytes::new()),
            };

            match timeout(settings.write_wait, sender.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::debug!("Write to {} failed: {}", connection_id, e);
                    break;
                }
                Err(_) => {
                    tracing::warn!("Write deadline exceeded for {}, disconnecting", connection_id);
                    break;
                }
            }
        }
    })
}

/// Reads inbound frames until the peer closes, errors or stays silent for `pong_wait`.
fn reader_loop(
    mut receiver: SplitStream<WebSocket>,
    state: Arc<AppState>,
    connection_id: ConnectionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let pong_wait = state.connection.pong_wait;
        loop {
            let next = match timeout(pong_wait, receiver.next()).await {
                Ok(next) => next,
                Err(_) => {
                    tracing::info!(
                        "Connection {} silent for {:?}, closing",
                        connection_id,
                        pong_wait
                    );
                    break;
                }
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    tracing::debug!("Read from {} failed: {}", connection_id, e);
                    break;
                }
                None => break,
            };

            match message {
                Message::Text(text) => {
                    state
                        .bridge
                        .handle_client_text(&connection_id, text.as_str())
                        .await;
                }
                Message::Pong(_) | Message::Ping(_) => {
                    state.registry.touch(&connection_id).await;
                }
                Message::Binary(_) => {
                    tracing::debug!("Ignoring binary frame from {}", connection_id);
                }
                Message::Close(_) => {
                    tracing::debug!("Connection {} requested close", connection_id);
                    break;
                }
            }
        }
    })
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    meta: ClientMeta,
) {
    let Registration {
        connection_id,
        outbound,
    } = state.registry.register(identity, meta).await;

    let (sender, receiver) = socket.split();
    let mut send_task = pusher_loop(
        outbound,
        sender,
        state.connection.clone(),
        connection_id,
    );
    let mut recv_task = reader_loop(receiver, state.clone(), connection_id);
    let mut shutdown = state.shutdown.clone();

    // If any one of the tasks completes, abort the other
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
        _ = shutdown.changed() => {
            send_task.abort();
            recv_task.abort();
        }
    };

    state.registry.unregister(&connection_id).await;
}
