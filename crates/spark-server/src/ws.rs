//! Agent endpoint: the duplex websocket and its HTTP side channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use spark_core::channel::BoxFuture;
use spark_core::{
    act, Device, FrameSink, Packet, Secret, SecureChannel, SparkError, SparkResult,
    MAX_INLINE_FRAME,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::hub::Connection;
use crate::server::{envelope, failure, msg, AppState, Event};

pub const SECRET_HEADER: &str = "Secret";

/// Write half of an axum websocket.
pub struct WsSink {
    inner: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(inner: SplitSink<WebSocket, Message>) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
}

impl FrameSink for WsSink {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, SparkResult<()>> {
        Box::pin(async move {
            self.inner
                .lock()
                .await
                .send(Message::Binary(frame))
                .await
                .map_err(|e| SparkError::Transport(e.to_string()))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut sink = self.inner.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        })
    }
}

fn secret_from(headers: &HeaderMap) -> Option<Secret> {
    let value = headers.get(SECRET_HEADER)?.to_str().ok()?;
    Secret::from_hex(value).ok()
}

/// `GET /api/ws`
pub async fn upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Response {
    let Some(secret) = secret_from(&headers) else {
        return failure(StatusCode::BAD_REQUEST, msg::INVALID_SECRET);
    };
    if state.hub.by_secret(secret.hex()).is_some() {
        return failure(StatusCode::CONFLICT, msg::INVALID_SECRET);
    }
    let addr = peer.map(|ConnectInfo(addr)| addr);

    ws.max_message_size(MAX_INLINE_FRAME)
        .max_frame_size(MAX_INLINE_FRAME)
        .on_upgrade(move |socket| serve_agent(state, socket, secret, addr))
}

async fn serve_agent(state: Arc<AppState>, socket: WebSocket, secret: Secret, addr: Option<SocketAddr>) {
    let (sink, mut stream) = socket.split();
    let channel = Arc::new(SecureChannel::new(Arc::new(WsSink::new(sink)), secret));
    let conn = Arc::new(Connection {
        id: spark_core::new_token(),
        addr,
        channel: channel.clone(),
    });

    if let Err(e) = state.hub.insert(conn.clone()) {
        warn!(error = %e, "rejecting agent connection");
        channel.close().await;
        return;
    }
    info!(conn = %conn.id, peer = %conn.ip(), "agent connected");

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Binary(frame)) => match channel.open(&frame) {
                Ok(packet) => route_packet(&state, &conn, packet).await,
                Err(e) => warn!(conn = %conn.id, error = %e, "undecodable frame"),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn.id, error = %e, "agent socket error");
                break;
            }
        }
    }

    state.hub.remove(&conn.id);
    state.devices.remove(&conn.id).await;
    state.events.discard_owner(&conn.id);
    channel.close().await;
    info!(conn = %conn.id, "agent disconnected");
}

/// Route one decrypted packet from `conn`.
pub async fn route_packet(state: &AppState, conn: &Connection, packet: Packet) {
    if !packet.is_routable() {
        debug!(conn = %conn.id, "unroutable packet");
        return;
    }
    match packet.act.as_str() {
        act::REPORT | act::SET_DEVICE => {
            let reply = match packet.decode_data::<Device>() {
                Ok(mut device) => {
                    device.wan = conn.ip();
                    state
                        .devices
                        .upsert_from_report(&conn.id, device, &state.hub)
                        .await;
                    Packet::ok()
                }
                Err(e) => {
                    warn!(conn = %conn.id, error = %e, "malformed report");
                    Packet::fail(e.to_string())
                }
            };
            if let Err(e) = conn.channel.send_reply(reply, &packet).await {
                warn!(conn = %conn.id, error = %e, "failed to acknowledge report");
            }
        }
        _ if !packet.event.is_empty() => {
            let token = packet.event.clone();
            let act = packet.act.clone();
            if !state.events.dispatch(&token, Event::Packet(packet)) {
                debug!(conn = %conn.id, act = %act, token = %token, "reply without waiter");
            }
        }
        other => debug!(conn = %conn.id, act = %other, "unhandled act without event"),
    }
}

/// `POST /api/ws`: a frame too large for the duplex connection.
pub async fn side_channel(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let conn = headers
        .get(SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|hex| state.hub.by_secret(hex.trim()));
    let Some(conn) = conn else {
        return failure(StatusCode::UNAUTHORIZED, msg::INVALID_SECRET);
    };

    match conn.channel.open(&body) {
        Ok(packet) => {
            debug!(conn = %conn.id, act = %packet.act, len = body.len(), "side-channel packet");
            route_packet(&state, &conn, packet).await;
            envelope(StatusCode::OK, Packet::ok())
        }
        Err(e) => {
            warn!(conn = %conn.id, error = %e, "undecodable side-channel frame");
            failure(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}
