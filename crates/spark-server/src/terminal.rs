//! Operator terminal bridge.
//!
//! An operator websocket is paired with one terminal session on a device. The
//! operator encrypts its frames with a secret of its own choosing; the bridge
//! re-addresses them to the device and relays `TERMINAL_OUTPUT` and
//! `TERMINAL_QUIT` back through a persistent correlation entry keyed by the
//! terminal id.

use std::sync::Arc;

use axum::extract::rejection::QueryRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use spark_core::{act, new_token, Callback, Packet, Secret, SecureChannel, MAX_INLINE_FRAME};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::server::{invalid_parameter, locate, msg, AppState, Event};
use crate::ws::WsSink;

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    #[serde(default, alias = "uuid")]
    pub conn: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
    pub secret: String,
}

/// `GET /api/device/terminal`
pub async fn bridge(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    query: Result<Query<TerminalQuery>, QueryRejection>,
) -> Response {
    let Ok(Query(query)) = query else {
        return invalid_parameter();
    };
    let Ok(secret) = Secret::from_hex(&query.secret) else {
        return invalid_parameter();
    };
    let conn = match locate(&state, query.conn.as_deref(), query.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    ws.max_message_size(MAX_INLINE_FRAME)
        .on_upgrade(move |socket| run_bridge(state, socket, conn, secret))
}

/// Re-address an operator packet to the device terminal, dropping anything
/// an operator may not send.
fn to_device(terminal: &str, mut packet: Packet) -> Option<Packet> {
    match packet.act.as_str() {
        act::TERMINAL_INPUT | act::TERMINAL_RESIZE | act::TERMINAL_PING | act::TERMINAL_KILL => {
            packet
                .data
                .insert("terminal".into(), Value::String(terminal.to_string()));
            packet.event = terminal.to_string();
            packet.code = 0;
            packet.msg.clear();
            Some(packet)
        }
        _ => None,
    }
}

fn terminal_packet(act: &str, terminal: &str) -> Packet {
    Packet::act(act)
        .with_data("terminal", terminal)
        .with_event(terminal)
}

async fn run_bridge(state: Arc<AppState>, socket: WebSocket, conn: String, secret: Secret) {
    let (sink, mut stream) = socket.split();
    let operator = SecureChannel::new(Arc::new(WsSink::new(sink)), secret);
    let terminal = new_token();

    let (tx, mut from_device) = mpsc::unbounded_channel::<Packet>();
    let registered = state.events.register_owned(
        &terminal,
        Some(&conn),
        Callback::persistent(move |event| {
            if let Event::Packet(packet) = event {
                let _ = tx.send(packet);
            }
        }),
    );
    if let Err(e) = registered {
        warn!(error = %e, "cannot register terminal");
        operator.close().await;
        return;
    }

    if let Err(e) = state
        .hub
        .send(&conn, &terminal_packet(act::TERMINAL_INIT, &terminal))
        .await
    {
        warn!(conn = %conn, error = %e, "cannot open terminal on device");
        state.events.unregister(&terminal);
        let _ = operator
            .send_packet(&Packet::act(act::TERMINAL_QUIT).with_msg(msg::DEVICE_NOT_EXISTS))
            .await;
        operator.close().await;
        return;
    }
    info!(conn = %conn, terminal = %terminal, "terminal bridge opened");

    let mut operator_left = false;
    loop {
        tokio::select! {
            packet = from_device.recv() => match packet {
                Some(packet) => {
                    let quit = packet.act == act::TERMINAL_QUIT;
                    if let Err(e) = operator.send_packet(&packet).await {
                        debug!(terminal = %terminal, error = %e, "operator unreachable");
                        operator_left = true;
                        break;
                    }
                    if quit {
                        break;
                    }
                }
                // The device connection closed and took the entry with it.
                None => {
                    let notice = Packet::act(act::TERMINAL_QUIT).with_msg(msg::SESSION_CLOSED);
                    let _ = operator.send_packet(&notice).await;
                    break;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Binary(frame))) => match operator.open(&frame) {
                    Ok(packet) => {
                        if let Some(packet) = to_device(&terminal, packet) {
                            if let Err(e) = state.hub.send(&conn, &packet).await {
                                debug!(terminal = %terminal, error = %e, "device unreachable");
                            }
                        }
                    }
                    Err(e) => warn!(terminal = %terminal, error = %e, "undecodable operator frame"),
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    operator_left = true;
                    break;
                }
                Some(Ok(_)) => {}
            },
        }
    }

    state.events.unregister(&terminal);
    if operator_left {
        let _ = state
            .hub
            .send(&conn, &terminal_packet(act::TERMINAL_KILL, &terminal))
            .await;
    }
    operator.close().await;
    info!(conn = %conn, terminal = %terminal, "terminal bridge closed");
}
