//! In-memory agent connections for router tests.

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{request, Request};
use axum::response::Response;
use axum::Router;
use spark_core::channel::BoxFuture;
use spark_core::{crypto, new_token, Device, FrameSink, Packet, Secret, SecureChannel, SparkResult};
use tokio::sync::mpsc;
use tower::ServiceExt;

use crate::hub::Connection;
use crate::server::AppState;
use crate::ws::route_packet;

/// Decrypts every frame the server writes and hands the packet to the test.
struct ForwardingSink {
    secret: Secret,
    commands: mpsc::UnboundedSender<Packet>,
}

impl FrameSink for ForwardingSink {
    fn send_frame(&self, frame: Vec<u8>) -> BoxFuture<'_, SparkResult<()>> {
        Box::pin(async move {
            let json = crypto::decrypt(&frame, &self.secret)?;
            let packet: Packet = serde_json::from_slice(&json)?;
            let _ = self.commands.send(packet);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Register a fake agent reporting as `device_id`; returns its connection id
/// and the stream of packets the server sends it.
pub async fn connect_agent(
    state: &Arc<AppState>,
    device_id: &str,
) -> (String, mpsc::UnboundedReceiver<Packet>) {
    let secret = Secret::generate();
    let (tx, rx) = mpsc::unbounded_channel();
    let sink = ForwardingSink {
        secret: secret.clone(),
        commands: tx,
    };
    let conn = Arc::new(Connection {
        id: new_token(),
        addr: None,
        channel: Arc::new(SecureChannel::new(Arc::new(sink), secret)),
    });
    state.hub.insert(conn.clone()).unwrap();

    let report = Device {
        id: device_id.to_string(),
        ..Device::default()
    };
    state
        .devices
        .upsert_from_report(&conn.id, report, &state.hub)
        .await;
    (conn.id.clone(), rx)
}

/// Deliver `packet` as if agent `conn_id` had sent it over its duplex connection.
pub async fn agent_sends(state: &Arc<AppState>, conn_id: &str, packet: Packet) {
    let conn = state.hub.get(conn_id).unwrap();
    route_packet(state, &conn, packet).await;
}

pub fn form_post(uri: &str) -> request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
}

pub async fn agent_put(
    app: &Router,
    uri: &str,
    headers: &[(&str, &str)],
    body: Vec<u8>,
) -> Response {
    let mut request = Request::builder()
        .method("PUT")
        .uri(uri)
        .header(CONTENT_LENGTH, body.len());
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    app.clone()
        .oneshot(request.body(Body::from(body)).unwrap())
        .await
        .unwrap()
}
