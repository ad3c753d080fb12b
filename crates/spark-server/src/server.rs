//! Shared server state, the `/api` router and the listener loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::DefaultBodyLimit;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use spark_core::{EventRegistry, Packet, SparkResult, RESPONSE_TIMEOUT};
use tokio::sync::oneshot;
use tracing::info;

use crate::config::ServerConfig;
use crate::device::DeviceRegistry;
use crate::hub::Hub;
use crate::{handlers, relay, terminal, ws};

/// Something delivered to a correlation waiter.
pub enum Event {
    /// A packet that arrived over a duplex connection or the side channel.
    Packet(Packet),
    /// A device's streamed upload answering a pull request.
    Upload(Upload),
}

/// Body of a device `PUT`, handed to the waiting requester.
pub struct Upload {
    pub body: Body,
    pub content_length: Option<u64>,
    /// Full size of the file the range was cut from.
    pub file_size: Option<u64>,
    pub file_name: Option<String>,
    /// Dropped once the requester is done with the body.
    pub done: oneshot::Sender<()>,
}

pub struct AppState {
    pub hub: Hub,
    pub devices: DeviceRegistry,
    pub events: EventRegistry<Event>,
    /// Wait for the first reply to a correlated request.
    pub response_timeout: Duration,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            hub: Hub::new(),
            devices: DeviceRegistry::new(),
            events: EventRegistry::new(),
            response_timeout: RESPONSE_TIMEOUT,
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connection serving the request: explicit `conn`, else by device identity.
    pub async fn resolve(&self, conn: Option<&str>, device: Option<&str>) -> Option<String> {
        if let Some(conn) = conn.filter(|c| !c.is_empty()) {
            return self.hub.contains(conn).then(|| conn.to_string());
        }
        let device = device.filter(|d| !d.is_empty())?;
        let conn = self.devices.resolve_by_identity(device).await?;
        self.hub.contains(&conn).then_some(conn)
    }
}

/// Localizable messages returned to operators.
pub mod msg {
    pub const INVALID_PARAMETER: &str = "${i18n|invalidParameter}";
    pub const INVALID_SECRET: &str = "${i18n|invalidSecret}";
    pub const DEVICE_NOT_EXISTS: &str = "${i18n|deviceNotExists}";
    pub const RESPONSE_TIMEOUT: &str = "${i18n|responseTimeout}";
    pub const FILE_UPLOAD_FAILED: &str = "${i18n|fileUploadFailed}";
    pub const SCREENSHOT_FAILED: &str = "${i18n|screenshotFailed}";
    pub const SCREENSHOT_OBTAIN_FAILED: &str = "${i18n|screenshotObtainFailed}";
    pub const UNKNOWN_ERROR: &str = "${i18n|unknownError}";
    pub const SESSION_CLOSED: &str = "${i18n|TERMINAL.SESSION_CLOSED}";
}

/// JSON `{code, msg, data}` envelope with an HTTP status.
pub fn envelope(status: StatusCode, packet: Packet) -> Response {
    (status, Json(packet)).into_response()
}

pub fn failure(status: StatusCode, msg: impl Into<String>) -> Response {
    envelope(status, Packet::fail(msg))
}

pub fn invalid_parameter() -> Response {
    let mut packet = Packet::fail(msg::INVALID_PARAMETER);
    packet.code = -1;
    envelope(StatusCode::BAD_REQUEST, packet)
}

/// Resolve the target connection of an operator request, or the error response.
pub async fn locate(
    state: &AppState,
    conn: Option<&str>,
    device: Option<&str>,
) -> Result<String, Response> {
    let conn = conn.filter(|c| !c.is_empty());
    let device = device.filter(|d| !d.is_empty());
    if conn.is_none() && device.is_none() {
        return Err(invalid_parameter());
    }
    state
        .resolve(conn, device)
        .await
        .ok_or_else(|| failure(StatusCode::BAD_GATEWAY, msg::DEVICE_NOT_EXISTS))
}

pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route(
            "/ws",
            get(ws::upgrade).post(ws::side_channel).layer(DefaultBodyLimit::disable()),
        )
        .route("/device/list", post(handlers::list_devices))
        .route("/device/terminal", get(terminal::bridge))
        .route("/device/file/get", post(relay::get_file))
        .route(
            "/device/file/put",
            put(relay::put_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/device/file/list", post(handlers::list_files))
        .route("/device/file/remove", post(handlers::remove_file))
        .route("/device/screenshot/get", post(relay::get_screenshot))
        .route(
            "/device/screenshot/put",
            put(relay::put_screenshot).layer(DefaultBodyLimit::disable()),
        )
        .route("/device/:act", post(handlers::call_device));

    Router::new().nest("/api", api).with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn run(
    config: ServerConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> SparkResult<()> {
    let state = AppState::new();
    let app = router(state);

    let addr = format!("{}:{}", config.listen, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}
