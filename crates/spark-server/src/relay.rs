//! Streaming relay of device-produced payloads to operators.
//!
//! A pull request (`file/get`, `screenshot/get`) sends a correlated command to
//! the device and waits for the device's `PUT` carrying the same token in its
//! `Trigger` header. The `PUT` body is streamed straight into the pending
//! response; the device's request only completes once the operator side is
//! done with it.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::header::{
    ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, RANGE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use serde::Deserialize;
use spark_core::{act, new_token, Packet, SparkError};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::server::{envelope, failure, invalid_parameter, locate, msg, AppState, Event, Upload};

/// Single byte range from a `Range: bytes=start-[end]` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

/// Parse a `Range` header value.
///
/// `Ok(None)` means no usable range was requested; `Err` means the request
/// must be answered with 416.
pub fn parse_range(value: &str) -> Result<Option<ByteRange>, ()> {
    let value = value.trim();
    if value.len() <= "bytes=".len() {
        return Ok(None);
    }
    let ranges = value.strip_prefix("bytes=").ok_or(())?.trim();
    if ranges.contains(',') {
        return Err(());
    }
    let (start, end) = ranges.split_once('-').ok_or(())?;
    let start: u64 = start.trim().parse().map_err(|_| ())?;
    let end = match end.trim() {
        "" => None,
        end => {
            let end: u64 = end.parse().map_err(|_| ())?;
            if end < start {
                return Err(());
            }
            Some(end)
        }
    };
    Ok(Some(ByteRange { start, end }))
}

fn unsatisfiable(size: Option<u64>) -> Response {
    match size {
        Some(size) => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(CONTENT_RANGE, format!("bytes */{size}"))],
        )
            .into_response(),
        None => StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct FileForm {
    pub file: String,
    #[serde(default, alias = "uuid")]
    pub conn: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TargetForm {
    #[serde(default, alias = "uuid")]
    pub conn: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

/// Send `command` to `conn` and wait for the device's upload.
async fn request_upload(
    state: &AppState,
    conn: &str,
    command: Packet,
    failed: &str,
) -> Result<Upload, Response> {
    let token = new_token();
    let pending = state
        .events
        .pending_owned(&token, Some(conn))
        .map_err(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    if let Err(e) = state.hub.send(conn, &command.with_event(token.as_str())).await {
        warn!(conn = %conn, error = %e, "failed to send command");
        return Err(failure(StatusCode::BAD_GATEWAY, msg::DEVICE_NOT_EXISTS));
    }

    match pending.wait(state.response_timeout).await {
        Ok(Event::Upload(upload)) => Ok(upload),
        Ok(Event::Packet(reply)) if !reply.is_ok() => {
            Err(failure(StatusCode::INTERNAL_SERVER_ERROR, reply.msg))
        }
        Ok(Event::Packet(_)) => Err(failure(StatusCode::INTERNAL_SERVER_ERROR, failed)),
        Err(SparkError::ResponseTimeout) => {
            debug!(conn = %conn, token = %token, "device did not answer in time");
            Err(failure(StatusCode::GATEWAY_TIMEOUT, msg::RESPONSE_TIMEOUT))
        }
        Err(e) => {
            debug!(conn = %conn, error = %e, "device went away");
            Err(failure(StatusCode::BAD_GATEWAY, msg::DEVICE_NOT_EXISTS))
        }
    }
}

/// Body that streams `upload` and releases the device once dropped.
fn relay_body(upload_body: Body, done: oneshot::Sender<()>) -> Body {
    let stream = upload_body.into_data_stream().map(move |chunk| {
        // Held until the response body is dropped.
        let _ = &done;
        chunk
    });
    Body::from_stream(stream)
}

fn base_name(path: &str) -> String {
    let normalized = path.replace('\\', "/");
    normalized
        .rsplit('/')
        .find(|s| !s.is_empty())
        .unwrap_or("file")
        .to_string()
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 3);
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn stream_file(upload: Upload, range: Option<ByteRange>, path: &str) -> Response {
    let Upload {
        body,
        content_length,
        file_size,
        file_name,
        done,
    } = upload;

    let name = file_name
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| base_name(path));
    let mut builder = Response::builder()
        .header(ACCEPT_RANGES, "bytes")
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(
            CONTENT_DISPOSITION,
            format!("attachment; filename*=UTF-8''{}", percent_encode(&name)),
        );

    let status = match range {
        None => StatusCode::OK,
        Some(range) => {
            match file_size {
                Some(size) => {
                    if range.start >= size {
                        return unsatisfiable(Some(size));
                    }
                    let last = range.end.map_or(size - 1, |end| end.min(size - 1));
                    builder = builder.header(
                        CONTENT_RANGE,
                        format!("bytes {}-{}/{}", range.start, last, size),
                    );
                    StatusCode::PARTIAL_CONTENT
                }
                // The range cannot be described without a size.
                None => StatusCode::OK,
            }
        }
    };
    if let Some(len) = content_length {
        builder = builder.header(CONTENT_LENGTH, len);
    }

    builder
        .status(status)
        .body(relay_body(body, done))
        .unwrap_or_else(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// `POST /api/device/file/get`
pub async fn get_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    form: Result<Form<FileForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_parameter();
    };
    let range = match headers.get(RANGE).map(|v| v.to_str().map_err(|_| ())) {
        None => None,
        Some(Err(())) => return unsatisfiable(None),
        Some(Ok(value)) => match parse_range(value) {
            Ok(range) => range,
            Err(()) => return unsatisfiable(None),
        },
    };
    let conn = match locate(&state, form.conn.as_deref(), form.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    let mut command = Packet::act(act::UPLOAD_FILE).with_data("file", form.file.as_str());
    if let Some(range) = range {
        command = command.with_data("start", range.start);
        if let Some(end) = range.end {
            command = command.with_data("end", end);
        }
    }

    match request_upload(&state, &conn, command, msg::FILE_UPLOAD_FAILED).await {
        Ok(upload) => stream_file(upload, range, &form.file),
        Err(response) => response,
    }
}

/// `POST /api/device/screenshot/get`
pub async fn get_screenshot(
    State(state): State<Arc<AppState>>,
    form: Result<Form<TargetForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_parameter();
    };
    let conn = match locate(&state, form.conn.as_deref(), form.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    let upload = match request_upload(
        &state,
        &conn,
        Packet::act(act::SCREENSHOT),
        msg::SCREENSHOT_OBTAIN_FAILED,
    )
    .await
    {
        Ok(upload) => upload,
        Err(response) => return response,
    };

    let Upload {
        body,
        content_length,
        done,
        ..
    } = upload;
    let empty = || {
        debug!(conn = %conn, "device pushed an empty screenshot");
        failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("{}: {}", msg::SCREENSHOT_FAILED, msg::UNKNOWN_ERROR),
        )
    };
    let body = match content_length {
        Some(0) => return empty(),
        Some(_) => body,
        None => match non_empty(body).await {
            Some(body) => body,
            None => return empty(),
        },
    };

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "image/png");
    if let Some(len) = content_length {
        builder = builder.header(CONTENT_LENGTH, len);
    }
    builder
        .body(relay_body(body, done))
        .unwrap_or_else(|e| failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// `body` with its first data chunk already read, or `None` if it has none.
async fn non_empty(body: Body) -> Option<Body> {
    let mut stream = body.into_data_stream();
    loop {
        match stream.next().await {
            Some(Ok(chunk)) if chunk.is_empty() => continue,
            Some(Ok(chunk)) => {
                let first = futures_util::stream::once(async move { Ok(chunk) });
                return Some(Body::from_stream(first.chain(stream)));
            }
            Some(Err(_)) | None => return None,
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    header_str(headers, name).and_then(|v| v.parse().ok())
}

/// Hand a device upload to whoever waits on its `Trigger` token.
async fn accept_upload(state: &AppState, headers: &HeaderMap, body: Body, failed: &str) -> Response {
    let Some(trigger) = header_str(headers, "Trigger") else {
        return invalid_parameter();
    };

    if let Some(error) = header_str(headers, "Error") {
        let reply = Packet::fail(format!("{failed}: {error}")).with_event(trigger);
        if !state.events.dispatch(trigger, Event::Packet(reply)) {
            debug!(trigger, "upload failure without waiter");
        }
        return envelope(StatusCode::OK, Packet::ok());
    }

    let (done, finished) = oneshot::channel();
    let upload = Upload {
        body,
        content_length: header_u64(headers, CONTENT_LENGTH.as_str()),
        file_size: header_u64(headers, "FileSize"),
        file_name: header_str(headers, "FileName").map(str::to_string),
        done,
    };
    if !state.events.dispatch(trigger, Event::Upload(upload)) {
        debug!(trigger, "upload without waiter, discarded");
        return envelope(StatusCode::OK, Packet::ok());
    }

    // Resolves when the operator response finishes or is abandoned.
    let _ = finished.await;
    envelope(StatusCode::OK, Packet::ok())
}

/// `PUT /api/device/file/put`
pub async fn put_file(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    accept_upload(&state, &headers, body, msg::FILE_UPLOAD_FAILED).await
}

/// `PUT /api/device/screenshot/put`
pub async fn put_screenshot(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    accept_upload(&state, &headers, body, msg::SCREENSHOT_FAILED).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::router;
    use crate::testing::{agent_put, connect_agent, form_post};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn range_parsing() {
        assert_eq!(
            parse_range("bytes=100-199"),
            Ok(Some(ByteRange { start: 100, end: Some(199) }))
        );
        assert_eq!(
            parse_range("bytes=5000-"),
            Ok(Some(ByteRange { start: 5000, end: None }))
        );
        assert_eq!(parse_range(""), Ok(None));
        assert_eq!(parse_range("bytes="), Ok(None));
        assert!(parse_range("bytes=10-5").is_err());
        assert!(parse_range("bytes=0-1,5-6").is_err());
        assert!(parse_range("items=0-10").is_err());
        assert!(parse_range("bytes=-500").is_err());
    }

    #[test]
    fn file_names() {
        assert_eq!(base_name("/var/log/syslog"), "syslog");
        assert_eq!(base_name("C:\\Users\\me\\a b.txt"), "a b.txt");
        assert_eq!(percent_encode("a b.txt"), "a%20b.txt");
    }

    #[tokio::test]
    async fn partial_download_is_streamed_with_content_range() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                assert_eq!(command.act, act::UPLOAD_FILE);
                assert_eq!(command.data["start"], 100);
                assert_eq!(command.data["end"], 199);
                let response = agent_put(
                    &app,
                    "/api/device/file/put",
                    &[("Trigger", command.event.as_str()), ("FileSize", "1000")],
                    vec![7u8; 100],
                )
                .await;
                assert_eq!(response.status(), StatusCode::OK);
            })
        };

        let request = form_post("/api/device/file/get")
            .header(RANGE, "bytes=100-199")
            .body(Body::from("file=%2Ftmp%2Fdata.bin&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
        assert!(response.headers()[CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains("data.bin"));
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);

        device.await.unwrap();
        assert!(state.events.is_empty());
    }

    #[tokio::test]
    async fn range_past_end_is_unsatisfiable() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                assert_eq!(command.data["start"], 5000);
                let response = agent_put(
                    &app,
                    "/api/device/file/put",
                    &[("Trigger", command.event.as_str()), ("FileSize", "1000")],
                    Vec::new(),
                )
                .await;
                assert_eq!(response.status(), StatusCode::OK);
            })
        };

        let request = form_post("/api/device/file/get")
            .header(RANGE, "bytes=5000-")
            .body(Body::from("file=%2Ftmp%2Fdata.bin&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */1000");

        device.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_range_rejected_before_contacting_device() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let request = form_post("/api/device/file/get")
            .header(RANGE, "bytes=10-5")
            .body(Body::from("file=a&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert!(commands.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_times_out_without_dangling_entry() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, _commands) = connect_agent(&state, "dev-1").await;

        let request = form_post("/api/device/file/get")
            .body(Body::from("file=%2Fetc%2Fhosts&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Packet = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply.msg, msg::RESPONSE_TIMEOUT);
        assert!(state.events.is_empty());
    }

    #[tokio::test]
    async fn device_error_header_fails_request_and_acks_device() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                let response = agent_put(
                    &app,
                    "/api/device/file/put",
                    &[
                        ("Trigger", command.event.as_str()),
                        ("Error", "permission denied"),
                    ],
                    Vec::new(),
                )
                .await;
                assert_eq!(response.status(), StatusCode::OK);
            })
        };

        let request = form_post("/api/device/file/get")
            .body(Body::from("file=%2Froot%2Fsecret&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Packet = serde_json::from_slice(&body).unwrap();
        assert_eq!(reply.code, 1);
        assert_eq!(
            reply.msg,
            format!("{}: permission denied", msg::FILE_UPLOAD_FAILED)
        );

        device.await.unwrap();
    }

    #[tokio::test]
    async fn screenshot_is_relayed_as_png() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                assert_eq!(command.act, act::SCREENSHOT);
                agent_put(
                    &app,
                    "/api/device/screenshot/put",
                    &[("Trigger", command.event.as_str())],
                    b"\x89PNG fake".to_vec(),
                )
                .await;
            })
        };

        let request = form_post("/api/device/screenshot/get")
            .body(Body::from("device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "image/png");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"\x89PNG fake");

        device.await.unwrap();
    }

    async fn screenshot_failure(body: Body, content_length: Option<usize>) {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                let mut request = Request::builder()
                    .method("PUT")
                    .uri("/api/device/screenshot/put")
                    .header("Trigger", command.event.as_str());
                if let Some(len) = content_length {
                    request = request.header(CONTENT_LENGTH, len);
                }
                let response = app.oneshot(request.body(body).unwrap()).await.unwrap();
                assert_eq!(response.status(), StatusCode::OK);
            })
        };

        let request = form_post("/api/device/screenshot/get")
            .body(Body::from("device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let reply: Packet = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            reply.msg,
            format!("{}: {}", msg::SCREENSHOT_FAILED, msg::UNKNOWN_ERROR)
        );

        device.await.unwrap();
        assert!(state.events.is_empty());
    }

    #[tokio::test]
    async fn empty_screenshot_is_a_failure() {
        screenshot_failure(Body::empty(), Some(0)).await;
    }

    #[tokio::test]
    async fn empty_screenshot_of_unknown_length_is_a_failure() {
        let chunks: Vec<Result<Vec<u8>, std::io::Error>> = vec![Ok(Vec::new())];
        screenshot_failure(Body::from_stream(futures_util::stream::iter(chunks)), None).await;
    }

    #[tokio::test]
    async fn range_without_file_size_is_sent_whole() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let device = {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                let response = agent_put(
                    &app,
                    "/api/device/file/put",
                    &[("Trigger", command.event.as_str())],
                    vec![1u8; 100],
                )
                .await;
                assert_eq!(response.status(), StatusCode::OK);
            })
        };

        let request = form_post("/api/device/file/get")
            .header(RANGE, "bytes=100-199")
            .body(Body::from("file=%2Ftmp%2Fdata.bin&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(CONTENT_RANGE).is_none());
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);

        device.await.unwrap();
    }

    #[tokio::test]
    async fn abandoned_download_releases_device() {
        let state = AppState::new();
        let app = router(state.clone());
        let (_conn, mut commands) = connect_agent(&state, "dev-1").await;

        let (device_tx, device_rx) = oneshot::channel();
        {
            let app = app.clone();
            tokio::spawn(async move {
                let command = commands.recv().await.unwrap();
                let response = agent_put(
                    &app,
                    "/api/device/file/put",
                    &[("Trigger", command.event.as_str()), ("FileSize", "4096")],
                    vec![9u8; 4096],
                )
                .await;
                let _ = device_tx.send(response.status());
            });
        }

        let request = form_post("/api/device/file/get")
            .body(Body::from("file=%2Ftmp%2Fbig.bin&device=dev-1"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut stream = response.into_body().into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);

        let status = tokio::time::timeout(std::time::Duration::from_secs(5), device_rx)
            .await
            .expect("device upload never finished")
            .unwrap();
        assert_eq!(status, StatusCode::OK);
        assert!(state.events.is_empty());
    }

    #[tokio::test]
    async fn put_without_trigger_is_rejected() {
        let app = router(AppState::new());
        let response = agent_put(&app, "/api/device/file/put", &[], b"x".to_vec()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn put_for_unknown_token_is_discarded() {
        let app = router(AppState::new());
        let response = agent_put(
            &app,
            "/api/device/file/put",
            &[("Trigger", "nobody-waits")],
            b"late bytes".to_vec(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_device_is_bad_gateway() {
        let app = router(AppState::new());
        let request = form_post("/api/device/file/get")
            .body(Body::from("file=a&device=ghost"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
