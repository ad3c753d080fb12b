//! Operator endpoints answered by a single correlated packet.

use std::sync::Arc;

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde::Deserialize;
use serde_json::Value;
use spark_core::{act, new_token, DeviceAction, Packet, SparkError, SparkResult};
use tracing::debug;

use crate::relay::TargetForm;
use crate::server::{envelope, failure, invalid_parameter, locate, msg, AppState, Event};

/// Send `command` to `conn` and wait for its reply packet.
async fn ask(state: &AppState, conn: &str, command: Packet) -> SparkResult<Packet> {
    let token = new_token();
    let pending = state.events.pending_owned(&token, Some(conn))?;
    state
        .hub
        .send(conn, &command.with_event(token.as_str()))
        .await?;
    match pending.wait(state.response_timeout).await? {
        Event::Packet(reply) => Ok(reply),
        Event::Upload(_) => Err(SparkError::DataInvalid(
            "unexpected upload for a packet request".into(),
        )),
    }
}

/// Map a correlated reply onto the HTTP envelope.
fn answer(result: SparkResult<Packet>, keep_data: bool) -> Response {
    match result {
        Ok(reply) if !reply.is_ok() => failure(StatusCode::INTERNAL_SERVER_ERROR, reply.msg),
        Ok(reply) => {
            let mut ok = Packet::ok();
            if keep_data {
                ok.data = reply.data;
            }
            envelope(StatusCode::OK, ok)
        }
        Err(SparkError::ResponseTimeout) => {
            failure(StatusCode::GATEWAY_TIMEOUT, msg::RESPONSE_TIMEOUT)
        }
        Err(SparkError::DeviceUnreachable(_)) | Err(SparkError::ChannelUnavailable) => {
            failure(StatusCode::BAD_GATEWAY, msg::DEVICE_NOT_EXISTS)
        }
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `POST /api/device/list`
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Response {
    let devices = state.devices.snapshot().await;
    let mut reply = Packet::ok();
    for (conn, device) in devices {
        match serde_json::to_value(device) {
            Ok(value) => {
                reply.data.insert(conn, value);
            }
            Err(e) => return failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }
    envelope(StatusCode::OK, reply)
}

/// `POST /api/device/:act`
pub async fn call_device(
    State(state): State<Arc<AppState>>,
    Path(action): Path<String>,
    form: Result<Form<TargetForm>, FormRejection>,
) -> Response {
    let Some(action) = DeviceAction::parse(&action) else {
        return invalid_parameter();
    };
    let Ok(Form(form)) = form else {
        return invalid_parameter();
    };
    let conn = match locate(&state, form.conn.as_deref(), form.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };

    match ask(&state, &conn, Packet::act(action.as_str())).await {
        Ok(reply) if !reply.is_ok() => failure(StatusCode::INTERNAL_SERVER_ERROR, reply.msg),
        Ok(_) => envelope(StatusCode::OK, Packet::ok()),
        // A device that stops answering has most likely acted on the command.
        Err(e) => {
            debug!(conn = %conn, action = action.as_str(), error = %e, "no reply to device action");
            envelope(StatusCode::OK, Packet::ok())
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PathForm {
    pub path: String,
    #[serde(default, alias = "uuid")]
    pub conn: Option<String>,
    #[serde(default)]
    pub device: Option<String>,
}

/// `POST /api/device/file/list`
pub async fn list_files(
    State(state): State<Arc<AppState>>,
    form: Result<Form<PathForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_parameter();
    };
    let conn = match locate(&state, form.conn.as_deref(), form.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };
    let command = Packet::act(act::LIST_FILES).with_data("path", Value::String(form.path));
    answer(ask(&state, &conn, command).await, true)
}

/// `POST /api/device/file/remove`
pub async fn remove_file(
    State(state): State<Arc<AppState>>,
    form: Result<Form<crate::relay::FileForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return invalid_parameter();
    };
    let conn = match locate(&state, form.conn.as_deref(), form.device.as_deref()).await {
        Ok(conn) => conn,
        Err(response) => return response,
    };
    let command = Packet::act(act::REMOVE_FILE).with_data("file", Value::String(form.file));
    answer(ask(&state, &conn, command).await, false)
}
