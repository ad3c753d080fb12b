//! Route server packets to the agent's services.

use std::sync::Arc;

use serde_json::Value;
use spark_core::{act, Command, DeviceAction, Packet, SparkError};
use tracing::{debug, warn};

use crate::connection::Agent;
use crate::files;

/// Whether the connection should keep serving.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Offline,
}

pub const UNSUPPORTED: &str = "${i18n|COMMON.OPERATION_NOT_SUPPORTED}";

async fn reply(agent: &Agent, reply: Packet, origin: &Packet) {
    if let Err(e) = agent.slot.send_reply(reply, origin).await {
        debug!(act = %origin.act, error = %e, "reply dropped");
    }
}

/// Handle one decrypted packet from the server.
///
/// Slow work (file transfers, directory walks) runs on its own task so the
/// read loop is never blocked by it.
pub async fn handle(agent: &Arc<Agent>, packet: Packet) -> Flow {
    if packet.act.is_empty() {
        // Acknowledgement of a report.
        if !packet.is_ok() {
            warn!(msg = %packet.msg, "server rejected report");
        }
        return Flow::Continue;
    }

    let command = match Command::from_packet(&packet) {
        Ok(command) => command,
        Err(e) => {
            warn!(act = %packet.act, error = %e, "unhandled packet");
            reply(agent, Packet::fail(e.to_string()), &packet).await;
            return Flow::Continue;
        }
    };

    match command {
        Command::TerminalInit(t) => {
            if let Err(e) = agent.terminals.init(&t.terminal, &packet).await {
                let quit = Packet::act(act::TERMINAL_QUIT).with_msg(e.to_string());
                reply(agent, quit, &packet).await;
            }
        }
        Command::TerminalInput(input) => match agent.terminals.input(&input, &packet).await {
            Ok(()) | Err(SparkError::SessionNotFound(_)) => {}
            Err(e) => reply(agent, Packet::fail(e.to_string()), &packet).await,
        },
        Command::TerminalResize(resize) => match agent.terminals.resize(&resize, &packet).await {
            Ok(()) | Err(SparkError::SessionNotFound(_)) => {}
            Err(e) => reply(agent, Packet::fail(e.to_string()), &packet).await,
        },
        Command::TerminalKill(t) => {
            let _ = agent.terminals.kill(&t.terminal, &packet).await;
        }
        Command::TerminalPing(t) => agent.terminals.ping(&t.terminal).await,
        Command::UploadFile(request) => {
            let agent = agent.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.files.upload(&request, &packet.event).await {
                    warn!(file = %request.file, error = %e, "upload failed");
                }
            });
        }
        Command::Screenshot => {
            let agent = agent.clone();
            tokio::spawn(async move {
                if let Err(e) = agent.files.screenshot(&packet.event).await {
                    warn!(error = %e, "screenshot reply failed");
                }
            });
        }
        Command::ListFiles(request) => {
            let agent = agent.clone();
            tokio::spawn(async move {
                let response = match files::list(&request.path).await {
                    Ok(entries) => match serde_json::to_value(entries) {
                        Ok(list) => Packet::ok().with_data("files", list),
                        Err(e) => Packet::fail(e.to_string()),
                    },
                    Err(e) => Packet::fail(e.to_string()),
                };
                reply(&agent, response, &packet).await;
            });
        }
        Command::RemoveFile(request) => {
            let agent = agent.clone();
            tokio::spawn(async move {
                let response = match files::remove(&request.file).await {
                    Ok(()) => Packet::ok(),
                    Err(e) => Packet::fail(e.to_string()),
                };
                reply(&agent, response, &packet).await;
            });
        }
        Command::Device(DeviceAction::Offline) => {
            reply(agent, Packet::ok(), &packet).await;
            return Flow::Offline;
        }
        Command::Device(action) => {
            debug!(action = action.as_str(), "power action not supported");
            let response = Packet::fail(UNSUPPORTED).with_data("action", Value::from(action.as_str()));
            reply(agent, response, &packet).await;
        }
    }
    Flow::Continue
}
