//! Typed commands decoded from a [`Packet`] immediately after routing by `act`.

use serde::Deserialize;

use crate::error::{SparkError, SparkResult};
use crate::packet::{act, Packet};

/// Device-level actions an operator may trigger through `/device/:act`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Lock,
    Logoff,
    Hibernate,
    Suspend,
    Restart,
    Shutdown,
    Offline,
}

impl DeviceAction {
    pub const ALL: [DeviceAction; 7] = [
        DeviceAction::Lock,
        DeviceAction::Logoff,
        DeviceAction::Hibernate,
        DeviceAction::Suspend,
        DeviceAction::Restart,
        DeviceAction::Shutdown,
        DeviceAction::Offline,
    ];

    /// Parse an action name against the fixed allow-list.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAction::Lock => "lock",
            DeviceAction::Logoff => "logoff",
            DeviceAction::Hibernate => "hibernate",
            DeviceAction::Suspend => "suspend",
            DeviceAction::Restart => "restart",
            DeviceAction::Shutdown => "shutdown",
            DeviceAction::Offline => act::OFFLINE,
        }
    }
}

/// Terminal addressed by its session id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminalRef {
    pub terminal: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminalInput {
    pub terminal: String,
    /// Hex-encoded bytes for the pty.
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminalResize {
    pub terminal: String,
    // Browsers send these as JSON numbers that may carry a fraction.
    pub width: f64,
    pub height: f64,
}

/// Ask the device to push a file, optionally a byte range of it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadFile {
    pub file: String,
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListFiles {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RemoveFile {
    pub file: String,
}

/// Everything the server can ask an agent to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    TerminalInit(TerminalRef),
    TerminalInput(TerminalInput),
    TerminalResize(TerminalResize),
    TerminalKill(TerminalRef),
    TerminalPing(TerminalRef),
    UploadFile(UploadFile),
    ListFiles(ListFiles),
    RemoveFile(RemoveFile),
    Screenshot,
    Device(DeviceAction),
}

impl Command {
    /// Decode the packet's `act` and `data` into a typed command.
    pub fn from_packet(packet: &Packet) -> SparkResult<Self> {
        let command = match packet.act.as_str() {
            act::TERMINAL_INIT => Command::TerminalInit(packet.decode_data()?),
            act::TERMINAL_INPUT => Command::TerminalInput(packet.decode_data()?),
            act::TERMINAL_RESIZE => Command::TerminalResize(packet.decode_data()?),
            act::TERMINAL_KILL => Command::TerminalKill(packet.decode_data()?),
            act::TERMINAL_PING => Command::TerminalPing(packet.decode_data()?),
            act::UPLOAD_FILE => Command::UploadFile(packet.decode_data()?),
            act::LIST_FILES => Command::ListFiles(packet.decode_data()?),
            act::REMOVE_FILE => Command::RemoveFile(packet.decode_data()?),
            act::SCREENSHOT => Command::Screenshot,
            other => match DeviceAction::parse(other) {
                Some(action) => Command::Device(action),
                None => {
                    return Err(SparkError::DataInvalid(format!("unknown action: {other:?}")));
                }
            },
        };
        Ok(command)
    }
}
