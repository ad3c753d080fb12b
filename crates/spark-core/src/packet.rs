//! The protocol envelope exchanged over every Spark transport.
//!
//! Only the envelope is untyped; callers decode `data` into a
//! [`Command`](crate::command::Command) or a typed reply right after routing.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SparkError, SparkResult};

/// Action names carried in [`Packet::act`].
pub mod act {
    pub const REPORT: &str = "report";
    pub const SET_DEVICE: &str = "setDevice";
    pub const OFFLINE: &str = "offline";
    pub const SCREENSHOT: &str = "screenshot";
    pub const UPLOAD_FILE: &str = "uploadFile";
    pub const LIST_FILES: &str = "listFiles";
    pub const REMOVE_FILE: &str = "removeFile";
    pub const TERMINAL_INIT: &str = "TERMINAL_INIT";
    pub const TERMINAL_INPUT: &str = "TERMINAL_INPUT";
    pub const TERMINAL_RESIZE: &str = "TERMINAL_RESIZE";
    pub const TERMINAL_KILL: &str = "TERMINAL_KILL";
    pub const TERMINAL_PING: &str = "TERMINAL_PING";
    pub const TERMINAL_OUTPUT: &str = "TERMINAL_OUTPUT";
    pub const TERMINAL_QUIT: &str = "TERMINAL_QUIT";
}

/// Unit of protocol exchange.
///
/// Every field is omitted from the wire form when empty, so a bare
/// acknowledgement serializes to `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// 0 on success, nonzero for an application error.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub code: i32,
    /// Action name; empty on pure replies.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub act: String,
    /// Human-readable status, may embed an `${i18n|key}` marker.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub msg: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
    /// Correlation token; empty when the packet takes no part in correlation.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub event: String,
}

fn is_zero(code: &i32) -> bool {
    *code == 0
}

impl Packet {
    /// A successful, empty reply.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failed reply with code 1.
    pub fn fail(msg: impl Into<String>) -> Self {
        Self {
            code: 1,
            msg: msg.into(),
            ..Self::default()
        }
    }

    /// A command or notification packet.
    pub fn act(act: impl Into<String>) -> Self {
        Self {
            act: act.into(),
            ..Self::default()
        }
    }

    pub fn with_event(mut self, event: impl Into<String>) -> Self {
        self.event = event.into();
        self
    }

    pub fn with_msg(mut self, msg: impl Into<String>) -> Self {
        self.msg = msg.into();
        self
    }

    pub fn with_data(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Whether the packet reports success.
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// Whether the packet can be routed at all.
    pub fn is_routable(&self) -> bool {
        !self.act.is_empty() || !self.event.is_empty()
    }

    /// Copy the correlation token of `original` onto this packet.
    pub fn echo_event(&mut self, original: &Packet) {
        if !original.event.is_empty() {
            self.event = original.event.clone();
        }
    }

    /// Decode the whole `data` map into a typed payload.
    pub fn decode_data<T: DeserializeOwned>(&self) -> SparkResult<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| SparkError::DataInvalid(format!("{}: {e}", self.act)))
    }

    /// Fetch a single string field from `data`.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_fields_are_omitted() {
        let json = serde_json::to_string(&Packet::ok()).unwrap();
        assert_eq!(json, "{}");

        let json = serde_json::to_string(&Packet::act(act::OFFLINE)).unwrap();
        assert_eq!(json, r#"{"act":"offline"}"#);
    }

    #[test]
    fn missing_fields_default() {
        let packet: Packet = serde_json::from_str(r#"{"event":"abc"}"#).unwrap();
        assert_eq!(packet.code, 0);
        assert!(packet.act.is_empty());
        assert_eq!(packet.event, "abc");
        assert!(packet.is_routable());

        let packet: Packet = serde_json::from_str(r#"{"code":1,"msg":"nope"}"#).unwrap();
        assert!(!packet.is_ok());
        assert!(!packet.is_routable());
    }

    #[test]
    fn echo_event_keeps_own_token_when_original_has_none() {
        let mut reply = Packet::ok().with_event("mine");
        reply.echo_event(&Packet::act(act::SCREENSHOT));
        assert_eq!(reply.event, "mine");

        reply.echo_event(&Packet::act(act::SCREENSHOT).with_event("theirs"));
        assert_eq!(reply.event, "theirs");
    }

    #[test]
    fn str_field_lookup() {
        let packet = Packet::act(act::LIST_FILES).with_data("path", "/tmp");
        assert_eq!(packet.str_field("path"), Some("/tmp"));
        assert_eq!(packet.str_field("missing"), None);
    }
}
