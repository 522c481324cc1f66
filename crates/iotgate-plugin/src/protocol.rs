//! Wire Protocol
//!
//! Gateway and plugin exchange one JSON object per line over the plugin's
//! stdin/stdout. Every message carries a `type` tag:
//!
//! | Direction        | `type`     | Purpose                              |
//! |------------------|------------|--------------------------------------|
//! | plugin → gateway | `ready`    | Handshake, must be sent first         |
//! | gateway → plugin | `request`  | Run one command                      |
//! | plugin → gateway | `response` | Answer to the request with that `id` |
//! | plugin → gateway | `log`      | Forwarded into the gateway's logs    |
//! | gateway → plugin | `stop`     | Shut down cleanly                    |

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Messages exchanged between the gateway and a plugin process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PluginMessage {
    Ready,
    Request {
        id: u64,
        /// Name the command is registered under in the gateway
        command: String,
        /// Manifest entry type that implements the command
        entry: String,
        #[serde(default)]
        data: Map<String, Value>,
    },
    Response {
        id: u64,
        reply: Reply,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Stop,
}

impl PluginMessage {
    /// Encode as one line, including the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line.trim())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyStatus {
    Success,
    Error,
}

/// A command's answer: `{"status", "message", ...extra}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    pub message: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reply {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Success,
            message: message.into(),
            extra: Map::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ReplyStatus::Error,
            message: message.into(),
            extra: Map::new(),
        }
    }

    /// Add an extra top-level field
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let line = PluginMessage::from_line(
            r#"{"type":"request","id":7,"command":"Set Temperature","entry":"SetTemperatureCommand","data":{"celsius":21}}"#,
        )
        .unwrap();

        let PluginMessage::Request { id, entry, data, .. } = line else {
            panic!("expected a request");
        };
        assert_eq!(id, 7);
        assert_eq!(entry, "SetTemperatureCommand");
        assert_eq!(data["celsius"], 21);
    }

    #[test]
    fn test_response_flattens_reply_extras() {
        let message = PluginMessage::Response {
            id: 1,
            reply: Reply::success("done").with("celsius", 21),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "response",
                "id": 1,
                "reply": {"status": "success", "message": "done", "celsius": 21}
            })
        );
    }

    #[test]
    fn test_lines_end_with_newline() {
        assert_eq!(PluginMessage::Ready.to_line().unwrap(), "{\"type\":\"ready\"}\n");
        assert_eq!(
            PluginMessage::from_line("{\"type\":\"stop\"}\r\n").unwrap(),
            PluginMessage::Stop
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(PluginMessage::from_line(r#"{"type":"emit"}"#).is_err());
    }
}
