//! Wire message definitions for termgate.
//!
//! Every frame is a JSON object tagged by a kebab-case `type` field. Client
//! frames carry their payload under `data` and address a session through
//! `terminalId`. Server frames are wrapped in an [`Envelope`] that adds a
//! millisecond `timestamp`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Message types a client may send.
pub const CLIENT_MESSAGE_TYPES: &[&str] = &[
    "terminal-create",
    "terminal-data",
    "terminal-resize",
    "terminal-destroy",
];

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Timestamped wrapper for outbound messages.
///
/// The wrapped message is flattened, so the JSON shape is the message's own
/// fields plus `timestamp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<M> {
    /// The message itself.
    #[serde(flatten)]
    pub message: M,
    /// Milliseconds since the Unix epoch at which the message was produced.
    pub timestamp: u64,
}

impl<M> Envelope<M> {
    /// Wraps a message, stamping it with the current time.
    pub fn new(message: M) -> Self {
        Self {
            message,
            timestamp: now_millis(),
        }
    }
}

impl<M: Serialize> Envelope<M> {
    /// Serialize the envelope to a JSON text frame.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }
}

impl<M: for<'de> Deserialize<'de>> Envelope<M> {
    /// Parse an envelope from a JSON text frame.
    pub fn from_json(frame: &str) -> Result<Self> {
        Ok(serde_json::from_str(frame)?)
    }
}

// ============================================================================
// Client → server
// ============================================================================

/// Messages sent by the browser to the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Create the session bound to this connection.
    TerminalCreate {
        /// Requested geometry and working directory.
        data: CreateData,
    },
    /// Keyboard input for the bound session.
    TerminalData {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: InputData,
    },
    /// New terminal geometry.
    TerminalResize {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: ResizeData,
    },
    /// Tear the session down.
    TerminalDestroy {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
}

/// Payload of `terminal-create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateData {
    /// Requested terminal columns.
    pub cols: u16,
    /// Requested terminal rows.
    pub rows: u16,
    /// Working directory; the server default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Payload of client `terminal-data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputData {
    /// Bytes to write to the shell, as typed by the user.
    pub input: String,
}

/// Payload of `terminal-resize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeData {
    /// New terminal columns.
    pub cols: u16,
    /// New terminal rows.
    pub rows: u16,
}

impl ClientMessage {
    /// Parse and validate one inbound text frame.
    ///
    /// Distinguishes frames that are not JSON objects, frames without a
    /// `type`, unknown types and known types with bad fields, so callers can
    /// report a precise error.
    pub fn parse(frame: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let Some(object) = value.as_object() else {
            return Err(ProtocolError::Malformed(
                "expected a JSON object".to_string(),
            ));
        };

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        if !CLIENT_MESSAGE_TYPES.contains(&kind) {
            return Err(ProtocolError::UnknownType(kind.to_string()));
        }

        let message: ClientMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::InvalidMessage(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// The wire name of this message's type.
    pub fn message_type(&self) -> &'static str {
        match self {
            ClientMessage::TerminalCreate { .. } => "terminal-create",
            ClientMessage::TerminalData { .. } => "terminal-data",
            ClientMessage::TerminalResize { .. } => "terminal-resize",
            ClientMessage::TerminalDestroy { .. } => "terminal-destroy",
        }
    }

    /// The session this message addresses, if any.
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            ClientMessage::TerminalCreate { .. } => None,
            ClientMessage::TerminalData { terminal_id, .. }
            | ClientMessage::TerminalResize { terminal_id, .. }
            | ClientMessage::TerminalDestroy { terminal_id } => Some(terminal_id),
        }
    }

    fn validate(&self) -> Result<()> {
        let (cols, rows) = match self {
            ClientMessage::TerminalCreate { data } => (data.cols, data.rows),
            ClientMessage::TerminalResize { data, .. } => (data.cols, data.rows),
            _ => return Ok(()),
        };
        if cols == 0 || rows == 0 {
            return Err(ProtocolError::InvalidDimensions { cols, rows });
        }
        Ok(())
    }
}

// ============================================================================
// Server → client
// ============================================================================

/// Messages sent by the gateway to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The session was created and is bound to this connection.
    TerminalCreated {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: CreatedData,
    },
    /// Shell output.
    TerminalData {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: OutputData,
    },
    /// The session was torn down.
    TerminalDestroyed {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    /// The shell process exited.
    TerminalExit {
        #[serde(rename = "terminalId")]
        terminal_id: String,
        data: ExitData,
    },
    /// A request failed.
    Error {
        #[serde(
            rename = "terminalId",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        terminal_id: Option<String>,
        data: ErrorData,
    },
}

/// Payload of `terminal-created`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedData {
    /// Process ID of the shell.
    pub pid: u32,
    /// Terminal columns.
    pub cols: u16,
    /// Terminal rows.
    pub rows: u16,
    /// Resolved working directory.
    pub cwd: String,
}

/// Payload of server `terminal-data`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputData {
    /// Shell output, decoded as UTF-8.
    pub output: String,
}

/// Payload of `terminal-exit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitData {
    /// Exit code reported by the operating system.
    #[serde(rename = "exitCode")]
    pub exit_code: Option<i32>,
    /// Signal number, when the process was terminated by one.
    pub signal: Option<i32>,
}

/// Payload of `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorData {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The frame could not be parsed or had bad fields.
    InvalidMessage,
    /// The `type` field is not a known message type.
    UnknownType,
    /// The message is not valid in the connection's current state.
    InvalidState,
    /// The referenced terminal does not exist.
    NotFound,
    /// The shell could not be started.
    SpawnFailed,
    /// Input could not be delivered to the shell.
    WriteFailed,
    /// The terminal could not be resized.
    ResizeFailed,
    /// The gateway is at its session limit.
    CapacityExceeded,
    /// Server-side error.
    InternalError,
}

impl ServerMessage {
    /// Build an `error` frame.
    pub fn error(code: ErrorCode, message: impl Into<String>, terminal_id: Option<String>) -> Self {
        ServerMessage::Error {
            terminal_id,
            data: ErrorData {
                code,
                message: message.into(),
            },
        }
    }

    /// The wire name of this message's type.
    pub fn message_type(&self) -> &'static str {
        match self {
            ServerMessage::TerminalCreated { .. } => "terminal-created",
            ServerMessage::TerminalData { .. } => "terminal-data",
            ServerMessage::TerminalDestroyed { .. } => "terminal-destroyed",
            ServerMessage::TerminalExit { .. } => "terminal-exit",
            ServerMessage::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_create() {
        let frame = r#"{"type":"terminal-create","data":{"cols":80,"rows":24,"cwd":"/tmp"},"timestamp":1}"#;
        let message = ClientMessage::parse(frame).unwrap();
        assert_eq!(
            message,
            ClientMessage::TerminalCreate {
                data: CreateData {
                    cols: 80,
                    rows: 24,
                    cwd: Some("/tmp".to_string()),
                }
            }
        );
        assert_eq!(message.terminal_id(), None);
    }

    #[test]
    fn test_parse_create_without_cwd() {
        let frame = r#"{"type":"terminal-create","data":{"cols":100,"rows":30}}"#;
        match ClientMessage::parse(frame).unwrap() {
            ClientMessage::TerminalCreate { data } => assert!(data.cwd.is_none()),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_parse_input() {
        let frame = r#"{"type":"terminal-data","terminalId":"abc","data":{"input":"ls\n"}}"#;
        let message = ClientMessage::parse(frame).unwrap();
        assert_eq!(message.message_type(), "terminal-data");
        assert_eq!(message.terminal_id(), Some("abc"));
    }

    #[test]
    fn test_parse_destroy() {
        let frame = r#"{"type":"terminal-destroy","terminalId":"abc"}"#;
        assert_eq!(
            ClientMessage::parse(frame).unwrap(),
            ClientMessage::TerminalDestroy {
                terminal_id: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_parse_not_json() {
        let err = ClientMessage::parse("hello").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_parse_not_an_object() {
        let err = ClientMessage::parse("[1, 2, 3]").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_parse_missing_type() {
        let err = ClientMessage::parse(r#"{"data":{"cols":80}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));

        let err = ClientMessage::parse(r#"{"type":42}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn test_parse_unknown_type() {
        let err = ClientMessage::parse(r#"{"type":"terminal-attach","terminalId":"x"}"#)
            .unwrap_err();
        match err {
            ProtocolError::UnknownType(kind) => assert_eq!(kind, "terminal-attach"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_missing_fields() {
        let err = ClientMessage::parse(r#"{"type":"terminal-data","data":{"input":"x"}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));

        let err = ClientMessage::parse(r#"{"type":"terminal-create","data":{"cols":80}}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));

        let err = ClientMessage::parse(r#"{"type":"terminal-create"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_parse_zero_dimensions() {
        let err = ClientMessage::parse(
            r#"{"type":"terminal-resize","terminalId":"x","data":{"cols":0,"rows":10}}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::InvalidDimensions { cols: 0, rows: 10 }
        ));
    }

    #[test]
    fn test_parse_out_of_range_dimensions() {
        let err = ClientMessage::parse(
            r#"{"type":"terminal-create","data":{"cols":70000,"rows":10}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    }

    #[test]
    fn test_created_wire_shape() {
        let envelope = Envelope::new(ServerMessage::TerminalCreated {
            terminal_id: "abc".to_string(),
            data: CreatedData {
                pid: 4242,
                cols: 80,
                rows: 24,
                cwd: "/tmp".to_string(),
            },
        });
        let value: Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();

        assert_eq!(value["type"], "terminal-created");
        assert_eq!(value["terminalId"], "abc");
        assert_eq!(value["data"]["pid"], 4242);
        assert_eq!(value["data"]["cwd"], "/tmp");
        assert!(value["timestamp"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_exit_wire_shape() {
        let message = ServerMessage::TerminalExit {
            terminal_id: "abc".to_string(),
            data: ExitData {
                exit_code: Some(0),
                signal: None,
            },
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            value,
            json!({"type": "terminal-exit", "terminalId": "abc", "data": {"exitCode": 0, "signal": null}})
        );
    }

    #[test]
    fn test_error_without_terminal_id() {
        let message = ServerMessage::error(ErrorCode::UnknownType, "unknown message type: x", None);
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["data"]["code"], "unknown-type");
        assert_eq!(value["data"]["message"], "unknown message type: x");
        assert!(value.get("terminalId").is_none());
    }

    #[test]
    fn test_server_envelope_from_json() {
        let frame = r#"{"type":"terminal-destroyed","terminalId":"abc","timestamp":17}"#;
        let envelope = Envelope::<ServerMessage>::from_json(frame).unwrap();
        assert_eq!(envelope.timestamp, 17);
        assert_eq!(envelope.message.message_type(), "terminal-destroyed");
    }
}
