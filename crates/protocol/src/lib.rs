//! # termgate Protocol Library
//!
//! Wire definitions shared by the termgate gateway and its clients.
//!
//! ## Overview
//!
//! A browser tab opens one WebSocket to the gateway and exchanges JSON text
//! frames tagged by `type`:
//!
//! ```text
//! client                               gateway
//!   │ terminal-create {cols,rows,cwd}     │
//!   │────────────────────────────────────▶│ spawn shell
//!   │◀────────────────────────────────────│ terminal-created {terminalId,pid,...}
//!   │ terminal-data {input}               │
//!   │────────────────────────────────────▶│ write to PTY
//!   │◀────────────────────────────────────│ terminal-data {output}
//!   │ terminal-resize / terminal-destroy  │
//!   │────────────────────────────────────▶│
//!   │◀────────────────────────────────────│ terminal-exit / terminal-destroyed / error
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientMessage, Envelope, ErrorCode, ServerMessage};
//!
//! let message = ClientMessage::parse(
//!     r#"{"type":"terminal-create","data":{"cols":80,"rows":24,"cwd":"/tmp"}}"#,
//! )
//! .unwrap();
//! assert_eq!(message.message_type(), "terminal-create");
//!
//! let reply = Envelope::new(ServerMessage::error(ErrorCode::InvalidState, "not bound", None));
//! let frame = reply.to_json().unwrap();
//! assert!(frame.contains("\"timestamp\""));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: client and server message definitions
//! - [`text`]: streaming UTF-8 decoding for PTY output
//! - [`error`]: error types

pub mod error;
pub mod messages;
pub mod text;

pub use error::{ProtocolError, Result};
pub use messages::{
    now_millis, ClientMessage, CreateData, CreatedData, Envelope, ErrorCode, ErrorData, ExitData,
    InputData, OutputData, ResizeData, ServerMessage, CLIENT_MESSAGE_TYPES,
};
pub use text::Utf8Decoder;
