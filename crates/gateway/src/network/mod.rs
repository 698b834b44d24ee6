//! Network module for browser connections.
//!
//! This module provides:
//! - the WebSocket listener that accepts clients
//! - the per-connection multiplexer that binds a client to one session

pub mod listener;
pub mod multiplexer;

pub use listener::TransportListener;
pub use multiplexer::{
    ConnectionId, ConnectionMultiplexer, MuxError, MuxEvent, MuxOptions, DEFAULT_EXIT_GRACE,
};
