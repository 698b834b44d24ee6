//! # termgate Gateway Library
//!
//! This crate provides the gateway (server) side of termgate: it serves
//! interactive shell sessions to browser terminals over WebSocket.
//!
//! ## Overview
//!
//! Every WebSocket connection may create one shell session. The gateway:
//!
//! - **PTY Processes**: spawns the shell inside a pseudo-terminal and streams its output
//! - **Session Registry**: owns every live session and routes input and resizes to it
//! - **Connection Multiplexer**: binds one connection to one session
//! - **Reclamation**: destroys sessions left idle past a threshold
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                   Gateway Orchestrator                     │
//! ├────────────────────────────────────────────────────────────┤
//! │  ┌──────────────────────┐      ┌───────────────────────┐   │
//! │  │  Transport Listener  │      │   Reclaim Sweep       │   │
//! │  └──────────┬───────────┘      └───────────┬───────────┘   │
//! │             │ one task per connection      │               │
//! │  ┌──────────▼───────────┐                  │               │
//! │  │Connection Multiplexer│                  │               │
//! │  └──────────┬───────────┘                  │               │
//! │  ┌──────────▼──────────────────────────────▼────────────┐  │
//! │  │                  Session Registry                    │  │
//! │  └──────────────────────────┬───────────────────────────┘  │
//! │                   ┌─────────▼─────────┐                    │
//! │                   │    PtyProcess     │                    │
//! │                   └───────────────────┘                    │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use gateway::{Config, GatewayOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = GatewayOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serving until shutdown...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: PTY processes, the session registry and reclamation
//! - [`network`]: WebSocket listener and per-connection multiplexer
//! - [`resolver`]: Working directory resolution
//! - [`orchestrator`]: Main gateway coordinator

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod resolver;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export session types for convenience
pub use session::{
    CreateRequest, SessionCatalog, SessionError, SessionEvent, SessionId, SessionInfo,
    SessionRegistry, SessionState,
};

// Re-export network types for convenience
pub use network::{ConnectionMultiplexer, MuxError, MuxOptions, TransportListener};

// Re-export resolver types for convenience
pub use resolver::{DefaultDirectoryResolver, DirectoryResolver};

// Re-export orchestrator types for convenience
pub use orchestrator::{GatewayOrchestrator, OrchestratorEvent, OrchestratorState};
