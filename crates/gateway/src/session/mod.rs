//! Session management module.
//!
//! This module provides PTY spawning, the session registry and the sweep that
//! reclaims sessions whose connection went away.

pub mod pty;
pub mod reclaim;
pub mod registry;

pub use pty::{ExitStatus, PtyEvent, PtyProcess, SessionError, SessionId, SpawnOptions};
pub use reclaim::{reclaim_stale, spawn_reclaim_task, ReclaimConfig};
pub use registry::{
    CreateRequest, RegistryOptions, SessionCatalog, SessionEvent, SessionInfo, SessionRegistry,
    SessionState,
};
