//! Session registry: the single owner of every live terminal session.
//!
//! The registry creates sessions (spawning their PTY process), routes input
//! and resize requests to them, delivers their output to exactly one
//! subscriber, and destroys them. The backing map is private; callers only
//! see [`SessionInfo`] snapshots and boolean/optional results for unknown ids.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use protocol::now_millis;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::pty::{ExitStatus, PtyEvent, PtyProcess, SessionError, SessionId, SpawnOptions};

/// Capacity of a subscriber's event channel.
const SUBSCRIBER_CAPACITY: usize = 256;

/// Events kept while a session has no subscriber yet.
const PENDING_LIMIT: usize = 64;

/// Lifecycle of a session as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Process spawned, not yet published.
    Starting = 0,
    /// Shell is running.
    Running = 1,
    /// Shell exited; the session still exists until destroyed.
    Exited = 2,
    /// Removed from the registry. Terminal.
    Destroyed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Starting,
            1 => SessionState::Running,
            2 => SessionState::Exited,
            _ => SessionState::Destroyed,
        }
    }
}

/// Events delivered to a session's subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Shell output.
    Output(Vec<u8>),
    /// The shell exited.
    Exit(ExitStatus),
}

/// Snapshot of a session's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the shell.
    pub pid: u32,
    /// Current terminal columns.
    pub cols: u16,
    /// Current terminal rows.
    pub rows: u16,
    /// Working directory the shell started in.
    pub cwd: PathBuf,
    /// Lifecycle state.
    pub state: SessionState,
    /// Creation time (Unix epoch milliseconds).
    pub created_at: u64,
    /// Last input or output (Unix epoch milliseconds).
    pub last_activity: u64,
    /// Whether a connection is currently subscribed.
    pub subscribed: bool,
}

impl SessionInfo {
    /// Time since the last input or output, relative to `now_ms`.
    pub fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_activity))
    }
}

/// Parameters of a create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Resolved working directory.
    pub cwd: PathBuf,
}

impl CreateRequest {
    /// Creates a request for a `cols`x`rows` terminal in `cwd`.
    pub fn new(cols: u16, rows: u16, cwd: impl Into<PathBuf>) -> Self {
        Self {
            cols,
            rows,
            cwd: cwd.into(),
        }
    }
}

/// How the registry starts shells.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    /// Shell binary for new sessions.
    pub shell: String,
    /// Arguments passed to the shell.
    pub shell_args: Vec<String>,
    /// Extra environment for every shell.
    pub env: Vec<(String, String)>,
    /// Maximum number of live sessions; 0 means unlimited.
    pub max_sessions: usize,
}

impl RegistryOptions {
    /// Options that start `shell` with no arguments and no session limit.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            shell_args: Vec::new(),
            env: Vec::new(),
            max_sessions: 0,
        }
    }

    /// Replace the shell arguments.
    pub fn with_shell_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.shell_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Limit the number of live sessions.
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }
}

/// Where a session's events currently go.
enum Subscription {
    /// Nobody subscribed yet; early output is buffered.
    Pending(VecDeque<SessionEvent>),
    /// Events go to this connection.
    Active(mpsc::Sender<SessionEvent>),
    /// The session was destroyed; events are dropped.
    Closed,
}

/// One live shell and its metadata.
struct Session {
    id: SessionId,
    process: PtyProcess,
    cwd: PathBuf,
    created_at: u64,
    last_activity: AtomicU64,
    state: AtomicU8,
    subscription: StdMutex<Subscription>,
}

impl Session {
    fn new(id: SessionId, process: PtyProcess, cwd: PathBuf) -> Self {
        let now = now_millis();
        Self {
            id,
            process,
            cwd,
            created_at: now,
            last_activity: AtomicU64::new(now),
            state: AtomicU8::new(SessionState::Starting as u8),
            subscription: StdMutex::new(Subscription::Pending(VecDeque::new())),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Marks the session destroyed. Returns false if it already was.
    fn mark_destroyed(&self) -> bool {
        let previous = self
            .state
            .swap(SessionState::Destroyed as u8, Ordering::SeqCst);
        *self.lock_subscription() = Subscription::Closed;
        previous != SessionState::Destroyed as u8
    }

    fn touch(&self) {
        self.last_activity.store(now_millis(), Ordering::SeqCst);
    }

    fn lock_subscription(&self) -> MutexGuard<'_, Subscription> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs a new subscriber, replacing any previous one.
    fn subscribe(&self) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut slot = self.lock_subscription();
        if matches!(*slot, Subscription::Closed) {
            return rx;
        }
        let previous = std::mem::replace(&mut *slot, Subscription::Active(tx.clone()));
        if let Subscription::Pending(buffered) = previous {
            for event in buffered {
                if tx.try_send(event).is_err() {
                    break;
                }
            }
        }
        rx
    }

    /// Hands one event to the current subscriber, in order.
    async fn deliver(&self, event: SessionEvent) {
        let sender = {
            let mut slot = self.lock_subscription();
            match &mut *slot {
                Subscription::Pending(buffered) => {
                    if buffered.len() == PENDING_LIMIT {
                        buffered.pop_front();
                    }
                    buffered.push_back(event);
                    return;
                }
                Subscription::Active(tx) => tx.clone(),
                Subscription::Closed => return,
            }
        };

        if sender.send(event).await.is_err() {
            tracing::trace!(session_id = %self.id, "Subscriber dropped");
        }
    }

    fn info(&self) -> SessionInfo {
        let (cols, rows) = self.process.size();
        SessionInfo {
            id: self.id.clone(),
            pid: self.process.pid(),
            cols,
            rows,
            cwd: self.cwd.clone(),
            state: self.state(),
            created_at: self.created_at,
            last_activity: self.last_activity.load(Ordering::SeqCst),
            subscribed: matches!(*self.lock_subscription(), Subscription::Active(_)),
        }
    }
}

/// Read-only view of which sessions are live.
///
/// This is the question a persistence-backed cleanup flow asks before
/// discarding stored terminal metadata.
pub trait SessionCatalog: Send + Sync {
    /// Ids of every session currently held.
    fn active_session_ids(&self) -> Vec<SessionId>;
}

/// Thread-safe session registry backed by DashMap.
pub struct SessionRegistry {
    /// Map of session ID to session.
    sessions: DashMap<SessionId, Arc<Session>>,
    /// Live sessions plus in-flight creations, for admission control.
    reserved: AtomicUsize,
    options: RegistryOptions,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new(options: RegistryOptions) -> Self {
        Self {
            sessions: DashMap::new(),
            reserved: AtomicUsize::new(0),
            options,
        }
    }

    /// Spawns a shell and registers a new session for it.
    pub async fn create_session(
        &self,
        request: CreateRequest,
    ) -> Result<SessionInfo, SessionError> {
        self.reserve_slot()?;

        let spawn_options = SpawnOptions {
            shell: self.options.shell.clone(),
            args: self.options.shell_args.clone(),
            cols: request.cols,
            rows: request.rows,
            cwd: request.cwd.clone(),
            env: self.options.env.clone(),
        };
        let spawned = tokio::task::spawn_blocking(move || PtyProcess::spawn(spawn_options))
            .await
            .map_err(|e| SessionError::SpawnFailed(format!("spawn task failed: {e}")))
            .and_then(|result| result);
        let (process, events) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.release_slot();
                tracing::warn!(cwd = %request.cwd.display(), error = %e, "Failed to create session");
                return Err(e);
            }
        };

        let id = Uuid::new_v4().to_string();
        let session = Arc::new(Session::new(id.clone(), process, request.cwd));
        session.transition(SessionState::Starting, SessionState::Running);

        match self.sessions.entry(id.clone()) {
            Entry::Occupied(_) => {
                self.release_slot();
                return Err(SessionError::SpawnFailed(
                    "session id collision".to_string(),
                ));
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::clone(&session));
            }
        }

        Self::spawn_event_pump(Arc::clone(&session), events);

        let info = session.info();
        tracing::info!(
            session_id = %id,
            pid = info.pid,
            cols = info.cols,
            rows = info.rows,
            cwd = %info.cwd.display(),
            "Created session"
        );

        Ok(info)
    }

    /// Returns a metadata snapshot of the session, if it exists.
    pub fn get_session(&self, id: &SessionId) -> Option<SessionInfo> {
        self.lookup(id).map(|session| session.info())
    }

    /// Writes input to a running session.
    ///
    /// Returns `Ok(false)` if the session does not exist or is not running.
    pub async fn write_input(&self, id: &SessionId, data: &[u8]) -> Result<bool, SessionError> {
        let Some(session) = self.lookup(id) else {
            return Ok(false);
        };
        if session.state() != SessionState::Running {
            return Ok(false);
        }

        match session.process.write(data).await {
            Ok(()) => {
                session.touch();
                Ok(true)
            }
            Err(SessionError::AlreadyTerminated) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Resizes a running session.
    ///
    /// Returns `Ok(false)` if the session does not exist or is not running.
    pub async fn resize_session(
        &self,
        id: &SessionId,
        cols: u16,
        rows: u16,
    ) -> Result<bool, SessionError> {
        let Some(session) = self.lookup(id) else {
            return Ok(false);
        };
        if session.state() != SessionState::Running {
            return Ok(false);
        }

        match session.process.resize(cols, rows).await {
            Ok(()) => Ok(true),
            Err(SessionError::AlreadyTerminated) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Kills the session's process and removes it.
    ///
    /// Returns whether a session was found. Calling it again for the same
    /// id returns false and never signals the process twice.
    pub fn destroy_session(&self, id: &SessionId) -> bool {
        let Some((_, session)) = self.sessions.remove(id) else {
            return false;
        };
        self.release_slot();

        if !session.mark_destroyed() {
            return false;
        }
        if let Err(e) = session.process.kill() {
            tracing::warn!(session_id = %id, error = %e, "Failed to kill session process");
        }

        tracing::info!(session_id = %id, pid = session.process.pid(), "Destroyed session");
        true
    }

    /// Routes the session's events to a new receiver.
    ///
    /// Any previous subscriber is replaced; its receiver closes. Output
    /// produced before the first subscription is replayed.
    pub fn subscribe(&self, id: &SessionId) -> Option<mpsc::Receiver<SessionEvent>> {
        let session = self.lookup(id)?;
        tracing::debug!(session_id = %id, "Subscribed to session");
        Some(session.subscribe())
    }

    /// Lists all sessions.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Checks if a session exists.
    pub fn exists(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns the number of sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Destroys every session. Returns how many were destroyed.
    pub fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let destroyed = ids
            .iter()
            .filter(|id| self.destroy_session(id))
            .count();
        if destroyed > 0 {
            tracing::info!(count = destroyed, "Destroyed all sessions");
        }
        destroyed
    }

    fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    fn reserve_slot(&self) -> Result<(), SessionError> {
        let max = self.options.max_sessions;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (max == 0 || n < max).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| SessionError::CapacityExceeded(max))
    }

    fn release_slot(&self) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Forwards PTY events to the subscriber until the process is gone.
    fn spawn_event_pump(session: Arc<Session>, mut events: mpsc::Receiver<PtyEvent>) {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                session.touch();
                let event = match event {
                    PtyEvent::Data(data) => {
                        tracing::trace!(session_id = %session.id, bytes = data.len(), "Output");
                        SessionEvent::Output(data)
                    }
                    PtyEvent::Exit(status) => {
                        session.transition(SessionState::Running, SessionState::Exited);
                        tracing::info!(
                            session_id = %session.id,
                            exit_code = ?status.exit_code,
                            signal = ?status.signal,
                            "Session process exited"
                        );
                        SessionEvent::Exit(status)
                    }
                };
                session.deliver(event).await;
            }
            tracing::debug!(session_id = %session.id, "Event pump finished");
        });
    }
}

impl SessionCatalog for SessionRegistry {
    fn active_session_ids(&self) -> Vec<SessionId> {
        self.sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
