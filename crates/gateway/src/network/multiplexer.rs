//! Per-connection state machine binding one WebSocket to one session.
//!
//! A [`ConnectionMultiplexer`] starts `Unbound`. A `terminal-create` spawns a
//! session and binds it; from then on input, resize and destroy requests must
//! name that session. Session output and exit notifications flow back through
//! [`ConnectionMultiplexer::next_event`]. When the transport goes away the
//! bound session is destroyed.

use std::future;
use std::sync::Arc;
use std::time::Duration;

use protocol::{
    ClientMessage, CreateData, CreatedData, Envelope, ErrorCode, ErrorData, ExitData, OutputData,
    ProtocolError, ServerMessage, Utf8Decoder,
};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::resolver::DirectoryResolver;
use crate::session::{
    CreateRequest, SessionError, SessionEvent, SessionId, SessionRegistry, SessionState,
};

/// Identifier assigned to each accepted connection.
pub type ConnectionId = u64;

/// Default delay between `terminal-exit` and the automatic destroy.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(1000);

/// Errors turned into `error` frames for the client.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    /// The frame could not be parsed.
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    /// A registry operation failed.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// The message is not allowed in the current binding state.
    #[error("{0}")]
    InvalidState(&'static str),

    /// The message named a terminal this connection does not own.
    #[error("terminal not found: {0}")]
    UnknownTerminal(String),
}

impl MuxError {
    /// Convert the error to a wire error payload.
    pub fn to_error_message(&self) -> ErrorData {
        let code = match self {
            MuxError::Protocol(e) => match e {
                ProtocolError::UnknownType(_) => ErrorCode::UnknownType,
                ProtocolError::Serialization(_) => ErrorCode::InternalError,
                ProtocolError::Malformed(_)
                | ProtocolError::MissingType
                | ProtocolError::InvalidMessage(_)
                | ProtocolError::InvalidDimensions { .. } => ErrorCode::InvalidMessage,
            },
            MuxError::Session(e) => match e {
                SessionError::NotFound(_) => ErrorCode::NotFound,
                SessionError::AlreadyTerminated => ErrorCode::InvalidState,
                SessionError::SpawnFailed(_) | SessionError::InvalidDirectory(_) => {
                    ErrorCode::SpawnFailed
                }
                SessionError::WriteFailed(_) => ErrorCode::WriteFailed,
                SessionError::ResizeFailed(_) => ErrorCode::ResizeFailed,
                SessionError::CapacityExceeded(_) => ErrorCode::CapacityExceeded,
                SessionError::KillFailed(_) | SessionError::Io(_) => ErrorCode::InternalError,
            },
            MuxError::InvalidState(_) => ErrorCode::InvalidState,
            MuxError::UnknownTerminal(_) => ErrorCode::NotFound,
        };

        ErrorData {
            code,
            message: self.to_string(),
        }
    }
}

/// Tunables for a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MuxOptions {
    /// How long an exited session stays bound before it is destroyed.
    pub exit_grace: Duration,
}

impl Default for MuxOptions {
    fn default() -> Self {
        Self {
            exit_grace: DEFAULT_EXIT_GRACE,
        }
    }
}

/// Something the connection task should feed back into [`ConnectionMultiplexer::handle_event`].
#[derive(Debug)]
pub enum MuxEvent {
    /// An event from the bound session; `None` once its channel closed.
    Session(Option<SessionEvent>),
    /// The exit grace period of the bound session ran out.
    ExitGraceElapsed,
}

struct Binding {
    terminal_id: SessionId,
    events: mpsc::Receiver<SessionEvent>,
    exit_deadline: Option<Instant>,
    decoder: Utf8Decoder,
}

enum BindingState {
    Unbound,
    Bound(Binding),
    Closed { terminal_id: SessionId },
}

/// Binds one transport connection to at most one session.
pub struct ConnectionMultiplexer {
    connection_id: ConnectionId,
    registry: Arc<SessionRegistry>,
    resolver: Arc<dyn DirectoryResolver>,
    options: MuxOptions,
    state: BindingState,
}

impl ConnectionMultiplexer {
    /// Creates an unbound multiplexer for one connection.
    pub fn new(
        connection_id: ConnectionId,
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn DirectoryResolver>,
        options: MuxOptions,
    ) -> Self {
        Self {
            connection_id,
            registry,
            resolver,
            options,
            state: BindingState::Unbound,
        }
    }

    /// The session bound to this connection, if any.
    pub fn terminal_id(&self) -> Option<&SessionId> {
        match &self.state {
            BindingState::Bound(binding) => Some(&binding.terminal_id),
            _ => None,
        }
    }

    /// Whether the bound session has been torn down.
    pub fn is_closed(&self) -> bool {
        matches!(self.state, BindingState::Closed { .. })
    }

    /// Handles one inbound text frame and returns the replies, in order.
    pub async fn handle_frame(&mut self, frame: &str) -> Vec<Envelope<ServerMessage>> {
        let message = match ClientMessage::parse(frame) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = self.connection_id, error = %e, "Rejected frame");
                return vec![Self::error_reply(&MuxError::Protocol(e), None)];
            }
        };

        debug!(
            connection_id = self.connection_id,
            message_type = message.message_type(),
            "Routing message"
        );

        let terminal_id = message.terminal_id().map(str::to_owned);
        match self.dispatch(message).await {
            Ok(replies) => replies.into_iter().map(Envelope::new).collect(),
            Err(e) => {
                debug!(connection_id = self.connection_id, error = %e, "Request failed");
                vec![Self::error_reply(&e, terminal_id)]
            }
        }
    }

    /// Handles a binary frame; it must carry UTF-8 JSON.
    pub async fn handle_binary(&mut self, bytes: &[u8]) -> Vec<Envelope<ServerMessage>> {
        match std::str::from_utf8(bytes) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(_) => {
                let e = ProtocolError::Malformed("binary frame is not UTF-8 text".to_string());
                vec![Self::error_reply(&MuxError::Protocol(e), None)]
            }
        }
    }

    /// Waits for the next session event or the exit grace deadline.
    ///
    /// Cancel-safe. Never resolves while no session is bound.
    pub async fn next_event(&mut self) -> MuxEvent {
        let BindingState::Bound(binding) = &mut self.state else {
            return future::pending().await;
        };
        let deadline = binding.exit_deadline;

        tokio::select! {
            event = binding.events.recv() => MuxEvent::Session(event),
            _ = grace_elapsed(deadline) => MuxEvent::ExitGraceElapsed,
        }
    }

    /// Turns a session event into replies for the client.
    pub fn handle_event(&mut self, event: MuxEvent) -> Vec<Envelope<ServerMessage>> {
        let BindingState::Bound(binding) = &mut self.state else {
            return Vec::new();
        };

        match event {
            MuxEvent::Session(Some(SessionEvent::Output(bytes))) => {
                let output = binding.decoder.decode(&bytes);
                if output.is_empty() {
                    return Vec::new();
                }
                vec![Envelope::new(ServerMessage::TerminalData {
                    terminal_id: binding.terminal_id.clone(),
                    data: OutputData { output },
                })]
            }
            MuxEvent::Session(Some(SessionEvent::Exit(status))) => {
                let mut replies = Vec::new();
                let rest = binding.decoder.finish();
                if !rest.is_empty() {
                    replies.push(Envelope::new(ServerMessage::TerminalData {
                        terminal_id: binding.terminal_id.clone(),
                        data: OutputData { output: rest },
                    }));
                }
                replies.push(Envelope::new(ServerMessage::TerminalExit {
                    terminal_id: binding.terminal_id.clone(),
                    data: ExitData {
                        exit_code: status.exit_code,
                        signal: status.signal,
                    },
                }));
                binding.exit_deadline = Some(Instant::now() + self.options.exit_grace);
                replies
            }
            MuxEvent::Session(None) => {
                // Destroyed elsewhere, e.g. by the reclaim sweep.
                let terminal_id = binding.terminal_id.clone();
                info!(
                    connection_id = self.connection_id,
                    session_id = %terminal_id,
                    "Bound session went away"
                );
                self.state = BindingState::Closed {
                    terminal_id: terminal_id.clone(),
                };
                vec![Envelope::new(ServerMessage::TerminalDestroyed { terminal_id })]
            }
            MuxEvent::ExitGraceElapsed => {
                let terminal_id = binding.terminal_id.clone();
                self.registry.destroy_session(&terminal_id);
                debug!(
                    connection_id = self.connection_id,
                    session_id = %terminal_id,
                    "Exit grace elapsed"
                );
                self.state = BindingState::Closed {
                    terminal_id: terminal_id.clone(),
                };
                vec![Envelope::new(ServerMessage::TerminalDestroyed { terminal_id })]
            }
        }
    }

    /// The transport closed: destroy the bound session.
    pub fn handle_close(&mut self) {
        if let Some(terminal_id) = self.release() {
            info!(
                connection_id = self.connection_id,
                session_id = %terminal_id,
                "Connection closed, session destroyed"
            );
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Vec<ServerMessage>, MuxError> {
        match message {
            ClientMessage::TerminalCreate { data } => self.create(data).await,
            ClientMessage::TerminalData { terminal_id, data } => {
                let id = self.bound_id(&terminal_id)?;
                if !self
                    .registry
                    .write_input(&id, data.input.as_bytes())
                    .await?
                {
                    return Err(self.not_running(id));
                }
                Ok(Vec::new())
            }
            ClientMessage::TerminalResize { terminal_id, data } => {
                let id = self.bound_id(&terminal_id)?;
                if !self
                    .registry
                    .resize_session(&id, data.cols, data.rows)
                    .await?
                {
                    return Err(self.not_running(id));
                }
                debug!(
                    connection_id = self.connection_id,
                    session_id = %id,
                    cols = data.cols,
                    rows = data.rows,
                    "Resized session"
                );
                Ok(Vec::new())
            }
            ClientMessage::TerminalDestroy { terminal_id } => {
                let id = self.bound_id(&terminal_id)?;
                let found = self.registry.destroy_session(&id);
                self.state = BindingState::Closed {
                    terminal_id: id.clone(),
                };
                if !found {
                    return Err(MuxError::UnknownTerminal(id));
                }
                Ok(vec![ServerMessage::TerminalDestroyed { terminal_id: id }])
            }
        }
    }

    async fn create(&mut self, data: CreateData) -> Result<Vec<ServerMessage>, MuxError> {
        match &self.state {
            BindingState::Unbound => {}
            BindingState::Bound(_) => {
                return Err(MuxError::InvalidState(
                    "a terminal is already bound to this connection",
                ))
            }
            BindingState::Closed { .. } => {
                return Err(MuxError::InvalidState(
                    "the terminal on this connection was destroyed",
                ))
            }
        }

        let cwd = self.resolver.resolve(data.cwd.as_deref())?;
        let info = self
            .registry
            .create_session(CreateRequest::new(data.cols, data.rows, cwd))
            .await?;
        let Some(events) = self.registry.subscribe(&info.id) else {
            return Err(MuxError::UnknownTerminal(info.id));
        };

        info!(
            connection_id = self.connection_id,
            session_id = %info.id,
            pid = info.pid,
            "Bound session to connection"
        );

        self.state = BindingState::Bound(Binding {
            terminal_id: info.id.clone(),
            events,
            exit_deadline: None,
            decoder: Utf8Decoder::new(),
        });

        Ok(vec![ServerMessage::TerminalCreated {
            terminal_id: info.id,
            data: CreatedData {
                pid: info.pid,
                cols: info.cols,
                rows: info.rows,
                cwd: info.cwd.display().to_string(),
            },
        }])
    }

    /// The bound session's id, provided `requested` names it.
    fn bound_id(&self, requested: &str) -> Result<SessionId, MuxError> {
        match &self.state {
            BindingState::Unbound => Err(MuxError::InvalidState(
                "no terminal has been created on this connection",
            )),
            BindingState::Closed { terminal_id } if terminal_id == requested => Err(
                MuxError::InvalidState("the terminal on this connection was destroyed"),
            ),
            BindingState::Closed { .. } => Err(MuxError::UnknownTerminal(requested.to_string())),
            BindingState::Bound(binding) if binding.terminal_id == requested => {
                Ok(binding.terminal_id.clone())
            }
            BindingState::Bound(_) => Err(MuxError::UnknownTerminal(requested.to_string())),
        }
    }

    fn not_running(&self, id: SessionId) -> MuxError {
        match self.registry.get_session(&id) {
            Some(info) if info.state == SessionState::Exited => {
                MuxError::Session(SessionError::AlreadyTerminated)
            }
            _ => MuxError::UnknownTerminal(id),
        }
    }

    /// Destroys the bound session, if any, and returns its id.
    fn release(&mut self) -> Option<SessionId> {
        let BindingState::Bound(binding) = &self.state else {
            return None;
        };
        let terminal_id = binding.terminal_id.clone();
        self.registry.destroy_session(&terminal_id);
        self.state = BindingState::Closed {
            terminal_id: terminal_id.clone(),
        };
        Some(terminal_id)
    }

    fn error_reply(error: &MuxError, terminal_id: Option<String>) -> Envelope<ServerMessage> {
        let ErrorData { code, message } = error.to_error_message();
        Envelope::new(ServerMessage::error(code, message, terminal_id))
    }
}

impl Drop for ConnectionMultiplexer {
    fn drop(&mut self) {
        if let Some(terminal_id) = self.release() {
            warn!(
                connection_id = self.connection_id,
                session_id = %terminal_id,
                "Multiplexer dropped while bound, session destroyed"
            );
        }
    }
}

async fn grace_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
