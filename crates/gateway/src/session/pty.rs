//! PTY process wrapper.
//!
//! A [`PtyProcess`] owns exactly one shell process attached to a
//! pseudo-terminal. Output is read on a dedicated thread and pushed as
//! [`PtyEvent::Data`]; a second thread waits for the child and emits a single
//! [`PtyEvent::Exit`]. Both the natural-exit path and [`PtyProcess::kill`] go
//! through the same [`ExitGate`], so exit is reported exactly once.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("terminal not found: {0}")]
    NotFound(SessionId),

    /// The shell process has already exited.
    #[error("terminal process has already exited")]
    AlreadyTerminated,

    /// Failed to spawn the shell.
    #[error("failed to start shell: {0}")]
    SpawnFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to terminal: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// Failed to kill the process.
    #[error("failed to kill terminal process: {0}")]
    KillFailed(String),

    /// The registry is at its configured session limit.
    #[error("terminal limit reached ({0} sessions)")]
    CapacityExceeded(usize),

    /// The requested working directory cannot be used.
    #[error("invalid working directory: {0}")]
    InvalidDirectory(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the event channel between the PTY threads and the consumer.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the waiter lets the reader drain buffered output before
/// reporting exit.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// How long a shell gets to honor SIGHUP before it is killed outright.
const KILL_GRACE: Duration = Duration::from_millis(250);

/// Poll interval while waiting out [`KILL_GRACE`].
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Everything needed to start a shell.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Shell binary.
    pub shell: String,
    /// Arguments passed to the shell.
    pub args: Vec<String>,
    /// Terminal width in columns.
    pub cols: u16,
    /// Terminal height in rows.
    pub rows: u16,
    /// Working directory; must exist.
    pub cwd: PathBuf,
    /// Additional environment variables.
    pub env: Vec<(String, String)>,
}

impl SpawnOptions {
    /// Options for an interactive `shell` of the given size in `cwd`.
    pub fn new(shell: impl Into<String>, cols: u16, rows: u16, cwd: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
            args: Vec::new(),
            cols,
            rows,
            cwd: cwd.into(),
            env: Vec::new(),
        }
    }

    /// Replace the shell arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// How the shell process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    /// Exit code, when the platform reported one.
    pub exit_code: Option<i32>,
    /// Signal number, when termination followed [`PtyProcess::kill`].
    pub signal: Option<i32>,
}

/// Events produced by a PTY process, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    /// A chunk of shell output.
    Data(Vec<u8>),
    /// The process terminated. Sent exactly once, after all output.
    Exit(ExitStatus),
}

/// Lifecycle of the wrapped OS process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessState {
    /// PTY opened, child not yet running.
    NotStarted = 0,
    /// Child is alive.
    Running = 1,
    /// Child terminated and exit has been reported.
    Exited = 2,
}

impl ProcessState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ProcessState::NotStarted,
            1 => ProcessState::Running,
            _ => ProcessState::Exited,
        }
    }
}

/// Shared termination state between the process handle and its waiter.
#[derive(Debug)]
struct ExitGate {
    state: AtomicU8,
    kill_requested: AtomicBool,
    /// Set by the waiter as soon as the child has been reaped.
    reaped: AtomicBool,
    /// Set when the hangup was ignored and SIGKILL followed.
    forced: AtomicBool,
}

impl ExitGate {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(ProcessState::NotStarted as u8),
            kill_requested: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
            forced: AtomicBool::new(false),
        }
    }

    fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            ProcessState::NotStarted as u8,
            ProcessState::Running as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Moves to `Exited`. Returns true only for the first caller.
    fn close(&self) -> bool {
        self.state.swap(ProcessState::Exited as u8, Ordering::SeqCst) != ProcessState::Exited as u8
    }

    /// Marks a kill as requested. Returns true only for the first caller.
    fn request_kill(&self) -> bool {
        !self.kill_requested.swap(true, Ordering::SeqCst)
    }

    fn mark_reaped(&self) {
        self.reaped.store(true, Ordering::SeqCst);
    }

    fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }

    fn termination_signal(&self, success: bool) -> Option<i32> {
        if success || !self.kill_requested.load(Ordering::SeqCst) {
            return None;
        }
        if self.forced.load(Ordering::SeqCst) {
            return force_kill_signal();
        }
        hangup_signal()
    }
}

/// portable-pty's killer delivers SIGHUP.
#[cfg(unix)]
fn hangup_signal() -> Option<i32> {
    Some(nix::sys::signal::Signal::SIGHUP as i32)
}

#[cfg(not(unix))]
fn hangup_signal() -> Option<i32> {
    None
}

#[cfg(unix)]
fn force_kill_signal() -> Option<i32> {
    Some(nix::sys::signal::Signal::SIGKILL as i32)
}

#[cfg(not(unix))]
fn force_kill_signal() -> Option<i32> {
    None
}

/// Sends SIGKILL to the shell and its process group unless the waiter
/// reaps it within [`KILL_GRACE`].
#[cfg(unix)]
fn escalate_after_grace(pid: u32, gate: Arc<ExitGate>) {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }

    let deadline = std::time::Instant::now() + KILL_GRACE;
    while std::time::Instant::now() < deadline {
        if gate.is_reaped() {
            return;
        }
        std::thread::sleep(KILL_POLL_INTERVAL);
    }
    if gate.is_reaped() {
        return;
    }

    gate.forced.store(true, Ordering::SeqCst);
    let target = Pid::from_raw(raw);
    // The shell leads its own session, so its pid is also the group id.
    let group = killpg(target, Signal::SIGKILL);
    let leader = kill(target, Signal::SIGKILL);
    if let (Err(group_err), Err(leader_err)) = (group, leader) {
        tracing::warn!(
            pid = pid,
            group_error = %group_err,
            error = %leader_err,
            "Failed to force-kill shell"
        );
    } else {
        tracing::debug!(pid = pid, "Shell ignored hangup, sent SIGKILL");
    }
}

/// A shell process running inside a pseudo-terminal.
pub struct PtyProcess {
    /// Process ID (0 if the platform does not report one).
    pid: u32,

    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY.
    writer: Mutex<Box<dyn Write + Send>>,

    /// Kill handle; the child itself lives on the waiter thread.
    killer: StdMutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Termination state shared with the waiter thread.
    gate: Arc<ExitGate>,

    /// Current terminal size.
    cols: AtomicU16,
    rows: AtomicU16,
}

impl PtyProcess {
    /// Spawns a shell in a new PTY.
    ///
    /// # Returns
    /// The process handle and the receiver for its [`PtyEvent`]s. The
    /// receiver yields `None` once both output and exit have been delivered.
    pub fn spawn(
        options: SpawnOptions,
    ) -> Result<(Self, mpsc::Receiver<PtyEvent>), SessionError> {
        if !options.cwd.is_dir() {
            return Err(SessionError::SpawnFailed(format!(
                "working directory does not exist: {}",
                options.cwd.display()
            )));
        }

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: options.rows,
                cols: options.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&options.shell);
        cmd.args(&options.args);
        cmd.cwd(&options.cwd);
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let gate = Arc::new(ExitGate::new());
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", options.shell, e)))?;
        gate.mark_running();

        // The child holds its own copy of the slave; ours must go so the
        // reader sees EOF when the shell exits.
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let mut killer = child.clone_killer();

        let handles = pair
            .master
            .try_clone_reader()
            .and_then(|reader| pair.master.take_writer().map(|writer| (reader, writer)));
        let (reader, writer) = match handles {
            Ok(handles) => handles,
            Err(e) => {
                let _ = killer.kill();
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (drained_tx, drained_rx) = std::sync::mpsc::channel();

        let data_tx = event_tx.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reader-{pid}"))
            .spawn(move || read_loop(reader, data_tx, drained_tx, pid))
            .and_then(|_| {
                let gate = Arc::clone(&gate);
                std::thread::Builder::new()
                    .name(format!("pty-waiter-{pid}"))
                    .spawn(move || wait_loop(child, gate, event_tx, drained_rx, pid))
            });
        if let Err(e) = spawned {
            let _ = killer.kill();
            return Err(SessionError::SpawnFailed(format!(
                "failed to start PTY threads: {e}"
            )));
        }

        tracing::debug!(
            pid = pid,
            shell = %options.shell,
            cwd = %options.cwd.display(),
            cols = options.cols,
            rows = options.rows,
            "Spawned shell"
        );

        let process = PtyProcess {
            pid,
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: StdMutex::new(killer),
            gate,
            cols: AtomicU16::new(options.cols),
            rows: AtomicU16::new(options.rows),
        };

        Ok((process, event_rx))
    }

    /// Returns the process ID of the shell.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Returns the current terminal size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        (
            self.cols.load(Ordering::SeqCst),
            self.rows.load(Ordering::SeqCst),
        )
    }

    /// Returns the process lifecycle state.
    pub fn state(&self) -> ProcessState {
        self.gate.state()
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    /// Writes data to the PTY (stdin).
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated);
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;

        Ok(())
    }

    /// Resizes the PTY to the given dimensions.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::AlreadyTerminated);
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;

        self.cols.store(cols, Ordering::SeqCst);
        self.rows.store(rows, Ordering::SeqCst);

        tracing::debug!(pid = self.pid, cols = cols, rows = rows, "Resized PTY");

        Ok(())
    }

    /// Terminates the process.
    ///
    /// Idempotent: killing an exited process, or killing twice, is `Ok`.
    /// The exit event is still delivered by the waiter, exactly once.
    pub fn kill(&self) -> Result<(), SessionError> {
        if self.state() == ProcessState::Exited || !self.gate.request_kill() {
            return Ok(());
        }

        let mut killer = self.killer.lock().unwrap_or_else(PoisonError::into_inner);
        match killer.kill() {
            Ok(()) => {
                tracing::debug!(pid = self.pid, "Sent hangup to shell");
                self.spawn_escalation();
                Ok(())
            }
            // Lost the race with natural termination.
            Err(_) if self.state() == ProcessState::Exited => Ok(()),
            Err(e) if is_no_such_process(&e) => Ok(()),
            Err(e) => Err(SessionError::KillFailed(e.to_string())),
        }
    }
}

impl PtyProcess {
    /// Watches the hangup and follows up with SIGKILL if it is ignored.
    #[cfg(unix)]
    fn spawn_escalation(&self) {
        let pid = self.pid;
        let gate = Arc::clone(&self.gate);
        let spawned = std::thread::Builder::new()
            .name(format!("pty-reaper-{pid}"))
            .spawn(move || escalate_after_grace(pid, gate));
        if let Err(e) = spawned {
            tracing::warn!(pid = pid, error = %e, "Failed to start kill escalation thread");
        }
    }

    /// The Windows killer already terminates the process outright.
    #[cfg(not(unix))]
    fn spawn_escalation(&self) {}
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.kill();
        }
    }
}

#[cfg(unix)]
fn is_no_such_process(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(nix::errno::Errno::ESRCH as i32)
}

#[cfg(not(unix))]
fn is_no_such_process(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::NotFound
}

/// Reads PTY output until EOF and forwards it in order.
fn read_loop(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<PtyEvent>,
    drained: std::sync::mpsc::Sender<()>,
    pid: u32,
) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(PtyEvent::Data(buffer[..n].to_vec())).is_err() {
                    tracing::trace!(pid = pid, "Output receiver dropped");
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                // Linux reports EIO once the slave side is closed.
                tracing::trace!(pid = pid, error = %e, "PTY read finished");
                break;
            }
        }
    }
    let _ = drained.send(());
}

/// Waits for the child and reports its exit through the gate.
fn wait_loop(
    mut child: Box<dyn Child + Send + Sync>,
    gate: Arc<ExitGate>,
    tx: mpsc::Sender<PtyEvent>,
    drained: std::sync::mpsc::Receiver<()>,
    pid: u32,
) {
    let status = child.wait();
    gate.mark_reaped();
    let _ = drained.recv_timeout(DRAIN_TIMEOUT);

    let exit = match status {
        Ok(status) => ExitStatus {
            exit_code: i32::try_from(status.exit_code()).ok(),
            signal: gate.termination_signal(status.success()),
        },
        Err(e) => {
            tracing::warn!(pid = pid, error = %e, "Failed to wait for shell");
            ExitStatus {
                exit_code: None,
                signal: gate.termination_signal(false),
            }
        }
    };

    if gate.close() {
        tracing::debug!(pid = pid, exit_code = ?exit.exit_code, signal = ?exit.signal, "Shell exited");
        let _ = tx.blocking_send(PtyEvent::Exit(exit));
    }
}
