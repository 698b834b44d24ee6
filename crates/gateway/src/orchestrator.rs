//! Gateway orchestrator for wiring together all components.
//!
//! This module provides the `GatewayOrchestrator` that owns the session
//! registry and runs the WebSocket listener and the stale session sweep.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::network::{MuxOptions, TransportListener};
use crate::resolver::{DefaultDirectoryResolver, DirectoryResolver};
use crate::session::{spawn_reclaim_task, SessionId, SessionRegistry};

/// Gateway orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// The stale session sweep destroyed these sessions.
    SessionsReclaimed { ids: Vec<SessionId> },
}

/// Gateway orchestrator that manages all subsystems.
pub struct GatewayOrchestrator {
    /// Configuration.
    config: Config,
    /// Address the listener binds to.
    bind_addr: SocketAddr,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Every live session.
    registry: Arc<SessionRegistry>,
    /// Working directory resolution for new sessions.
    resolver: Arc<dyn DirectoryResolver>,
    /// Bound listener, once started.
    listener: Option<Arc<TransportListener>>,
    /// Listener and sweep tasks.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl GatewayOrchestrator {
    /// Creates a new gateway orchestrator.
    pub fn new(config: Config) -> Result<Self> {
        let bind_addr = config
            .bind_addr()
            .context("Invalid listen address")?;

        let registry = Arc::new(SessionRegistry::new(config.registry_options()));
        let resolver = DefaultDirectoryResolver::from_configured(&config.session.default_cwd);
        info!(
            shell = %config.session.default_shell,
            default_cwd = %resolver.default_dir().display(),
            max_sessions = config.session.max_sessions,
            "Session registry initialized"
        );

        let (event_tx, _) = broadcast::channel(100);

        Ok(Self {
            config,
            bind_addr,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            resolver: Arc::new(resolver),
            listener: None,
            tasks: Mutex::new(Vec::new()),
            shutdown_token: CancellationToken::new(),
            event_tx,
        })
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Starts the gateway: binds the listener and spawns the background tasks.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting gateway orchestrator...");

        let listener = match TransportListener::bind(self.bind_addr).await {
            Ok(listener) => Arc::new(listener),
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).with_context(|| format!("Failed to bind {}", self.bind_addr));
            }
        };
        self.shutdown_token = CancellationToken::new();
        self.listener = Some(Arc::clone(&listener));

        let mut tasks = self.tasks.lock().await;

        let registry = Arc::clone(&self.registry);
        let resolver = Arc::clone(&self.resolver);
        let options = MuxOptions {
            exit_grace: self.config.exit_grace(),
        };
        let shutdown = self.shutdown_token.clone();
        tasks.push(tokio::spawn(async move {
            listener.run(registry, resolver, options, shutdown).await;
        }));
        debug!("Started listener task");

        let event_tx = self.event_tx.clone();
        tasks.push(spawn_reclaim_task(
            Arc::clone(&self.registry),
            self.config.reclaim_config(),
            self.shutdown_token.clone(),
            move |ids| {
                let _ = event_tx.send(OrchestratorEvent::SessionsReclaimed { ids: ids.to_vec() });
            },
        ));
        debug!("Started reclaim task");
        drop(tasks);

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Running;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(addr = ?self.local_addr(), "Gateway orchestrator started successfully");
        Ok(())
    }

    /// Stops the gateway gracefully.
    ///
    /// Stops accepting connections, closes open ones and destroys every
    /// session.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping gateway orchestrator...");

        self.shutdown_token.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task failed during shutdown: {}", e);
            }
        }

        let destroyed = self.registry.shutdown();
        debug!(count = destroyed, "Destroyed remaining sessions");

        {
            let mut state = self.state.write().await;
            *state = OrchestratorState::Stopped;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Gateway orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the bound listen address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|listener| listener.local_addr())
    }

    /// Returns the session registry.
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Returns the number of open WebSocket connections.
    pub fn connection_count(&self) -> usize {
        self.listener
            .as_ref()
            .map_or(0, |listener| listener.connection_count())
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
