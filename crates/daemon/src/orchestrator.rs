//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the client
//! registry and event router from the configuration, accepts WebSocket
//! clients, and drains every connection on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tabshell_protocol::EventCodec;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::network::{serve_connection, ConnectionObserver};
use crate::remote::{RemoteExecutor, SshExecutor};
use crate::router::EventRouter;
use crate::session::{ClientRegistry, SessionSettings};

/// Capacity of the orchestrator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
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
    /// A client connected.
    ClientConnected {
        connection_id: String,
        peer: SocketAddr,
    },
    /// A client disconnected and its tabs were released.
    ClientDisconnected { connection_id: String },
    /// Error occurred.
    Error { message: String },
}

/// Forwards connection lifecycle to the orchestrator's event channel.
struct EventObserver(broadcast::Sender<OrchestratorEvent>);

impl ConnectionObserver for EventObserver {
    fn connected(&self, connection_id: &str, peer: SocketAddr) {
        let _ = self.0.send(OrchestratorEvent::ClientConnected {
            connection_id: connection_id.to_string(),
            peer,
        });
    }

    fn disconnected(&self, connection_id: &str) {
        let _ = self.0.send(OrchestratorEvent::ClientDisconnected {
            connection_id: connection_id.to_string(),
        });
    }
}

/// Daemon orchestrator that manages all subsystems.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Tabs of every connected client.
    registry: Arc<ClientRegistry>,
    /// Event router shared by all connections.
    router: Arc<EventRouter>,
    /// Cancellation token for graceful shutdown.
    shutdown_token: CancellationToken,
    /// Accept loop and connection tasks.
    tasks: TaskTracker,
    /// Address the listener is bound to while running.
    local_addr: Option<SocketAddr>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates a new daemon orchestrator that reaches the host through the
    /// system `ssh` client.
    pub fn new(config: Config) -> Result<Self> {
        let executor = Arc::new(SshExecutor::from_config(&config.ssh));
        Self::with_executor(config, executor)
    }

    /// Creates an orchestrator with a custom remote executor.
    pub fn with_executor(config: Config, executor: Arc<dyn RemoteExecutor>) -> Result<Self> {
        std::fs::create_dir_all(&config.daemon.data_dir).with_context(|| {
            format!(
                "Failed to create data directory {}",
                config.daemon.data_dir.display()
            )
        })?;

        let settings = Arc::new(SessionSettings::from_config(&config));
        if settings.key_candidates.is_empty() {
            debug!("No identity files found, only password authentication is available");
        }

        let registry = Arc::new(ClientRegistry::new(
            config.session.max_tabs_per_connection,
        ));
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            executor,
            settings,
        ));
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry,
            router,
            shutdown_token: CancellationToken::new(),
            tasks: TaskTracker::new(),
            local_addr: None,
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

    /// Starts the daemon orchestrator.
    ///
    /// Binds the configured address and spawns the accept loop.
    pub async fn start(&mut self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");

        let bind = (self.config.server.bind_address.as_str(), self.config.server.port);
        let listener = match TcpListener::bind(bind).await {
            Ok(listener) => listener,
            Err(e) => {
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: format!("Failed to bind {}:{}: {}", bind.0, bind.1, e),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).with_context(|| format!("Failed to bind {}:{}", bind.0, bind.1));
            }
        };
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        self.local_addr = Some(local_addr);

        let router = Arc::clone(&self.router);
        let codec = EventCodec::with_max_frame_size(self.config.server.max_frame_bytes);
        let shutdown = self.shutdown_token.clone();
        let tasks = self.tasks.clone();
        let observer: Arc<dyn ConnectionObserver> = Arc::new(EventObserver(self.event_tx.clone()));
        let event_tx = self.event_tx.clone();

        self.tasks.spawn(async move {
            Self::accept_loop(listener, router, codec, shutdown, tasks, observer, event_tx).await;
        });

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!(address = %local_addr, "Daemon orchestrator started");
        Ok(())
    }

    async fn accept_loop(
        listener: TcpListener,
        router: Arc<EventRouter>,
        codec: EventCodec,
        shutdown: CancellationToken,
        tasks: TaskTracker,
        observer: Arc<dyn ConnectionObserver>,
        event_tx: broadcast::Sender<OrchestratorEvent>,
    ) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let connection_id = uuid::Uuid::new_v4().to_string();
                    debug!(connection_id = %connection_id, peer = %peer, "Accepted TCP connection");
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
                    }

                    tasks.spawn(serve_connection(
                        stream,
                        peer,
                        connection_id,
                        Arc::clone(&router),
                        codec,
                        shutdown.clone(),
                        Some(Arc::clone(&observer)),
                    ));
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    let _ = event_tx.send(OrchestratorEvent::Error {
                        message: format!("Failed to accept connection: {}", e),
                    });
                    // Avoid spinning while the process is out of descriptors.
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            }
        }

        debug!("Accept loop stopped");
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Closes the listener, disconnects every client and waits until their
    /// sessions are released.
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

        info!("Stopping daemon orchestrator...");

        self.shutdown_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let leftover = self.registry.session_count();
        if leftover > 0 {
            warn!(sessions = leftover, "Sessions still registered after shutdown");
        }

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the client registry.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Returns the event router.
    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    /// Returns the bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Returns the number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
