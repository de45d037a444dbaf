//! Event router for dispatching client events to tab sessions.
//!
//! Each client connection gets one dispatcher task. Everything that can
//! produce an outbound event for that connection goes through the
//! dispatcher's mailbox:
//!
//! - inbound client events
//! - session output and close notifications (via [`SessionSink`])
//! - completion of session opens, which run in their own tasks
//!
//! Because a single task is the only emitter, an event can be checked
//! against the registry and sent without anything changing in between. A
//! session event is forwarded only while its [`SessionKey`] still owns the
//! tab, so nothing from a stopped or replaced session reaches the client.
//! Output of a session that is still opening is held back until its
//! `session_started` has been sent.
//!
//! The mailbox and the outbound queue are bounded. A client that reads slowly
//! fills its outbound queue, the dispatcher then waits, and the output pumps
//! of that client's tabs wait on the full mailbox. Releasing a stopped or
//! abandoned session never happens on the dispatcher: it already lost its tab,
//! so its close runs in the background while the other tabs keep flowing.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tabshell_protocol::{
    InboundEvent, OutboundEvent, StartSession, StopSession, TerminalInput, TerminalResize,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::remote::{Credentials, RemoteExecutor};
use crate::session::{
    ClientRegistry, ConnectionId, RegistryError, Session, SessionError, SessionEvent,
    SessionKey, SessionSettings, SessionSink, TabSlot,
};

/// Capacity of a connection's mailbox.
pub const MAILBOX_CAPACITY: usize = 256;

/// Errors reported to the client as `terminal_error`.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// `start_session` without a workspace.
    #[error("Workspace is required")]
    MissingWorkspace,

    /// The tab could not be reserved.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// The remote session could not be opened.
    #[error("Failed to connect SSH session")]
    Connect(#[source] SessionError),
}

impl RouterError {
    /// Convert the error to a `terminal_error` event for `tab_id`.
    pub fn to_outbound(&self, tab_id: &str) -> OutboundEvent {
        OutboundEvent::TerminalError {
            tab_id: tab_id.to_string(),
            message: self.to_string(),
        }
    }
}

/// Messages handled by a connection's dispatcher.
enum ConnectionMessage {
    Inbound(InboundEvent),
    Session(SessionEvent),
    Opened {
        session: Session,
        workspace: String,
        result: Result<(), SessionError>,
    },
}

/// Delivers session events into a dispatcher mailbox.
struct MailboxSink(mpsc::Sender<ConnectionMessage>);

#[async_trait]
impl SessionSink for MailboxSink {
    async fn deliver(&self, event: SessionEvent) {
        let _ = self.0.send(ConnectionMessage::Session(event)).await;
    }
}

/// Routes client events for every connection of the daemon.
pub struct EventRouter {
    registry: Arc<ClientRegistry>,
    executor: Arc<dyn RemoteExecutor>,
    settings: Arc<SessionSettings>,
}

impl EventRouter {
    /// Create a new event router with the given dependencies.
    pub fn new(
        registry: Arc<ClientRegistry>,
        executor: Arc<dyn RemoteExecutor>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            registry,
            executor,
            settings,
        }
    }

    /// The registry shared by all connections.
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Registers a client connection and starts its dispatcher.
    ///
    /// Outbound events for the client are sent on `outbound`; while it is
    /// full the connection's tabs are held back. The returned handle feeds
    /// inbound events; dropping it or calling [`ConnectionHandle::disconnect`]
    /// tears every tab of the connection down.
    pub fn connect(
        self: &Arc<Self>,
        connection_id: impl Into<ConnectionId>,
        outbound: mpsc::Sender<OutboundEvent>,
    ) -> ConnectionHandle {
        let connection_id = connection_id.into();
        self.registry.register(&connection_id);

        let (mailbox, inbox) = mpsc::channel(MAILBOX_CAPACITY);
        let cancel = CancellationToken::new();

        let dispatcher = ConnectionDispatcher {
            connection_id: connection_id.clone(),
            router: Arc::clone(self),
            mailbox: mailbox.clone(),
            outbound,
            cancel: cancel.clone(),
            releases: TaskTracker::new(),
            early_output: HashMap::new(),
        };
        let task = tokio::spawn(dispatcher.run(inbox));

        info!(connection_id = %connection_id, "Client connected");

        ConnectionHandle {
            connection_id,
            mailbox,
            _cancel_guard: cancel.drop_guard(),
            task,
        }
    }
}

/// Inbound side of a registered connection.
pub struct ConnectionHandle {
    connection_id: ConnectionId,
    mailbox: mpsc::Sender<ConnectionMessage>,
    _cancel_guard: DropGuard,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queues an inbound event, waiting while the mailbox is full.
    ///
    /// Returns `false` if the dispatcher is gone.
    pub async fn dispatch(&self, event: InboundEvent) -> bool {
        self.mailbox
            .send(ConnectionMessage::Inbound(event))
            .await
            .is_ok()
    }

    /// Disconnects the client and waits until all its sessions are released.
    pub async fn disconnect(self) {
        let ConnectionHandle {
            connection_id,
            _cancel_guard,
            task,
            ..
        } = self;

        drop(_cancel_guard);
        if let Err(e) = task.await {
            warn!(connection_id = %connection_id, error = %e, "Connection dispatcher failed");
        }
    }
}

/// Per-connection actor; the only emitter of outbound events for its client.
struct ConnectionDispatcher {
    connection_id: ConnectionId,
    router: Arc<EventRouter>,
    mailbox: mpsc::Sender<ConnectionMessage>,
    outbound: mpsc::Sender<OutboundEvent>,
    cancel: CancellationToken,
    /// Suppressed closes of sessions that no longer own a tab.
    releases: TaskTracker,
    /// Output of sessions still opening, flushed after `session_started`.
    early_output: HashMap<SessionKey, Vec<String>>,
}

impl ConnectionDispatcher {
    async fn run(mut self, mut inbox: mpsc::Receiver<ConnectionMessage>) {
        let cancel = self.cancel.clone();
        loop {
            let message = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                message = inbox.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            match message {
                ConnectionMessage::Inbound(event) => self.handle_inbound(event).await,
                ConnectionMessage::Session(event) => self.handle_session_event(event).await,
                ConnectionMessage::Opened {
                    session,
                    workspace,
                    result,
                } => self.handle_opened(session, workspace, result).await,
            }
        }

        // Opens that finish from now on close their own session.
        inbox.close();
        while let Ok(message) = inbox.try_recv() {
            if let ConnectionMessage::Opened { session, .. } = message {
                self.release(session);
            }
        }

        let closed = self
            .router
            .registry
            .unregister_all(&self.connection_id)
            .await;

        self.releases.close();
        self.releases.wait().await;

        info!(
            connection_id = %self.connection_id,
            sessions_closed = closed,
            "Client disconnected"
        );
    }

    /// Sends `event` to the client, waiting while its queue is full.
    ///
    /// Gives up once the connection is being torn down.
    async fn emit(&self, event: OutboundEvent) {
        trace!(
            connection_id = %self.connection_id,
            event = event.name(),
            tab_id = event.tab_id(),
            "Outbound event"
        );
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                trace!(connection_id = %self.connection_id, "Dropped event during disconnect");
            }
            sent = self.outbound.send(event) => {
                if sent.is_err() {
                    trace!(connection_id = %self.connection_id, "Client transport closed");
                }
            }
        }
    }

    async fn emit_output(&self, tab_id: &str, chunks: Vec<String>) {
        for data in chunks {
            self.emit(OutboundEvent::TerminalOutput {
                tab_id: tab_id.to_string(),
                data,
            })
            .await;
        }
    }

    /// Closes, without notification, a session that no longer owns a tab.
    fn release(&self, session: Session) {
        self.releases.spawn(async move {
            session.close(true).await;
        });
    }

    async fn handle_inbound(&mut self, event: InboundEvent) {
        debug!(
            connection_id = %self.connection_id,
            event = event.name(),
            tab_id = event.tab_id(),
            "Inbound event"
        );

        match event {
            InboundEvent::StartSession(req) => self.handle_start_session(req).await,
            InboundEvent::TerminalInput(input) => self.handle_terminal_input(input),
            InboundEvent::TerminalResize(resize) => self.handle_terminal_resize(resize).await,
            InboundEvent::StopSession(stop) => self.handle_stop_session(stop).await,
        }
    }

    async fn handle_start_session(&self, req: StartSession) {
        let tab_id = req.tab_id.clone();
        if let Err(e) = self.start_session(req) {
            warn!(
                connection_id = %self.connection_id,
                tab_id = %tab_id,
                error = %e,
                "Rejected start_session"
            );
            self.emit(e.to_outbound(&tab_id)).await;
        }
    }

    fn start_session(&self, req: StartSession) -> Result<(), RouterError> {
        if req.workspace.trim().is_empty() {
            return Err(RouterError::MissingWorkspace);
        }

        let router = &self.router;
        let key = router.registry.allocate_key();
        router
            .registry
            .reserve(&self.connection_id, &req.tab_id, key)?;

        let session = Session::new(
            key,
            self.connection_id.clone(),
            req.tab_id.clone(),
            Arc::clone(&router.executor),
            Arc::clone(&router.settings),
            Arc::new(MailboxSink(self.mailbox.clone())),
        );
        let credentials = Credentials::new(router.settings.key_candidates.clone(), req.password);
        let mailbox = self.mailbox.clone();

        tokio::spawn(async move {
            let result = session
                .open(&req.workspace, &credentials, req.cols, req.rows)
                .await;
            let opened = ConnectionMessage::Opened {
                session,
                workspace: req.workspace,
                result,
            };
            if let Err(mpsc::error::SendError(ConnectionMessage::Opened { session, .. })) =
                mailbox.send(opened).await
            {
                session.close(true).await;
            }
        });

        Ok(())
    }

    async fn handle_opened(
        &mut self,
        session: Session,
        workspace: String,
        result: Result<(), SessionError>,
    ) {
        let registry = &self.router.registry;
        let tab_id = session.tab_id().to_string();
        let key = session.key();
        let early_output = self.early_output.remove(&key).unwrap_or_default();

        if let Err(e) = result {
            if registry.remove_if(&self.connection_id, &tab_id, key).is_some() {
                self.emit_output(&tab_id, early_output).await;
                self.emit(RouterError::Connect(e).to_outbound(&tab_id)).await;
            } else {
                debug!(tab_id = %tab_id, error = %e, "Open failed for abandoned tab");
            }
            return;
        }

        if let Err(e) = registry.promote(&self.connection_id, session.clone()) {
            debug!(tab_id = %tab_id, error = %e, "Discarding session for abandoned tab");
            self.release(session);
            return;
        }

        self.emit(OutboundEvent::SessionStarted {
            tab_id: tab_id.clone(),
            workspace,
        })
        .await;
        self.emit_output(&tab_id, early_output).await;

        // The remote side may have gone away before the session was installed.
        if session.is_closed() && registry.remove_if(&self.connection_id, &tab_id, key).is_some() {
            self.emit(OutboundEvent::SessionClosed { tab_id }).await;
        }
    }

    fn handle_terminal_input(&self, input: TerminalInput) {
        match self.router.registry.get(&self.connection_id, &input.tab_id) {
            Some(session) => {
                if !session.write(input.data) {
                    trace!(tab_id = %input.tab_id, "Input for inactive session dropped");
                }
            }
            None => trace!(tab_id = %input.tab_id, "Input for unknown tab dropped"),
        }
    }

    async fn handle_terminal_resize(&self, resize: TerminalResize) {
        if resize.cols == 0 || resize.rows == 0 {
            debug!(tab_id = %resize.tab_id, "Ignoring empty geometry");
            return;
        }
        if let Some(session) = self.router.registry.get(&self.connection_id, &resize.tab_id) {
            session.resize(resize.cols, resize.rows).await;
        }
    }

    async fn handle_stop_session(&mut self, stop: StopSession) {
        match self.router.registry.remove(&self.connection_id, &stop.tab_id) {
            Some(TabSlot::Live(session)) => self.release(session),
            Some(TabSlot::Opening { key }) => {
                self.early_output.remove(&key);
                debug!(tab_id = %stop.tab_id, key, "Stopped tab while opening");
            }
            None => {
                debug!(tab_id = %stop.tab_id, "Stop for unknown tab");
            }
        }

        self.emit(OutboundEvent::SessionStopped {
            tab_id: stop.tab_id,
        })
        .await;
    }

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let registry = &self.router.registry;

        match event {
            SessionEvent::Output { tab_id, key, data } => {
                let live = registry
                    .get(&self.connection_id, &tab_id)
                    .is_some_and(|session| session.key() == key);

                if live {
                    self.emit(OutboundEvent::TerminalOutput { tab_id, data }).await;
                } else if registry.is_current(&self.connection_id, &tab_id, key) {
                    // Still opening
                    self.early_output.entry(key).or_default().push(data);
                } else {
                    trace!(tab_id = %tab_id, key, "Dropped output from stale session");
                }
            }
            SessionEvent::Closed { tab_id, key } => {
                // Sessions still opening are reconciled in handle_opened.
                let live = registry
                    .get(&self.connection_id, &tab_id)
                    .is_some_and(|session| session.key() == key);

                if live && registry.remove_if(&self.connection_id, &tab_id, key).is_some() {
                    info!(connection_id = %self.connection_id, tab_id = %tab_id, "Remote session ended");
                    self.emit(OutboundEvent::SessionClosed { tab_id }).await;
                }
            }
        }
    }
}
