//! A single remote shell tab.
//!
//! A [`Session`] owns one remote PTY process for one `(connection, tab)` pair
//! and walks through:
//!
//! ```text
//! Idle ──open──▶ Connecting ──ok──▶ Connected ──close/EOF──▶ Closing ──▶ Closed
//!                    │                                                     ▲
//!                    └──────────────────────── failure ────────────────────┘
//! ```
//!
//! Output and the close notification leave the session through a
//! [`SessionSink`], tagged with the session's [`SessionKey`] so a consumer can
//! tell a live tab from a stale one that reused the same tab id.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::pump::OutputPump;
use crate::config::Config;
use crate::remote::{
    Credentials, RemoteConnection, RemoteError, RemoteExecutor, RemoteProcess,
};

/// Identifier of a client connection.
pub type ConnectionId = String;

/// Identifier of a tab, chosen by the client.
pub type TabId = String;

/// Unique, never reused identity of a session within the daemon.
pub type SessionKey = u64;

/// Errors that can occur while opening a session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// `open` was called on a session that already left `Idle`.
    #[error("session already opened")]
    AlreadyOpened,

    /// The session was closed before it finished opening.
    #[error("session closed while connecting")]
    Closed,

    /// The remote side failed to authenticate, connect or spawn.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Closing = 3,
    Closed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// Something a session reports to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Decoded remote output, or an inline diagnostic.
    Output {
        tab_id: TabId,
        key: SessionKey,
        data: String,
    },
    /// The session finished closing without suppression.
    Closed { tab_id: TabId, key: SessionKey },
}

impl SessionEvent {
    /// Returns the key of the session that produced the event.
    pub fn key(&self) -> SessionKey {
        match self {
            SessionEvent::Output { key, .. } | SessionEvent::Closed { key, .. } => *key,
        }
    }
}

/// Receiver of session events.
///
/// A bounded sink makes `deliver` wait while its consumer is behind, which
/// holds the output pump (and with it the remote read) back.
#[async_trait]
pub trait SessionSink: Send + Sync {
    async fn deliver(&self, event: SessionEvent);
}

#[async_trait]
impl SessionSink for mpsc::Sender<SessionEvent> {
    async fn deliver(&self, event: SessionEvent) {
        let _ = self.send(event).await;
    }
}

#[async_trait]
impl SessionSink for mpsc::UnboundedSender<SessionEvent> {
    async fn deliver(&self, event: SessionEvent) {
        let _ = self.send(event);
    }
}

/// Input chunks queued for the remote before writes are refused.
pub const INPUT_QUEUE_CAPACITY: usize = 1024;

/// Per-daemon settings every session is opened with.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Host the shells run on.
    pub host: String,
    /// Remote login name.
    pub user: String,
    /// `TERM` requested for the PTY.
    pub term_type: String,
    /// Program exec'd in the workspace once the shell is up.
    pub program: String,
    /// Base for relative workspace paths.
    pub home_dir: PathBuf,
    /// Private keys offered before any password.
    pub key_candidates: Vec<PathBuf>,
    /// Pause between shell start and the initial command.
    pub startup_delay: Duration,
    /// Upper bound on releasing the remote side.
    pub close_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            user: std::env::var("USER").unwrap_or_default(),
            term_type: "xterm-256color".to_string(),
            program: "claude".to_string(),
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            key_candidates: Vec::new(),
            startup_delay: Duration::from_millis(500),
            close_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionSettings {
    /// Derives session settings from the daemon configuration.
    ///
    /// Identity files that do not exist are left out.
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.ssh.host.clone(),
            user: config.ssh.user.clone(),
            term_type: config.ssh.term_type.clone(),
            program: config.session.program.clone(),
            home_dir: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")),
            key_candidates: config
                .ssh
                .identity_files
                .iter()
                .filter(|path| path.exists())
                .cloned()
                .collect(),
            startup_delay: Duration::from_millis(config.session.startup_delay_ms),
            close_timeout: Duration::from_secs(config.session.close_timeout_secs),
        }
    }
}

/// Resolves a client-supplied workspace against the home directory.
pub fn resolve_workspace(workspace: &str, home_dir: &Path) -> PathBuf {
    let path = Path::new(workspace.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        home_dir.join(path)
    }
}

/// Command typed into a fresh shell: enter the workspace, clear, exec `program`.
pub fn initial_command(workspace: &Path, program: &str) -> String {
    format!(
        "cd {} && clear && exec {}\n",
        shell_quote(&workspace.to_string_lossy()),
        program
    )
}

/// Single-quotes `value` for a POSIX shell.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

struct RemoteHandles {
    connection: Box<dyn RemoteConnection>,
    process: Arc<dyn RemoteProcess>,
}

struct SessionInner {
    key: SessionKey,
    connection_id: ConnectionId,
    tab_id: TabId,
    state: AtomicU8,
    geometry: AtomicU32,
    workspace: OnceLock<PathBuf>,
    executor: Arc<dyn RemoteExecutor>,
    settings: Arc<SessionSettings>,
    sink: Arc<dyn SessionSink>,
    remote: Mutex<Option<RemoteHandles>>,
    process: OnceLock<Arc<dyn RemoteProcess>>,
    input_tx: OnceLock<mpsc::Sender<Vec<u8>>>,
    cancel: CancellationToken,
}

/// Handle to a remote shell tab. Clones share the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.inner.key)
            .field("connection_id", &self.inner.connection_id)
            .field("tab_id", &self.inner.tab_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Creates an idle session.
    pub fn new(
        key: SessionKey,
        connection_id: impl Into<ConnectionId>,
        tab_id: impl Into<TabId>,
        executor: Arc<dyn RemoteExecutor>,
        settings: Arc<SessionSettings>,
        sink: Arc<dyn SessionSink>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                key,
                connection_id: connection_id.into(),
                tab_id: tab_id.into(),
                state: AtomicU8::new(SessionState::Idle as u8),
                geometry: AtomicU32::new(0),
                workspace: OnceLock::new(),
                executor,
                settings,
                sink,
                remote: Mutex::new(None),
                process: OnceLock::new(),
                input_tx: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn key(&self) -> SessionKey {
        self.inner.key
    }

    pub fn tab_id(&self) -> &str {
        &self.inner.tab_id
    }

    pub fn connection_id(&self) -> &str {
        &self.inner.connection_id
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Returns whether input and resizes are currently accepted.
    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Returns whether the session has started or finished closing.
    pub fn is_closed(&self) -> bool {
        matches!(self.state(), SessionState::Closing | SessionState::Closed)
    }

    /// Last negotiated `(cols, rows)`.
    pub fn geometry(&self) -> (u16, u16) {
        let packed = self.inner.geometry.load(Ordering::SeqCst);
        ((packed >> 16) as u16, packed as u16)
    }

    /// Resolved workspace, once `open` has been called.
    pub fn workspace(&self) -> Option<&Path> {
        self.inner.workspace.get().map(PathBuf::as_path)
    }

    fn set_geometry(&self, cols: u16, rows: u16) {
        self.inner
            .geometry
            .store(((cols as u32) << 16) | rows as u32, Ordering::SeqCst);
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.inner
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Connects, spawns the remote shell, starts the output pump and issues
    /// the initial command.
    ///
    /// Public keys are tried first, then the password if one was given. On
    /// failure an `[SSH Error]` diagnostic is emitted as output and the
    /// session ends up `Closed` without a close notification.
    pub async fn open(
        &self,
        workspace: &str,
        credentials: &Credentials,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        if !self.transition(SessionState::Idle, SessionState::Connecting) {
            return Err(SessionError::AlreadyOpened);
        }
        self.set_geometry(cols, rows);

        let workspace = resolve_workspace(workspace, &self.inner.settings.home_dir);
        let _ = self.inner.workspace.set(workspace.clone());

        tracing::info!(
            connection_id = %self.inner.connection_id,
            tab_id = %self.inner.tab_id,
            key = self.inner.key,
            workspace = %workspace.display(),
            cols,
            rows,
            "Opening session"
        );

        let (handles, output) = match self.establish(credentials, cols, rows).await {
            Ok(established) => established,
            Err(e) => {
                tracing::warn!(
                    tab_id = %self.inner.tab_id,
                    key = self.inner.key,
                    error = %e,
                    "Failed to open session"
                );
                self.emit_output(format!("\r\n[SSH Error] {}\r\n", e)).await;
                self.transition(SessionState::Connecting, SessionState::Closed);
                return Err(e);
            }
        };

        let process = Arc::clone(&handles.process);
        *self.inner.remote.lock().await = Some(handles);

        if !self.transition(SessionState::Connecting, SessionState::Connected) {
            // close() ran while we were connecting and may have missed the handles.
            self.release().await;
            return Err(SessionError::Closed);
        }

        let _ = self.inner.process.set(Arc::clone(&process));
        self.spawn_input_task(process);
        OutputPump::spawn(self.clone(), output);

        let delay = self.inner.settings.startup_delay;
        if !delay.is_zero() {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.write(initial_command(&workspace, &self.inner.settings.program));

        tracing::info!(
            tab_id = %self.inner.tab_id,
            key = self.inner.key,
            "Session connected"
        );

        Ok(())
    }

    async fn establish(
        &self,
        credentials: &Credentials,
        cols: u16,
        rows: u16,
    ) -> Result<(RemoteHandles, crate::remote::ProcessOutput), SessionError> {
        let settings = &self.inner.settings;

        let mut last_error = None;
        let mut connection = None;
        for auth in credentials.auth_attempts() {
            match self
                .inner
                .executor
                .connect(&settings.host, &settings.user, &auth)
                .await
            {
                Ok(conn) => {
                    tracing::debug!(tab_id = %self.inner.tab_id, auth = auth.kind(), "Authenticated");
                    connection = Some(conn);
                    break;
                }
                Err(e) => {
                    tracing::debug!(
                        tab_id = %self.inner.tab_id,
                        auth = auth.kind(),
                        error = %e,
                        "Authentication attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let connection = match connection {
            Some(connection) => connection,
            None => {
                return Err(last_error
                    .unwrap_or_else(|| {
                        RemoteError::AuthFailed("no authentication method available".to_string())
                    })
                    .into())
            }
        };

        match connection.spawn_pty(&settings.term_type, cols, rows).await {
            Ok((process, output)) => Ok((
                RemoteHandles {
                    connection,
                    process: Arc::from(process),
                },
                output,
            )),
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    tracing::debug!(error = %close_err, "Error closing connection after spawn failure");
                }
                Err(e.into())
            }
        }
    }

    /// Input is written by a dedicated task so writes stay ordered and a slow
    /// remote never blocks the caller.
    fn spawn_input_task(&self, process: Arc<dyn RemoteProcess>) {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(INPUT_QUEUE_CAPACITY);
        if self.inner.input_tx.set(tx).is_err() {
            return;
        }

        let cancel = self.inner.cancel.clone();
        let tab_id = self.inner.tab_id.clone();

        tokio::spawn(async move {
            loop {
                let data = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    data = rx.recv() => match data {
                        Some(data) => data,
                        None => break,
                    },
                };

                if let Err(e) = process.write(&data).await {
                    tracing::debug!(tab_id = %tab_id, error = %e, "Dropped input");
                }
            }
        });
    }

    /// Queues input for the remote process.
    ///
    /// Returns `false` and does nothing unless the session is `Connected`.
    /// Input is refused while [`INPUT_QUEUE_CAPACITY`] chunks are still
    /// waiting for a remote that stopped reading.
    pub fn write(&self, data: impl Into<Vec<u8>>) -> bool {
        if !self.is_connected() {
            return false;
        }
        let Some(tx) = self.inner.input_tx.get() else {
            return false;
        };

        match tx.try_send(data.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    tab_id = %self.inner.tab_id,
                    key = self.inner.key,
                    "Remote is not reading input, dropping input"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Resizes the remote PTY. Ignored unless `Connected`; failures are logged.
    pub async fn resize(&self, cols: u16, rows: u16) {
        if !self.is_connected() {
            return;
        }
        let Some(process) = self.inner.process.get() else {
            return;
        };

        match process.resize(cols, rows).await {
            Ok(()) => {
                self.set_geometry(cols, rows);
                tracing::debug!(tab_id = %self.inner.tab_id, cols, rows, "Resized PTY");
            }
            Err(e) => {
                tracing::debug!(tab_id = %self.inner.tab_id, error = %e, "Resize failed");
            }
        }
    }

    /// Tears the session down.
    ///
    /// Only the first call does anything; it returns `true`. The pump and input
    /// task are stopped, the remote side is released (errors and timeouts are
    /// logged, not returned) and, unless `suppress_notification` is set, a
    /// [`SessionEvent::Closed`] is delivered.
    pub async fn close(&self, suppress_notification: bool) -> bool {
        let mut current = self.state();
        loop {
            if matches!(current, SessionState::Closing | SessionState::Closed) {
                return false;
            }
            match self.inner.state.compare_exchange(
                current as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }

        self.inner.cancel.cancel();
        self.release().await;
        self.inner
            .state
            .store(SessionState::Closed as u8, Ordering::SeqCst);

        tracing::info!(
            tab_id = %self.inner.tab_id,
            key = self.inner.key,
            suppressed = suppress_notification,
            "Session closed"
        );

        if !suppress_notification {
            self.inner
                .sink
                .deliver(SessionEvent::Closed {
                    tab_id: self.inner.tab_id.clone(),
                    key: self.inner.key,
                })
                .await;
        }
        true
    }

    /// Releases the remote process and connection, at most once.
    async fn release(&self) {
        let Some(handles) = self.inner.remote.lock().await.take() else {
            return;
        };

        let released = tokio::time::timeout(self.inner.settings.close_timeout, async {
            let process = handles.process.close().await;
            let connection = handles.connection.close().await;
            process.and(connection)
        })
        .await;

        match released {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(tab_id = %self.inner.tab_id, error = %e, "Error releasing remote session");
            }
            Err(_) => {
                tracing::warn!(tab_id = %self.inner.tab_id, "Timed out releasing remote session");
            }
        }
    }

    pub(crate) async fn emit_output(&self, data: String) {
        self.inner
            .sink
            .deliver(SessionEvent::Output {
                tab_id: self.inner.tab_id.clone(),
                key: self.inner.key,
                data,
            })
            .await;
    }

    pub(crate) fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }
}
