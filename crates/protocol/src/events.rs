//! Event definitions exchanged between a client and the daemon.
//!
//! Every frame is a JSON object of the form `{"event": "<name>", "data": {...}}`.
//! Inbound events flow client → daemon, outbound events daemon → client.
//! Connecting and disconnecting are transport-level and have no frame.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Tab identifier used when a request omits `tab_id`.
pub const DEFAULT_TAB_ID: &str = "default";

/// Terminal columns used when `start_session` omits `cols`.
pub const DEFAULT_COLS: u16 = 120;

/// Terminal rows used when `start_session` omits `rows`.
pub const DEFAULT_ROWS: u16 = 40;

fn default_tab_id() -> String {
    DEFAULT_TAB_ID.to_string()
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

/// Events sent by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Open a new tab.
    StartSession(StartSession),
    /// Keystrokes for a tab.
    TerminalInput(TerminalInput),
    /// Geometry change for a tab.
    TerminalResize(TerminalResize),
    /// Explicitly close a tab.
    StopSession(StopSession),
}

impl InboundEvent {
    /// Returns the wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::StartSession(_) => "start_session",
            InboundEvent::TerminalInput(_) => "terminal_input",
            InboundEvent::TerminalResize(_) => "terminal_resize",
            InboundEvent::StopSession(_) => "stop_session",
        }
    }

    /// Returns the tab the event addresses.
    pub fn tab_id(&self) -> &str {
        match self {
            InboundEvent::StartSession(e) => &e.tab_id,
            InboundEvent::TerminalInput(e) => &e.tab_id,
            InboundEvent::TerminalResize(e) => &e.tab_id,
            InboundEvent::StopSession(e) => &e.tab_id,
        }
    }
}

/// Request to open a remote shell in a workspace.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartSession {
    /// Workspace directory; relative paths are resolved against the home directory.
    #[serde(default)]
    pub workspace: String,
    /// Tab identifier chosen by the client.
    #[serde(default = "default_tab_id")]
    pub tab_id: String,
    /// Password used when public-key authentication fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Initial terminal columns.
    #[serde(default = "default_cols")]
    pub cols: u16,
    /// Initial terminal rows.
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl StartSession {
    /// Creates a request with default geometry and no password.
    pub fn new(workspace: impl Into<String>, tab_id: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            tab_id: tab_id.into(),
            password: None,
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }

    /// Sets the initial geometry.
    pub fn with_size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    /// Sets the fallback password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

// Hand-written so passwords never reach the logs.
impl fmt::Debug for StartSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StartSession")
            .field("workspace", &self.workspace)
            .field("tab_id", &self.tab_id)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish()
    }
}

/// Input for a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalInput {
    #[serde(default = "default_tab_id")]
    pub tab_id: String,
    #[serde(default)]
    pub data: String,
}

/// New geometry for a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalResize {
    #[serde(default = "default_tab_id")]
    pub tab_id: String,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

/// Request to close a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopSession {
    #[serde(default = "default_tab_id")]
    pub tab_id: String,
}

impl Default for StopSession {
    fn default() -> Self {
        Self {
            tab_id: default_tab_id(),
        }
    }
}

/// Events sent by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    /// The tab's remote shell is up.
    SessionStarted { tab_id: String, workspace: String },
    /// Remote output, decoded permissively and forwarded verbatim.
    TerminalOutput { tab_id: String, data: String },
    /// A request for the tab failed.
    TerminalError { tab_id: String, message: String },
    /// The remote side ended the tab.
    SessionClosed { tab_id: String },
    /// Acknowledgement of `stop_session`.
    SessionStopped { tab_id: String },
}

impl OutboundEvent {
    /// Returns the wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::SessionStarted { .. } => "session_started",
            OutboundEvent::TerminalOutput { .. } => "terminal_output",
            OutboundEvent::TerminalError { .. } => "terminal_error",
            OutboundEvent::SessionClosed { .. } => "session_closed",
            OutboundEvent::SessionStopped { .. } => "session_stopped",
        }
    }

    /// Returns the tab the event refers to.
    pub fn tab_id(&self) -> &str {
        match self {
            OutboundEvent::SessionStarted { tab_id, .. }
            | OutboundEvent::TerminalOutput { tab_id, .. }
            | OutboundEvent::TerminalError { tab_id, .. }
            | OutboundEvent::SessionClosed { tab_id }
            | OutboundEvent::SessionStopped { tab_id } => tab_id,
        }
    }
}
