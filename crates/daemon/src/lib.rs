//! # TabShell Daemon Library
//!
//! This crate provides the daemon (server) side of TabShell: it lets one
//! client connection drive several remote terminal tabs at once.
//!
//! ## Overview
//!
//! Each tab is an interactive program started in a workspace directory on
//! the configured host, reached through `ssh` under a pseudo-terminal. The
//! daemon provides:
//!
//! - **Tab Sessions**: Open, feed, resize and release remote PTY sessions
//! - **Output Pumping**: Stream remote output to the owning client
//! - **Client Registry**: Track which tabs each client owns
//! - **Event Routing**: Map client events to tab operations
//! - **WebSocket Transport**: JSON event frames over WebSocket
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     Daemon Orchestrator                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────┐        ┌──────────────────────────┐  │
//! │  │ WebSocket listener │ ─────▶ │ Event Router             │  │
//! │  └────────────────────┘        │ (one dispatcher/client)  │  │
//! │                                └────────────┬─────────────┘  │
//! │  ┌────────────────────┐        ┌────────────▼─────────────┐  │
//! │  │ Client Registry    │ ◀────▶ │ Sessions + Output Pumps  │  │
//! │  └────────────────────┘        └────────────┬─────────────┘  │
//! │                                ┌────────────▼─────────────┐  │
//! │                                │ Remote executor (ssh)    │  │
//! │                                └──────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Wait for shutdown signal...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`remote`]: Remote executor abstraction and the `ssh` backend
//! - [`session`]: Tab sessions, output pumps and the client registry
//! - [`router`]: Client event routing
//! - [`network`]: WebSocket transport
//! - [`orchestrator`]: Main daemon coordinator
//! - [`pidfile`]: Running-daemon detection

pub mod config;
pub mod network;
pub mod orchestrator;
pub mod pidfile;
pub mod remote;
pub mod router;
pub mod session;

// Re-export protocol for convenience
pub use tabshell_protocol as protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export remote types for convenience
pub use remote::{
    AuthMethod, Credentials, RemoteConnection, RemoteError, RemoteExecutor, RemoteProcess,
    SshExecutor,
};

// Re-export session types for convenience
pub use session::{
    ClientRegistry, OutputPump, RegistryError, Session, SessionError, SessionEvent,
    SessionSettings, SessionSink, SessionState,
};

// Re-export router types for convenience
pub use router::{ConnectionHandle, EventRouter, RouterError};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};

// Re-export pidfile types for convenience
pub use pidfile::{PidFile, PidFileError};
