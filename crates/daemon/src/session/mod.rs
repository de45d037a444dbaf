//! Session management module.
//!
//! This module provides the remote shell session lifecycle, the output pump
//! feeding remote output back to the owner of a session, and the registry of
//! tabs per client connection.

pub mod lifecycle;
pub mod pump;
pub mod registry;

pub use lifecycle::{
    initial_command, resolve_workspace, ConnectionId, Session, SessionError, SessionEvent,
    SessionKey, SessionSettings, SessionSink, SessionState, TabId, INPUT_QUEUE_CAPACITY,
};
pub use pump::{OutputPump, Utf8Decoder, READ_CHUNK_SIZE};
pub use registry::{ClientRegistry, RegistryError, TabSlot, DEFAULT_MAX_TABS};
