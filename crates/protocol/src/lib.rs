//! # TabShell Protocol Library
//!
//! This crate defines the events exchanged between a TabShell client and the
//! daemon, and the codec that turns them into WebSocket text frames.
//!
//! ## Overview
//!
//! A single client connection hosts many terminal tabs. Every event names the
//! tab it addresses:
//!
//! - **Inbound**: `start_session`, `terminal_input`, `terminal_resize`, `stop_session`
//! - **Outbound**: `session_started`, `terminal_output`, `terminal_error`,
//!   `session_closed`, `session_stopped`
//!
//! ## Example Usage
//!
//! ```rust
//! use tabshell_protocol::{EventCodec, InboundEvent, StartSession};
//!
//! let codec = EventCodec::new();
//! let frame = codec
//!     .encode(&InboundEvent::StartSession(StartSession::new("proj", "1").with_size(80, 24)))
//!     .unwrap();
//!
//! let decoded = codec.decode_inbound(&frame).unwrap();
//! assert_eq!(decoded.tab_id(), "1");
//! ```
//!
//! ## Modules
//!
//! - [`events`]: Inbound and outbound event definitions
//! - [`codec`]: JSON frame codec with a size limit
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod events;

pub use codec::{EventCodec, MAX_FRAME_SIZE};
pub use error::{ProtocolError, Result};
pub use events::{
    InboundEvent, OutboundEvent, StartSession, StopSession, TerminalInput, TerminalResize,
    DEFAULT_COLS, DEFAULT_ROWS, DEFAULT_TAB_ID,
};
