//! Network module for client connections.
//!
//! Clients connect over WebSocket and exchange JSON event frames (see
//! [`tabshell_protocol::codec`]). Each accepted socket is bridged to a
//! dispatcher registered with the [`crate::router::EventRouter`].

pub mod websocket;

pub use websocket::{encode_frames, serve_connection, ConnectionObserver, OUTBOUND_BUFFER_SIZE};
