//! JSON text-frame codec for events.
//!
//! # Frame Format
//!
//! One event per text frame:
//!
//! ```text
//! {"event": "terminal_input", "data": {"tab_id": "1", "data": "ls\n"}}
//! ```
//!
//! A frame without `data` (or with `"data": null`) is treated as carrying an
//! empty object, so `{"event": "stop_session"}` stops the default tab.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::events::{InboundEvent, OutboundEvent};

/// Maximum frame size (1 MB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Encoder/decoder for event frames.
#[derive(Debug, Clone, Copy)]
pub struct EventCodec {
    max_frame_size: usize,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    /// Create a codec with the default frame size limit.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom frame size limit.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the configured frame size limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode an event into a text frame.
    pub fn encode<T: Serialize>(&self, event: &T) -> Result<String> {
        let frame = serde_json::to_string(event)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.check_size(frame.len())?;
        Ok(frame)
    }

    /// Decode a client frame.
    pub fn decode_inbound(&self, frame: &str) -> Result<InboundEvent> {
        self.decode(frame)
    }

    /// Decode a daemon frame.
    pub fn decode_outbound(&self, frame: &str) -> Result<OutboundEvent> {
        self.decode(frame)
    }

    fn decode<T: DeserializeOwned>(&self, frame: &str) -> Result<T> {
        self.check_size(frame.len())?;

        let mut value: Value = serde_json::from_str(frame)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| ProtocolError::InvalidFrame("frame is not a JSON object".to_string()))?;

        if !object.get("event").is_some_and(Value::is_string) {
            return Err(ProtocolError::InvalidFrame(
                "missing string field `event`".to_string(),
            ));
        }

        if object.get("data").is_none_or(Value::is_null) {
            object.insert("data".to_string(), Value::Object(Default::default()));
        }

        Ok(serde_json::from_value(value)?)
    }

    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }
}
