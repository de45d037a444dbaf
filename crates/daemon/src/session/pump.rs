//! Output pump: remote process output → session events.
//!
//! Reads the remote output in chunks of up to [`READ_CHUNK_SIZE`] bytes,
//! decodes it permissively and delivers it in order. The next chunk is not
//! read until the previous one has been accepted by the session's sink, so a
//! slow consumer slows the remote down instead of piling up output. When the
//! stream ends (EOF or error) the session is closed with notification. When
//! the session is closed from elsewhere, its cancellation token stops the pump.

use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::Session;
use crate::remote::ProcessOutput;

/// Maximum number of bytes read per chunk.
pub const READ_CHUNK_SIZE: usize = 4096;

/// Incremental UTF-8 decoder.
///
/// Multi-byte sequences split across chunks are carried over instead of being
/// replaced, so decoding a stream chunk by chunk yields exactly what
/// [`String::from_utf8_lossy`] yields for the whole stream.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes `chunk`, holding back a trailing incomplete sequence.
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(chunk);

        let mut out = String::with_capacity(bytes.len());
        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flushes a dangling incomplete sequence at end of stream.
    pub fn finish(&mut self) -> String {
        if self.pending.is_empty() {
            String::new()
        } else {
            self.pending.clear();
            char::REPLACEMENT_CHARACTER.to_string()
        }
    }
}

/// Moves bytes from a remote process to its session.
pub struct OutputPump;

impl OutputPump {
    /// Starts pumping `output` into `session`.
    pub fn spawn(session: Session, output: ProcessOutput) -> JoinHandle<()> {
        tokio::spawn(Self::run(session, output))
    }

    async fn run(session: Session, mut output: ProcessOutput) {
        let cancel = session.cancellation_token();
        let mut decoder = Utf8Decoder::new();
        let mut buffer = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(tab_id = %session.tab_id(), "Output pump cancelled");
                    return;
                }
                read = output.read(&mut buffer) => read,
            };

            let (text, ended) = match read {
                Ok(0) => {
                    tracing::info!(tab_id = %session.tab_id(), "Remote process output ended");
                    (decoder.finish(), true)
                }
                Ok(n) => (decoder.decode(&buffer[..n]), false),
                Err(e) => {
                    if !session.is_connected() {
                        break;
                    }
                    tracing::warn!(tab_id = %session.tab_id(), error = %e, "Error reading remote output");
                    (format!("\r\n[Read Error] {}\r\n", e), true)
                }
            };

            if !text.is_empty() && !Self::forward(&session, &cancel, text).await {
                return;
            }
            if ended {
                break;
            }
        }

        session.close(false).await;
    }

    /// Hands `text` to the session's sink. Returns `false` if the session was
    /// closed while waiting for the sink.
    async fn forward(session: &Session, cancel: &CancellationToken, text: String) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(tab_id = %session.tab_id(), "Output pump cancelled while delivering");
                false
            }
            _ = session.emit_output(text) => true,
        }
    }
}
