//! WebSocket transport.
//!
//! One task per client reads frames and feeds the connection's dispatcher; a
//! writer task drains outbound events into the socket. The transport ends when
//! the client closes, the socket fails, or the daemon shuts down; in every
//! case the connection is disconnected from the router so its tabs are torn
//! down.
//!
//! Terminal output too large for one frame is split over several frames at
//! character boundaries.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tabshell_protocol::{EventCodec, OutboundEvent, ProtocolError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::EventRouter;
use crate::session::ConnectionId;

/// Outbound events queued per client before its tabs are held back.
pub const OUTBOUND_BUFFER_SIZE: usize = 256;

/// How long queued events may take to flush once the client is disconnected.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Encodes `event` into one or more text frames.
///
/// Terminal output that does not fit the codec's frame limit is halved at a
/// character boundary until every piece fits, so the frames carry the data in
/// order and in full.
pub fn encode_frames(
    codec: &EventCodec,
    event: OutboundEvent,
) -> Result<Vec<String>, ProtocolError> {
    let mut frames = Vec::new();
    push_frames(codec, event, &mut frames)?;
    Ok(frames)
}

fn push_frames(
    codec: &EventCodec,
    event: OutboundEvent,
    frames: &mut Vec<String>,
) -> Result<(), ProtocolError> {
    let too_large = match codec.encode(&event) {
        Ok(frame) => {
            frames.push(frame);
            return Ok(());
        }
        Err(e @ ProtocolError::FrameTooLarge { .. }) => e,
        Err(e) => return Err(e),
    };

    match event {
        OutboundEvent::TerminalOutput { tab_id, data } if data.chars().nth(1).is_some() => {
            let half = data.chars().count() / 2;
            let mid = data
                .char_indices()
                .nth(half)
                .map_or(data.len(), |(index, _)| index);
            let (head, tail) = data.split_at(mid);

            push_frames(
                codec,
                OutboundEvent::TerminalOutput {
                    tab_id: tab_id.clone(),
                    data: head.to_string(),
                },
                frames,
            )?;
            push_frames(
                codec,
                OutboundEvent::TerminalOutput {
                    tab_id,
                    data: tail.to_string(),
                },
                frames,
            )
        }
        _ => Err(too_large),
    }
}

/// Hooks invoked as a client connects and disconnects.
pub trait ConnectionObserver: Send + Sync {
    fn connected(&self, connection_id: &str, peer: SocketAddr);
    fn disconnected(&self, connection_id: &str);
}

/// Serves one client socket until it closes or `shutdown` fires.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    connection_id: ConnectionId,
    router: Arc<EventRouter>,
    codec: EventCodec,
    shutdown: CancellationToken,
    observer: Option<Arc<dyn ConnectionObserver>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(codec.max_frame_size());
    ws_config.max_frame_size = Some(codec.max_frame_size());

    let ws_stream = match tokio_tungstenite::accept_async_with_config(stream, Some(ws_config)).await
    {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundEvent>(OUTBOUND_BUFFER_SIZE);
    let handle = router.connect(connection_id.clone(), outbound_tx);

    info!(connection_id = %connection_id, peer = %peer, "WebSocket client connected");
    if let Some(observer) = &observer {
        observer.connected(&connection_id, peer);
    }

    let writer_id = connection_id.clone();
    let mut writer = tokio::spawn(async move {
        'events: while let Some(event) = outbound_rx.recv().await {
            let name = event.name();
            let frames = match encode_frames(&codec, event) {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(connection_id = %writer_id, event = name, error = %e, "Dropping unencodable event");
                    continue;
                }
            };
            for frame in frames {
                if let Err(e) = ws_sink.send(WsMessage::Text(frame)).await {
                    debug!(connection_id = %writer_id, error = %e, "WebSocket send failed");
                    break 'events;
                }
            }
        }
        let _ = ws_sink.close().await;
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(connection_id = %connection_id, "Closing connection for shutdown");
                break;
            }
            message = ws_stream.next() => match message {
                Some(Ok(WsMessage::Text(text))) => match codec.decode_inbound(&text) {
                    Ok(event) => {
                        let dispatched = tokio::select! {
                            _ = shutdown.cancelled() => false,
                            dispatched = handle.dispatch(event) => dispatched,
                        };
                        if !dispatched {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(connection_id = %connection_id, error = %e, "Ignoring malformed frame");
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection_id = %connection_id, error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    // Releases every tab; the dispatcher drops the outbound sender on exit,
    // which lets the writer finish.
    handle.disconnect().await;
    match tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(connection_id = %connection_id, error = %e, "WebSocket writer task failed");
        }
        Err(_) => {
            debug!(connection_id = %connection_id, "Client stopped reading, abandoning queued events");
            writer.abort();
        }
    }

    info!(connection_id = %connection_id, "WebSocket client disconnected");
    if let Some(observer) = &observer {
        observer.disconnected(&connection_id);
    }
}
