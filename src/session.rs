//! Streaming session.
//!
//! One session serves one live job to one connected client. The session
//! drains the pipeline's frame queue with a bounded wait: frames are
//! serialized to the wire protocol, quiet intervals produce a keepalive
//! ping, and a terminal pipeline error is forwarded to the client before
//! the session ends. Cancellation is cooperative through a shared token
//! observed by both this loop and the blocking pipeline loop.

use crate::pipeline::{FrameMessage, FrameQueue};
use crate::source::encode_frame;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors sending to the client.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Client disconnected")]
    Disconnected,

    #[error("Send failed: {0}")]
    Send(String),
}

/// Messages of the streaming wire protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    /// A processed frame with cumulative per-zone counts
    Frame {
        frame: String,
        counts: BTreeMap<usize, u64>,
    },
    /// Keepalive when no frame arrived within the timeout
    Ping,
    /// Terminal error, sent immediately before the connection closes
    Error { message: String },
}

impl WireMessage {
    pub fn frame(message: &FrameMessage) -> Self {
        WireMessage::Frame {
            frame: encode_frame(&message.image),
            counts: message.counts.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        WireMessage::Error {
            message: message.into(),
        }
    }

    /// Serialize to the JSON wire format.
    pub fn to_json(&self) -> String {
        match self {
            WireMessage::Frame { frame, counts } => serde_json::json!({
                "type": "frame",
                "frame": frame,
                "counts": counts,
            })
            .to_string(),
            WireMessage::Ping => serde_json::json!({"type": "ping"}).to_string(),
            WireMessage::Error { message } => {
                serde_json::json!({"error": message}).to_string()
            }
        }
    }
}

/// Transport the session sends into. Production uses the WebSocket sink in
/// the API layer; tests record messages.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, message: WireMessage) -> Result<(), SinkError>;
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The source reached end of stream
    SourceEnded,
    /// The source failed; the error was forwarded to the client
    SourceFailed,
    /// The client disconnected or a send failed
    ClientGone,
    /// The session was stopped externally
    Stopped,
}

/// Drive one streaming session until the pipeline ends, the client goes
/// away, or the token is cancelled.
///
/// Every exit path cancels the token, so the caller only has to await the
/// pipeline task afterward to guarantee the capture resource is released.
pub async fn run_session(
    queue: Arc<FrameQueue>,
    sink: &mut dyn FrameSink,
    token: CancellationToken,
    keepalive: Duration,
) -> SessionEnd {
    let end = session_loop(&queue, sink, &token, keepalive).await;
    token.cancel();
    debug!(?end, "Streaming session ended");
    end
}

async fn session_loop(
    queue: &FrameQueue,
    sink: &mut dyn FrameSink,
    token: &CancellationToken,
    keepalive: Duration,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return SessionEnd::Stopped,
            next = tokio::time::timeout(keepalive, queue.recv()) => next,
        };

        match next {
            Ok(Some(frame)) => {
                metrics::counter!("zonewatch.session.frames_sent").increment(1);
                if let Err(e) = sink.send(WireMessage::frame(&frame)).await {
                    info!(error = %e, "Client send failed");
                    return SessionEnd::ClientGone;
                }
            }
            Ok(None) => {
                return match queue.error() {
                    Some(message) => {
                        warn!(error = %message, "Forwarding pipeline error to client");
                        if let Err(e) = sink.send(WireMessage::error(message)).await {
                            info!(error = %e, "Client gone before error delivery");
                        }
                        SessionEnd::SourceFailed
                    }
                    None => SessionEnd::SourceEnded,
                };
            }
            Err(_) => {
                // No frame within the keepalive window; signal liveness
                if let Err(e) = sink.send(WireMessage::Ping).await {
                    info!(error = %e, "Client send failed on keepalive");
                    return SessionEnd::ClientGone;
                }
            }
        }
    }
}
