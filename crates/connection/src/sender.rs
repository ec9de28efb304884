//! Outbound side of an open connection: the cloneable [`Sender`] handle and
//! the write pump that owns the write half of the stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use corews_protocol::constants::CLOSE_FLUSH_TIMEOUT;
use corews_protocol::{CloseFrame, CloseStatusCode, Frame, Opcode, frame};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::state::{ConnectionState, Role, SharedState};

/// Error returned when a frame could not be queued.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("send failed: buffer full or connection closed")]
    Unavailable,
    #[error("connection is closing")]
    Closing,
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle for queueing frames on an open connection.
///
/// Cloneable and cheap. All writes go through one queue drained by the write
/// pump, so frames from different clones never interleave on the wire.
#[derive(Clone)]
pub struct Sender {
    tx: mpsc::Sender<Frame>,
    close_sent: Arc<AtomicBool>,
    state: SharedState,
}

impl Sender {
    /// Queues a frame. Data frames are refused once a close frame was queued.
    pub fn send(&self, frame: Frame) -> Result<(), SendError> {
        if frame.opcode == Opcode::Close {
            let close = CloseFrame::from_payload(&frame.payload);
            return self.close_with(close);
        }
        if self.close_sent.load(Ordering::Acquire) {
            return Err(SendError::Closing);
        }
        self.tx.try_send(frame).map_err(|_| {
            tracing::warn!("send buffer full or closed, dropping frame");
            SendError::Unavailable
        })
    }

    pub fn send_text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.send(Frame::binary(data))
    }

    /// Serializes `value` as JSON and sends it as a text frame.
    pub fn send_json<T: Serialize>(&self, value: &T) -> Result<(), SendError> {
        let json = serde_json::to_string(value)?;
        self.send_text(json)
    }

    pub fn send_ping(&self) -> Result<(), SendError> {
        self.send(Frame::ping())
    }

    /// Starts the close handshake with `code` and an empty reason.
    pub fn close(&self, code: CloseStatusCode) -> Result<(), SendError> {
        self.close_with(CloseFrame::new(code, ""))
    }

    /// Starts the close handshake. Only the first call queues a frame.
    pub fn close_with(&self, close: CloseFrame) -> Result<(), SendError> {
        if self.close_sent.swap(true, Ordering::AcqRel) {
            return Err(SendError::Closing);
        }
        self.state.advance(ConnectionState::Closing);
        debug!(code = %close.code, "queueing close frame");
        self.tx
            .try_send(Frame::close_with(&close))
            .map_err(|_| SendError::Unavailable)
    }

    /// Returns `true` if the write pump is still running.
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Returns `true` once a close frame has been queued from this side.
    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub(crate) fn mark_closed(&self) {
        self.state.advance(ConnectionState::Closed);
    }
}

/// Creates the send queue for a connection. The receiver goes to
/// [`write_pump`].
pub(crate) fn channel(state: SharedState, capacity: usize) -> (Sender, mpsc::Receiver<Frame>) {
    let (tx, rx) = mpsc::channel(capacity);
    let sender = Sender {
        tx,
        close_sent: Arc::new(AtomicBool::new(false)),
        state,
    };
    (sender, rx)
}

/// Write pump: drains the send queue onto the stream.
///
/// Stops after writing a close frame, on a write error, or on cancel. On
/// cancel it flushes what is already queued and, unless a close frame went
/// out, sends a best-effort `GoingAway` before shutting the write half down.
pub(crate) async fn write_pump<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Frame>,
    role: Role,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mask = role.masks_outbound();
    let mut close_written = false;
    let mut healthy = true;

    loop {
        tokio::select! {
            biased;

            msg = rx.recv() => match msg {
                Some(frame) => {
                    let is_close = frame.opcode == Opcode::Close;
                    if let Err(e) = write_frame(&mut writer, &frame, mask).await {
                        error!("write pump error: {e}");
                        healthy = false;
                        break;
                    }
                    if is_close {
                        close_written = true;
                        break;
                    }
                }
                None => break,
            },

            _ = cancel.cancelled() => {
                let flushed = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, async {
                    while let Ok(frame) = rx.try_recv() {
                        let is_close = frame.opcode == Opcode::Close;
                        write_frame(&mut writer, &frame, mask).await?;
                        if is_close {
                            return Ok::<bool, std::io::Error>(true);
                        }
                    }
                    Ok(false)
                })
                .await;
                match flushed {
                    Ok(Ok(closed)) => close_written = closed,
                    _ => healthy = false,
                }
                break;
            }
        }
    }

    rx.close();

    if healthy && !close_written {
        let goodbye = Frame::close(CloseStatusCode::GoingAway);
        let write = write_frame(&mut writer, &goodbye, mask);
        let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, write).await;
    }
    let _ = tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, writer.shutdown()).await;
    trace!("write pump stopped");
}

async fn write_frame<W>(writer: &mut W, frame: &Frame, mask: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame::encode(frame, mask);
    writer.write_all(&bytes).await?;
    writer.flush().await
}
