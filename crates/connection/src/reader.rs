//! Inbound side of an open connection: buffered frame decoding and the read
//! pump that dispatches decoded frames.

use std::io;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use corews_protocol::constants::{
    KEEP_ALIVE_INTERVAL, MAX_PAYLOAD_SIZE, READ_CHUNK_SIZE, SERVER_READ_TIMEOUT,
};
use corews_protocol::{
    CloseFrame, CloseStatusCode, Frame, FrameError, Opcode, decode_with_limit,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::event::{ConnectionEvent, EventSink};
use crate::sender::Sender;
use crate::state::ConnectionState;

/// Tuning for [`read_pump`].
#[derive(Debug, Clone)]
pub struct ReadOptions {
    /// Upper bound on a single socket read; liveness is re-checked after each.
    pub read_timeout: Duration,
    /// How often to check that the write side is still alive.
    pub keep_alive: Duration,
    /// Drop the connection after this long without inbound bytes.
    pub idle_timeout: Option<Duration>,
    pub max_payload: usize,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            read_timeout: SERVER_READ_TIMEOUT,
            keep_alive: KEEP_ALIVE_INTERVAL,
            idle_timeout: None,
            max_payload: MAX_PAYLOAD_SIZE,
        }
    }
}

/// How a read pump ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// A close frame was exchanged, or the connection was failed with a
    /// protocol status code.
    Closed(CloseFrame),
    /// The stream ended, errored, went idle or was cancelled.
    Lost,
}

impl Disconnect {
    /// Status code to report for this ending.
    pub fn code(&self) -> CloseStatusCode {
        match self {
            Self::Closed(close) => close.code,
            Self::Lost => CloseStatusCode::AbnormalClosure,
        }
    }
}

/// Reads raw bytes into a buffer and splits complete frames off its front.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    masked: bool,
    max_payload: usize,
    last_activity: Instant,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// `buffer` may already hold bytes that arrived with the handshake.
    pub fn new(reader: R, buffer: BytesMut, masked: bool, max_payload: usize) -> Self {
        Self {
            reader,
            buffer,
            masked,
            max_payload,
            last_activity: Instant::now(),
        }
    }

    /// Removes and returns the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_with_limit(&self.buffer, self.masked, self.max_payload)? {
            Some((frame, used)) => {
                self.buffer.advance(used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Reads more bytes from the stream. `Ok(0)` means end of stream.
    pub async fn fill(&mut self) -> io::Result<usize> {
        self.buffer.reserve(READ_CHUNK_SIZE);
        let n = self.reader.read_buf(&mut self.buffer).await?;
        if n > 0 {
            self.last_activity = Instant::now();
        }
        Ok(n)
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}

/// Read pump: decodes frames until the connection ends, then emits the final
/// event and returns how it ended.
///
/// Every complete frame in the buffer is dispatched before the next read, so
/// several frames arriving in one chunk are all delivered in order.
pub async fn read_pump<R, E>(
    mut reader: FrameReader<R>,
    sender: &Sender,
    events: &E,
    cancel: &CancellationToken,
    options: &ReadOptions,
) -> Disconnect
where
    R: AsyncRead + Unpin,
    E: EventSink + ?Sized,
{
    let mut last_liveness = Instant::now();
    let mut inbound = Inbound::new(options.max_payload);

    let outcome = 'pump: loop {
        loop {
            match reader.next_frame() {
                Ok(Some(frame)) => {
                    if let Some(outcome) = inbound.dispatch(frame, sender, events) {
                        break 'pump outcome;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("failing connection: {e}");
                    let code = match e {
                        FrameError::UnexpectedMask { .. } => CloseStatusCode::ProtocolError,
                        FrameError::PayloadTooLarge { .. } => CloseStatusCode::MessageTooBig,
                    };
                    break 'pump fail(sender, code);
                }
            }
        }

        if last_liveness.elapsed() >= options.keep_alive {
            last_liveness = Instant::now();
            if !sender.is_connected() {
                debug!("write side gone, stopping read pump");
                break Disconnect::Lost;
            }
        }

        if let Some(idle) = options.idle_timeout {
            if reader.last_activity().elapsed() >= idle {
                warn!(?idle, "no inbound traffic, dropping connection");
                let _ = sender.close(CloseStatusCode::GoingAway);
                break Disconnect::Lost;
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break Disconnect::Lost,

            res = tokio::time::timeout(options.read_timeout, reader.fill()) => match res {
                Err(_) => {}
                Ok(Ok(0)) => {
                    debug!("peer closed the stream");
                    break Disconnect::Lost;
                }
                Ok(Ok(n)) => trace!(bytes = n, "read"),
                Ok(Err(e)) => {
                    debug!("read error: {e}");
                    break Disconnect::Lost;
                }
            }
        }
    };

    sender.mark_closed();
    events.emit(match &outcome {
        Disconnect::Closed(close) => ConnectionEvent::Closed(close.clone()),
        Disconnect::Lost => ConnectionEvent::Disconnected,
    });
    outcome
}

/// A data message whose first frame arrived without FIN.
struct Partial {
    opcode: Opcode,
    data: Vec<u8>,
}

/// Per-pump dispatch state: the data message being reassembled, if any.
struct Inbound {
    partial: Option<Partial>,
    max_payload: usize,
}

impl Inbound {
    fn new(max_payload: usize) -> Self {
        Self {
            partial: None,
            max_payload,
        }
    }

    /// Handles one decoded frame. Returns `Some` when the connection is done.
    ///
    /// Control frames may arrive between the fragments of a data message and
    /// are handled immediately.
    fn dispatch<E>(&mut self, frame: Frame, sender: &Sender, events: &E) -> Option<Disconnect>
    where
        E: EventSink + ?Sized,
    {
        if sender.state() == ConnectionState::Closing && frame.opcode != Opcode::Close {
            trace!(opcode = ?frame.opcode, "discarding frame while closing");
            return None;
        }

        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if let Some(partial) = self.partial.take() {
                    warn!(
                        dropped = partial.data.len(),
                        "new message before the previous one finished, dropping fragments"
                    );
                }
                if frame.fin {
                    return deliver(frame.opcode, frame.payload, sender, events);
                }
                self.partial = Some(Partial {
                    opcode: frame.opcode,
                    data: frame.payload,
                });
            }
            Opcode::Continuation => match self.partial.take() {
                Some(mut partial) => {
                    if partial.data.len() + frame.payload.len() > self.max_payload {
                        warn!(max = self.max_payload, "fragmented message too large");
                        return Some(fail(sender, CloseStatusCode::MessageTooBig));
                    }
                    partial.data.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return deliver(partial.opcode, partial.data, sender, events);
                    }
                    self.partial = Some(partial);
                }
                // Not part of a message this side saw start; pass the bytes on.
                None => {
                    if !frame.payload.is_empty() {
                        events.emit(ConnectionEvent::Continuation(frame.payload));
                    }
                }
            },
            Opcode::Ping => {
                if sender.send(Frame::pong()).is_err() {
                    debug!("could not queue pong");
                }
                events.emit(ConnectionEvent::Ping(frame.payload));
            }
            Opcode::Pong => events.emit(ConnectionEvent::Pong(frame.payload)),
            Opcode::Close => {
                let close = CloseFrame::from_payload(&frame.payload);
                debug!(code = %close.code, reason = %close.reason, "close frame received");
                if !sender.close_sent() {
                    let _ = sender.close(close.code);
                }
                return Some(Disconnect::Closed(close));
            }
            Opcode::Reserved(op) => warn!(opcode = op, "ignoring frame with reserved opcode"),
        }
        None
    }
}

/// Emits a complete data message. Text must be valid UTF-8 as a whole.
fn deliver<E>(opcode: Opcode, data: Vec<u8>, sender: &Sender, events: &E) -> Option<Disconnect>
where
    E: EventSink + ?Sized,
{
    if data.is_empty() {
        return None;
    }
    match opcode {
        Opcode::Text => match String::from_utf8(data) {
            Ok(text) => events.emit(ConnectionEvent::Text(text)),
            Err(_) => {
                warn!("text message is not valid UTF-8");
                return Some(fail(sender, CloseStatusCode::InvalidPayload));
            }
        },
        _ => events.emit(ConnectionEvent::Binary(data)),
    }
    None
}

/// Queues a close with `code` and reports the connection as closed with it.
fn fail(sender: &Sender, code: CloseStatusCode) -> Disconnect {
    let _ = sender.close(code);
    Disconnect::Closed(CloseFrame::new(code, ""))
}
