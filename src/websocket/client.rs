//! A connected WebSocket peer.
//!
//! # Responsibilities
//! - Own the transport handed over by the upgrade
//! - Read whole frames, buffering across transport reads
//! - Write single unfragmented frames
//! - Close: send a close frame, then shut the transport down regardless
//!
//! # Design Decisions
//! - Reads and writes are independent halves behind their own locks, so a
//!   task blocked in `read` never stalls a broadcast writing to this client
//! - Bytes past the end of a decoded frame stay buffered for the next read
//! - Frames declaring a payload above `max_frame_size` are refused before
//!   any of the payload is buffered
//! - Ping and pong are returned to the caller like any other frame

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::io::{split, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex};

use super::frame::{self, Frame, Opcode};
use super::handshake::WsError;
use crate::http::writer::BoxTransport;

static CLIENT_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique client identifier, increasing in creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn next() -> Self {
        Self(CLIENT_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ws-{}", self.0)
    }
}

struct ReadState {
    half: Option<ReadHalf<BoxTransport>>,
    buffer: Vec<u8>,
}

/// One upgraded connection.
pub struct Client {
    id: ClientId,
    reader: Mutex<ReadState>,
    writer: Mutex<Option<WriteHalf<BoxTransport>>>,
    closed: watch::Sender<bool>,
    max_frame_size: usize,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Resolves once the watched flag becomes true or its sender is gone.
pub(crate) async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl Client {
    /// Wrap a transport whose handshake has already completed.
    pub fn from_transport(transport: BoxTransport, max_frame_size: usize) -> Self {
        let (read_half, write_half) = split(transport);
        let (closed, _) = watch::channel(false);
        Self {
            id: ClientId::next(),
            reader: Mutex::new(ReadState {
                half: Some(read_half),
                buffer: Vec::new(),
            }),
            writer: Mutex::new(Some(write_half)),
            closed,
            max_frame_size,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Read the next frame, using `buf` as scratch space for transport reads.
    ///
    /// Returns the frame and the number of bytes pulled from the transport
    /// during this call, which is zero when the frame was already buffered.
    pub async fn read(&self, buf: &mut [u8]) -> Result<(Frame, usize), WsError> {
        if buf.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "read buffer must not be empty",
            )
            .into());
        }

        let mut closed = self.closed.subscribe();
        let mut state = self.reader.lock().await;
        let mut pulled = 0;

        loop {
            match frame::decode_header(&state.buffer) {
                Ok(header) if header.payload_len > self.max_frame_size as u64 => {
                    return Err(WsError::FrameTooLarge {
                        length: header.payload_len,
                        max: self.max_frame_size,
                    });
                }
                Ok(_) => match frame::decode_prefix(&state.buffer) {
                    Ok((frame, used)) => {
                        state.buffer.drain(..used);
                        return Ok((frame, pulled));
                    }
                    Err(err) if err.is_protocol_violation() => return Err(err.into()),
                    Err(_) => {}
                },
                Err(err) if err.is_protocol_violation() => return Err(err.into()),
                Err(_) => {}
            }

            let read = {
                let Some(half) = state.half.as_mut() else {
                    return Err(WsError::Closed);
                };
                tokio::select! {
                    read = half.read(buf) => Some(read),
                    _ = closed_signal(&mut closed) => None,
                }
            };

            match read {
                None => {
                    state.half = None;
                    return Err(WsError::Closed);
                }
                Some(Ok(0)) => {
                    state.half = None;
                    return Err(WsError::Closed);
                }
                Some(Ok(n)) => {
                    pulled += n;
                    state.buffer.extend_from_slice(&buf[..n]);
                }
                Some(Err(err)) => return Err(err.into()),
            }
        }
    }

    /// Encode and send one frame. Returns the number of bytes written.
    pub async fn write(&self, payload: &[u8], opcode: Opcode) -> Result<usize, WsError> {
        self.send_encoded(&frame::encode(payload, opcode)).await
    }

    /// Send an already encoded frame.
    pub(crate) async fn send_encoded(&self, bytes: &[u8]) -> Result<usize, WsError> {
        let mut writer = self.writer.lock().await;
        let half = writer.as_mut().ok_or(WsError::Closed)?;
        half.write_all(bytes).await?;
        half.flush().await?;
        Ok(bytes.len())
    }

    /// Send a close frame carrying `code` and `reason`, then close the transport.
    ///
    /// The transport is closed even when sending the frame fails; that failure
    /// is still returned.
    pub async fn close(&self, reason: &str, code: u16) -> Result<(), WsError> {
        let bytes = frame::encode(&frame::close_payload(code, reason.as_bytes()), Opcode::Close);

        let mut writer = self.writer.lock().await;
        let result = match writer.as_mut() {
            Some(half) => match half.write_all(&bytes).await {
                Ok(()) => half.flush().await.map_err(WsError::from),
                Err(err) => Err(err.into()),
            },
            None => Err(WsError::Closed),
        };
        if let Some(mut half) = writer.take() {
            let _ = half.shutdown().await;
        }
        drop(writer);

        self.closed.send_replace(true);
        if let Ok(mut state) = self.reader.try_lock() {
            state.half = None;
        }
        tracing::debug!(client_id = %self.id, code, "WebSocket closed");
        result
    }
}
