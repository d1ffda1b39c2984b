//! Response writer for the delegated backend.
//!
//! # Responsibilities
//! - Buffer a handler's response and hand it to the host server as one value
//! - Support hijack by giving the handler one end of an in-memory pipe
//! - Turn the handshake head written into the pipe back into a response the
//!   host server can complete the upgrade with
//!
//! # Design Decisions
//! - The outcome (complete response or hijacked pipe) travels over a oneshot,
//!   so the handler can keep running after the host server got its response
//! - The pipe is bridged to the upgraded connection by the backend, not here

use std::io;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use tokio::io::{duplex, AsyncRead, AsyncReadExt, DuplexStream};
use tokio::sync::oneshot;

use super::writer::{BoxTransport, HijackError, ResponseWriter};

/// Buffer size of each direction of the hijack pipe.
const HIJACK_PIPE_CAPACITY: usize = 64 * 1024;

/// Largest response head accepted back from a hijacker.
const MAX_UPGRADE_HEAD: usize = 16 * 1024;

/// What the handler did with the connection.
#[derive(Debug)]
pub enum Outcome {
    /// A regular response, ready for the host server.
    Complete(Response),
    /// The handler took the connection; this is the host-side pipe end.
    Hijacked(DuplexStream),
}

/// Buffers one response for the host HTTP server.
pub struct BufferedResponseWriter {
    headers: HeaderMap,
    status: StatusCode,
    started: bool,
    hijacked: bool,
    body: Vec<u8>,
    outcome: Option<oneshot::Sender<Outcome>>,
}

impl BufferedResponseWriter {
    pub fn new() -> (Self, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                headers: HeaderMap::new(),
                status: StatusCode::OK,
                started: false,
                hijacked: false,
                body: Vec::new(),
                outcome: Some(tx),
            },
            rx,
        )
    }

    /// Deliver the buffered response unless the connection was hijacked.
    pub fn finish(mut self) {
        let Some(tx) = self.outcome.take() else {
            return;
        };
        let mut response = Response::new(Body::from(std::mem::take(&mut self.body)));
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        // The receiver is gone only if the host server dropped the request.
        let _ = tx.send(Outcome::Complete(response));
    }
}

#[async_trait]
impl ResponseWriter for BufferedResponseWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    async fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked.into());
        }
        if !self.started {
            self.status = status;
            self.started = true;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked.into());
        }
        self.started = true;
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn hijack(&mut self) -> Result<BoxTransport, HijackError> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked);
        }
        if self.started {
            return Err(HijackError::ResponseStarted);
        }
        let tx = self.outcome.take().ok_or(HijackError::Unsupported)?;
        let (handler_end, host_end) = duplex(HIJACK_PIPE_CAPACITY);
        tx.send(Outcome::Hijacked(host_end))
            .map_err(|_| HijackError::Unsupported)?;
        self.hijacked = true;
        Ok(Box::new(handler_end))
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn invalid(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

fn parse_head(head: &[u8]) -> io::Result<Response> {
    let text = std::str::from_utf8(head).map_err(|_| invalid("response head is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let code = status_line
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| invalid(format!("bad status line {status_line:?}")))?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = code;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid(format!("bad header line {line:?}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|e| invalid(e.to_string()))?;
        response.headers_mut().append(name, value);
    }
    Ok(response)
}

/// Read the response head a hijacker wrote into the pipe.
///
/// Returns the head as a response plus any bytes written after it.
pub async fn read_upgrade_head<R>(pipe: &mut R) -> io::Result<(Response, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    let end = loop {
        if let Some(end) = find_head_end(&buf) {
            break end;
        }
        if buf.len() > MAX_UPGRADE_HEAD {
            return Err(invalid("upgrade response head too large"));
        }
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    };
    let leftover = buf.split_off(end);
    Ok((parse_head(&buf)?, leftover))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn finish_delivers_buffered_response() {
        let (mut writer, rx) = BufferedResponseWriter::new();
        writer
            .headers_mut()
            .insert("x-kind", HeaderValue::from_static("buffered"));
        writer.write_header(StatusCode::CREATED).await.unwrap();
        writer.write(b"body").await.unwrap();
        writer.finish();

        let Outcome::Complete(response) = rx.await.unwrap() else {
            panic!("expected a complete response");
        };
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-kind"], "buffered");
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"body");
    }

    #[tokio::test]
    async fn hijack_hands_over_a_pipe() {
        let (mut writer, rx) = BufferedResponseWriter::new();
        let mut transport = writer.hijack().unwrap();
        assert_eq!(writer.hijack().err(), Some(HijackError::AlreadyHijacked));
        assert!(writer.write(b"late").await.is_err());

        transport
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\r\n\x81\x02hi")
            .await
            .unwrap();

        let Outcome::Hijacked(mut pipe) = rx.await.unwrap() else {
            panic!("expected a hijacked pipe");
        };
        let (response, leftover) = read_upgrade_head(&mut pipe).await.unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);
        assert_eq!(response.headers()["upgrade"], "websocket");
        assert_eq!(leftover, b"\x81\x02hi");
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut input: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\n";
        assert!(read_upgrade_head(&mut input).await.is_err());
    }
}
