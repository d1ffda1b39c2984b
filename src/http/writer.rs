//! Response writer abstraction shared by every backend.
//!
//! # Responsibilities
//! - Header map that handlers fill before the response starts
//! - Status line + headers emitted once, on `write_header` or first `write`
//! - One-time hijack handing the raw transport to the caller
//!
//! # Design Decisions
//! - Headers changed after the response started are silently ignored
//! - Hijack and a started response are mutually exclusive
//! - Transports are boxed trait objects so handlers never see the backend type

use std::io;

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// A byte stream a hijacker can own: TCP socket, TLS stream, in-memory pipe.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Owned, type-erased transport.
pub type BoxTransport = Box<dyn Transport>;

/// Reasons a hijack can be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HijackError {
    #[error("connection has already been hijacked")]
    AlreadyHijacked,

    #[error("response already started, cannot hijack")]
    ResponseStarted,

    #[error("this connection does not support hijacking")]
    Unsupported,
}

impl From<HijackError> for io::Error {
    fn from(err: HijackError) -> Self {
        io::Error::new(io::ErrorKind::NotConnected, err)
    }
}

/// Sink for one HTTP response.
#[async_trait]
pub trait ResponseWriter: Send {
    /// Headers that will be sent with the status line.
    fn headers(&self) -> &HeaderMap;

    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Status sent, or to be sent, with the response.
    fn status(&self) -> StatusCode;

    /// True once the status line has been emitted.
    fn is_started(&self) -> bool;

    /// True once the transport has been taken by `hijack`.
    fn is_hijacked(&self) -> bool;

    /// Emit the status line and headers. Later calls are no-ops.
    async fn write_header(&mut self, status: StatusCode) -> io::Result<()>;

    /// Append body bytes, emitting a 200 header first if needed.
    async fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Take exclusive, irreversible ownership of the underlying transport.
    fn hijack(&mut self) -> Result<BoxTransport, HijackError>;

    /// Replace a header value.
    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers_mut().insert(name, value);
    }

    /// Write a complete response in one call.
    async fn send(&mut self, status: StatusCode, body: &[u8]) -> io::Result<()> {
        self.write_header(status).await?;
        if !body.is_empty() {
            self.write(body).await?;
        }
        Ok(())
    }
}

/// Render a lowercase header name in the conventional `Content-Type` form.
pub fn canonical_header_name(name: &HeaderName) -> String {
    let mut out = String::with_capacity(name.as_str().len());
    let mut upper = true;
    for ch in name.as_str().chars() {
        if upper {
            out.extend(ch.to_uppercase());
        } else {
            out.push(ch);
        }
        upper = ch == '-';
    }
    out
}

/// Serialize a status line and header block, terminated by the blank line.
pub fn render_head(status: StatusCode, headers: &HeaderMap) -> Vec<u8> {
    let mut head = Vec::with_capacity(128);
    head.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in headers {
        head.extend_from_slice(canonical_header_name(name).as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn canonical_names() {
        assert_eq!(canonical_header_name(&header::CONTENT_TYPE), "Content-Type");
        assert_eq!(
            canonical_header_name(&HeaderName::from_static("sec-websocket-accept")),
            "Sec-Websocket-Accept"
        );
        assert_eq!(canonical_header_name(&header::ETAG), "Etag");
    }

    #[test]
    fn head_keeps_multi_valued_headers_on_separate_lines() {
        let mut headers = HeaderMap::new();
        headers.append(header::SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(header::SET_COOKIE, HeaderValue::from_static("b=2"));
        let head = String::from_utf8(render_head(StatusCode::NOT_FOUND, &headers)).unwrap();
        assert_eq!(
            head,
            "HTTP/1.1 404 Not Found\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n"
        );
    }
}
