//! Raw HTTP/1.1 response serialization onto a byte stream.
//!
//! Used by the thread-per-connection and reactor backends, which own the
//! socket directly. The delegated backend uses [`super::buffered`] instead.

use std::io;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufStream};

use super::writer::{render_head, BoxTransport, HijackError, ResponseWriter};

/// Writes one response directly onto a buffered connection.
pub struct RawResponseWriter<S> {
    stream: Option<BufStream<S>>,
    headers: HeaderMap,
    status: StatusCode,
    started: bool,
    hijacked: bool,
}

impl<S> RawResponseWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(stream: BufStream<S>) -> Self {
        Self {
            stream: Some(stream),
            headers: HeaderMap::new(),
            status: StatusCode::OK,
            started: false,
            hijacked: false,
        }
    }

    fn stream(&mut self) -> io::Result<&mut BufStream<S>> {
        self.stream
            .as_mut()
            .ok_or_else(|| HijackError::AlreadyHijacked.into())
    }

    /// Complete the response and close the write side.
    ///
    /// A handler that wrote nothing still produces a status line and headers.
    /// Does nothing once the connection has been hijacked.
    pub async fn finish(mut self) -> io::Result<()> {
        if self.hijacked {
            return Ok(());
        }
        if !self.started {
            let status = self.status;
            self.write_header(status).await?;
        }
        let stream = self.stream()?;
        stream.flush().await?;
        stream.shutdown().await
    }
}

#[async_trait]
impl<S> ResponseWriter for RawResponseWriter<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
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
        if self.started {
            return Ok(());
        }
        let head = render_head(status, &self.headers);
        let stream = self.stream()?;
        stream.write_all(&head).await?;
        stream.flush().await?;
        self.status = status;
        self.started = true;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if !self.started {
            let status = self.status;
            self.write_header(status).await?;
        }
        let stream = self.stream()?;
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(data.len())
    }

    fn hijack(&mut self) -> Result<BoxTransport, HijackError> {
        if self.hijacked {
            return Err(HijackError::AlreadyHijacked);
        }
        if self.started {
            return Err(HijackError::ResponseStarted);
        }
        let stream = self.stream.take().ok_or(HijackError::AlreadyHijacked)?;
        self.hijacked = true;
        tracing::trace!("Connection hijacked");
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{header, HeaderValue};
    use tokio::io::{duplex, AsyncReadExt};

    #[tokio::test]
    async fn writes_status_headers_and_body() {
        let (mut client, server) = duplex(4096);
        let mut writer = RawResponseWriter::new(BufStream::new(server));
        writer
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        writer.write_header(StatusCode::CREATED).await.unwrap();
        writer.write(b"made").await.unwrap();
        writer.finish().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 201 Created\r\nContent-Type: text/plain\r\n\r\nmade"
        );
    }

    #[tokio::test]
    async fn headers_frozen_after_first_write() {
        let (mut client, server) = duplex(4096);
        let mut writer = RawResponseWriter::new(BufStream::new(server));
        writer.write(b"a").await.unwrap();
        writer
            .headers_mut()
            .insert(header::SERVER, HeaderValue::from_static("late"));
        writer.write_header(StatusCode::NOT_FOUND).await.unwrap();
        writer.write(b"b").await.unwrap();
        writer.finish().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "HTTP/1.1 200 OK\r\n\r\nab");
    }

    #[tokio::test]
    async fn finish_without_writes_sends_head() {
        let (mut client, server) = duplex(4096);
        let mut writer = RawResponseWriter::new(BufStream::new(server));
        writer
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("close"));
        writer.finish().await.unwrap();

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
    }

    #[tokio::test]
    async fn hijack_is_exclusive_and_one_time() {
        let (mut client, server) = duplex(4096);
        let mut writer = RawResponseWriter::new(BufStream::new(server));

        let mut transport = writer.hijack().unwrap();
        assert!(writer.is_hijacked());
        assert_eq!(writer.hijack().err(), Some(HijackError::AlreadyHijacked));
        assert!(writer.write(b"nope").await.is_err());

        transport.write_all(b"raw").await.unwrap();
        transport.shutdown().await.unwrap();
        writer.finish().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"raw");
    }

    #[tokio::test]
    async fn hijack_refused_after_response_started() {
        let (_client, server) = duplex(4096);
        let mut writer = RawResponseWriter::new(BufStream::new(server));
        writer.write_header(StatusCode::OK).await.unwrap();
        assert_eq!(writer.hijack().err(), Some(HijackError::ResponseStarted));
    }
}
