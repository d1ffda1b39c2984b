//! Response writers that keep what was written.
//!
//! [`MemoryWriter`] stores the whole response and never touches a socket.
//! [`BodyRecorder`] passes everything through to another writer while keeping
//! a copy of the body, which is what the cache middleware needs.

use std::io;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};

use super::writer::{BoxTransport, HijackError, ResponseWriter};

/// In-memory response. Hijacking is not supported.
#[derive(Debug, Default)]
pub struct MemoryWriter {
    headers: HeaderMap,
    status: Option<StatusCode>,
    body: Vec<u8>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Vec<u8>) {
        (self.status.unwrap_or(StatusCode::OK), self.headers, self.body)
    }
}

#[async_trait]
impl ResponseWriter for MemoryWriter {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    fn is_started(&self) -> bool {
        self.status.is_some()
    }

    fn is_hijacked(&self) -> bool {
        false
    }

    async fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        self.status.get_or_insert(status);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(data);
        Ok(data.len())
    }

    fn hijack(&mut self) -> Result<BoxTransport, HijackError> {
        Err(HijackError::Unsupported)
    }
}

/// Pass-through writer that keeps a copy of the body.
pub struct BodyRecorder<'a> {
    inner: &'a mut dyn ResponseWriter,
    body: Vec<u8>,
}

impl<'a> BodyRecorder<'a> {
    pub fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            body: Vec::new(),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

#[async_trait]
impl<'a> ResponseWriter for BodyRecorder<'a> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    fn status(&self) -> StatusCode {
        self.inner.status()
    }

    fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    fn is_hijacked(&self) -> bool {
        self.inner.is_hijacked()
    }

    async fn write_header(&mut self, status: StatusCode) -> io::Result<()> {
        self.inner.write_header(status).await
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(data).await?;
        self.body.extend_from_slice(&data[..written]);
        Ok(written)
    }

    fn hijack(&mut self) -> Result<BoxTransport, HijackError> {
        self.inner.hijack()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_copies_body_and_forwards_status() {
        let mut memory = MemoryWriter::new();
        let mut recorder = BodyRecorder::new(&mut memory);
        recorder.write_header(StatusCode::ACCEPTED).await.unwrap();
        recorder.write(b"abc").await.unwrap();
        recorder.write(b"def").await.unwrap();
        assert_eq!(recorder.body(), b"abcdef");
        assert_eq!(recorder.status(), StatusCode::ACCEPTED);

        let (status, _, body) = memory.into_parts();
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, b"abcdef");
    }

    #[tokio::test]
    async fn memory_writer_keeps_first_status() {
        let mut memory = MemoryWriter::new();
        memory.write(b"x").await.unwrap();
        memory.write_header(StatusCode::NOT_FOUND).await.unwrap();
        assert_eq!(memory.status(), StatusCode::OK);
        assert!(memory.hijack().is_err());
    }
}
