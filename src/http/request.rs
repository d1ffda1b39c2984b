//! Request model and raw HTTP/1.1 request parsing.
//!
//! # Responsibilities
//! - Parse one request (line, headers, body) from a buffered stream
//! - Enforce header size, header count and body size limits
//! - Carry the peer address and a request summary for error reporting
//!
//! # Design Decisions
//! - Limits are checked while reading, before anything is buffered past them
//! - Bodies are framed by `Content-Length` or `Transfer-Encoding: chunked`;
//!   anything else has no body
//! - Violations map to 400, 413, 431 or 505

use std::io;
use std::net::SocketAddr;

use axum::body::Bytes;
use axum::http::{
    header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, Version,
};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::LimitsConfig;

/// A fully buffered request, as seen by handlers.
pub type Request = axum::http::Request<Bytes>;

/// Header carrying the per-request correlation id.
pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest accepted chunk-size line in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

/// Remote address of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Summary of a request that outlives the request itself.
///
/// Handlers consume the request; the error handler gets this instead.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub peer: Option<SocketAddr>,
}

impl RequestHead {
    pub fn from_request(req: &Request) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            peer: req.extensions().get::<PeerAddr>().map(|p| p.0),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }
}

/// Errors produced while reading a request off the wire.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The peer closed the connection before sending a request line.
    #[error("connection closed before a request was received")]
    Closed,

    #[error("malformed request line: {0:?}")]
    RequestLine(String),

    #[error("malformed header line: {0:?}")]
    Header(String),

    #[error("request head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("request has more than {limit} headers")]
    TooManyHeaders { limit: usize },

    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("unsupported HTTP version: {0}")]
    Version(String),

    #[error("malformed chunked body: {0}")]
    Chunked(String),

    #[error("invalid request: {0}")]
    Invalid(#[from] axum::http::Error),

    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl ParseError {
    /// Status code to answer with before closing the connection.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::HeadTooLarge { .. } | ParseError::TooManyHeaders { .. } => {
                StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE
            }
            ParseError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ParseError::Version(_) => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Read one line, including its terminator, within `budget` bytes.
///
/// Returns `None` on a clean EOF before any byte was read.
async fn read_line<R>(
    reader: &mut R,
    budget: &mut usize,
    limit: usize,
) -> Result<Option<Vec<u8>>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(*budget as u64)
        .read_until(b'\n', &mut line)
        .await?;
    if read == 0 {
        if *budget == 0 {
            return Err(ParseError::HeadTooLarge { limit });
        }
        return Ok(None);
    }
    if !line.ends_with(b"\n") {
        if read >= *budget {
            return Err(ParseError::HeadTooLarge { limit });
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    *budget -= read;
    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(Some(line))
}

fn parse_version(raw: &str) -> Result<Version, ParseError> {
    match raw {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(ParseError::Version(other.to_string())),
    }
}

fn parse_request_line(line: &[u8]) -> Result<(Method, Uri, Version), ParseError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ParseError::RequestLine(String::from_utf8_lossy(line).into_owned()))?;
    let bad = || ParseError::RequestLine(text.to_string());

    let mut parts = text.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(bad());
    };

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| bad())?;
    let uri = target.parse::<Uri>().map_err(|_| bad())?;
    let version = parse_version(version)?;
    Ok((method, uri, version))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn parse_header_line(line: &[u8]) -> Result<(HeaderName, HeaderValue), ParseError> {
    let bad = || ParseError::Header(String::from_utf8_lossy(line).into_owned());
    let colon = line.iter().position(|b| *b == b':').ok_or_else(bad)?;
    let name = HeaderName::from_bytes(trim(&line[..colon])).map_err(|_| bad())?;
    let value = HeaderValue::from_bytes(trim(&line[colon + 1..])).map_err(|_| bad())?;
    Ok((name, value))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, ParseError> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(Some)
            .ok_or_else(|| ParseError::Header(format!("content-length: {value:?}"))),
    }
}

async fn read_chunked<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    loop {
        let mut budget = MAX_CHUNK_LINE;
        let line = read_line(reader, &mut budget, MAX_CHUNK_LINE)
            .await?
            .ok_or_else(|| ParseError::Chunked("missing chunk size".into()))?;
        let size_field = line.split(|b| *b == b';').next().unwrap_or_default();
        let size = std::str::from_utf8(size_field)
            .ok()
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or_else(|| ParseError::Chunked(String::from_utf8_lossy(&line).into_owned()))?;

        if size == 0 {
            // Trailer section, discarded.
            loop {
                let mut budget = MAX_CHUNK_LINE;
                match read_line(reader, &mut budget, MAX_CHUNK_LINE).await? {
                    Some(trailer) if !trailer.is_empty() => continue,
                    _ => return Ok(body),
                }
            }
        }

        if body.len().saturating_add(size) > limit {
            return Err(ParseError::BodyTooLarge { limit });
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;

        let mut budget = 2;
        match read_line(reader, &mut budget, 2).await {
            Ok(Some(end)) if end.is_empty() => {}
            _ => return Err(ParseError::Chunked("chunk not terminated by CRLF".into())),
        }
    }
}

/// Read exactly one request from `reader`.
pub async fn read_request<R>(reader: &mut R, limits: &LimitsConfig) -> Result<Request, ParseError>
where
    R: AsyncBufRead + Unpin,
{
    let head_limit = limits.max_header_bytes;
    let mut budget = head_limit;

    // Leading empty lines before the request line are tolerated.
    let request_line = loop {
        match read_line(reader, &mut budget, head_limit).await? {
            None => return Err(ParseError::Closed),
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };
    let (method, uri, version) = parse_request_line(&request_line)?;

    let mut headers = HeaderMap::new();
    let mut count = 0usize;
    loop {
        let line = read_line(reader, &mut budget, head_limit)
            .await?
            .ok_or_else(|| ParseError::Io(io::ErrorKind::UnexpectedEof.into()))?;
        if line.is_empty() {
            break;
        }
        count += 1;
        if count > limits.max_headers {
            return Err(ParseError::TooManyHeaders {
                limit: limits.max_headers,
            });
        }
        let (name, value) = parse_header_line(&line)?;
        headers.append(name, value);
    }

    let body = if is_chunked(&headers) {
        read_chunked(reader, limits.max_body_size).await?
    } else if let Some(length) = content_length(&headers)? {
        if length > limits.max_body_size {
            return Err(ParseError::BodyTooLarge {
                limit: limits.max_body_size,
            });
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        body
    } else {
        Vec::new()
    };

    let mut request = axum::http::Request::builder()
        .method(method)
        .uri(uri)
        .version(version)
        .body(Bytes::from(body))?;
    *request.headers_mut() = headers;
    Ok(request)
}
