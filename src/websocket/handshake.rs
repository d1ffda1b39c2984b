//! HTTP-to-WebSocket upgrade.
//!
//! # Responsibilities
//! - Validate the upgrade request headers
//! - Compute `Sec-WebSocket-Accept`
//! - Hijack the connection and write the `101 Switching Protocols` response
//!
//! # Design Decisions
//! - Validation happens before the hijack: a rejected request leaves the
//!   connection untouched, so the HTTP layer can still answer with an error
//! - `Upgrade` and `Connection` are matched as case-insensitive tokens
//! - No subprotocol or extension negotiation

use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::client::Client;
use super::frame::FrameError;
use crate::config::WebSocketConfig;
use crate::http::error::{HandlerError, ValidationError};
use crate::http::request::Request;
use crate::http::writer::{HijackError, ResponseWriter};
use crate::observability::metrics::WS_CONNECTIONS_TOTAL;

/// Fixed GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Errors from the WebSocket layer.
#[derive(Debug, Error)]
pub enum WsError {
    #[error("missing or invalid Upgrade: websocket header")]
    MissingUpgrade,

    #[error("missing or invalid Connection: Upgrade header")]
    MissingConnectionUpgrade,

    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,

    #[error("cannot take over the connection: {0}")]
    Hijack(#[from] HijackError),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("frame payload of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: u64, max: usize },

    #[error("connection closed")]
    Closed,

    #[error("websocket i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// True for failures caused by a malformed upgrade request.
    pub fn is_handshake_error(&self) -> bool {
        matches!(
            self,
            WsError::MissingUpgrade | WsError::MissingConnectionUpgrade | WsError::MissingKey
        )
    }
}

impl From<WsError> for HandlerError {
    fn from(err: WsError) -> Self {
        if err.is_handshake_error() {
            HandlerError::Validation(ValidationError::new(400, err.to_string()))
        } else {
            HandlerError::other(err)
        }
    }
}

/// `base64(sha1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

fn has_token(headers: &HeaderMap, name: header::HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Check the upgrade headers and return the client key.
pub fn validate_request(headers: &HeaderMap) -> Result<&str, WsError> {
    if !has_token(headers, header::UPGRADE, "websocket") {
        return Err(WsError::MissingUpgrade);
    }
    if !has_token(headers, header::CONNECTION, "upgrade") {
        return Err(WsError::MissingConnectionUpgrade);
    }
    headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .ok_or(WsError::MissingKey)
}

/// Performs the server side of the opening handshake.
#[derive(Debug, Clone)]
pub struct Upgrader {
    max_frame_size: usize,
}

impl Default for Upgrader {
    fn default() -> Self {
        Self::new(&WebSocketConfig::default())
    }
}

impl Upgrader {
    pub fn new(config: &WebSocketConfig) -> Self {
        Self {
            max_frame_size: config.max_frame_size,
        }
    }

    /// Upgrade the connection behind `w`.
    ///
    /// On error nothing has been written and `w` is still usable.
    pub async fn upgrade(&self, w: &mut dyn ResponseWriter, req: &Request) -> Result<Client, WsError> {
        let key = validate_request(req.headers())?;
        let accept = accept_key(key);

        let mut transport = w.hijack()?;
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        transport.write_all(response.as_bytes()).await?;
        transport.flush().await?;

        let client = Client::from_transport(transport, self.max_frame_size);
        metrics::counter!(WS_CONNECTIONS_TOTAL).increment(1);
        tracing::debug!(client_id = %client.id(), path = %req.uri().path(), "WebSocket upgraded");
        Ok(client)
    }
}
