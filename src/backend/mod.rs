//! Connection backends.
//!
//! # Data Flow
//! ```text
//! Backend (config value)
//!     → connection_backend() picks one implementation
//!     → threaded.rs   (blocking accept, one OS thread per connection)
//!     → reactor.rs    (async accept, readiness callback per connection)
//!     → delegated.rs  (axum/hyper host server, optional TLS)
//!     → Pipeline::dispatch for every request
//! ```
//!
//! # Design Decisions
//! - One request per connection on the raw backends; `Connection: close`
//! - `serve` returns only on a fatal listener fault
//! - Parse failures get a bare status line and are reported to the error
//!   handler with neither writer nor request

pub mod delegated;
pub mod reactor;
pub mod threaded;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, BufStream};

use crate::config::{LimitsConfig, ServerConfig, TlsConfig};
use crate::http::error::HandlerError;
use crate::http::pipeline::Pipeline;
use crate::http::request::{read_request, ParseError, PeerAddr};
use crate::http::response::RawResponseWriter;
use crate::http::writer::ResponseWriter;
use crate::net::listener::ListenerError;

pub use delegated::DelegatedBackend;
pub use reactor::ReactorBackend;
pub use threaded::ThreadedBackend;

/// Which connection backend serves the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One OS thread per accepted connection.
    Threaded,
    /// Event-loop accept with a per-connection readiness callback.
    #[default]
    Reactor,
    /// The axum/hyper host server, optionally over TLS.
    Delegated,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Threaded => "threaded",
            Backend::Reactor => "reactor",
            Backend::Delegated => "delegated",
        }
    }

    /// Build the implementation for this backend from the server settings.
    pub fn connection_backend(self, config: &ServerConfig) -> Box<dyn ConnectionBackend> {
        let settings = BackendSettings::from_config(config);
        match self {
            Backend::Threaded => Box::new(ThreadedBackend::new(settings)),
            Backend::Reactor => Box::new(ReactorBackend::new(settings)),
            Backend::Delegated => Box::new(DelegatedBackend::new(settings)),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown backend {0:?}, expected threaded, reactor or delegated")]
pub struct UnknownBackend(String);

impl FromStr for Backend {
    type Err = UnknownBackend;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" => Ok(Backend::Threaded),
            "reactor" => Ok(Backend::Reactor),
            "delegated" => Ok(Backend::Delegated),
            _ => Err(UnknownBackend(s.to_string())),
        }
    }
}

/// Fatal errors that stop a backend.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error("failed to load TLS configuration: {0}")]
    Tls(#[source] io::Error),

    #[error("the {0} backend does not terminate TLS")]
    TlsUnsupported(Backend),

    #[error("failed to spawn {what}: {source}")]
    Spawn {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("accept loop exited unexpectedly")]
    AcceptLoopExited,

    #[error("server error: {0}")]
    Io(#[from] io::Error),
}

/// Settings shared by every backend.
#[derive(Debug, Clone, Default)]
pub struct BackendSettings {
    pub limits: LimitsConfig,
    pub max_connections: usize,
    pub tls: Option<TlsConfig>,
}

impl BackendSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            limits: config.limits.clone(),
            max_connections: config.listener.max_connections,
            tls: config.listener.tls.clone(),
        }
    }
}

/// Accepts connections and runs every request through a pipeline.
#[async_trait]
pub trait ConnectionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve until a fatal listener fault.
    async fn serve(&self, address: &str, pipeline: Arc<Pipeline>) -> Result<(), ServeError>;
}

/// Answer a request the pipeline gave up on, unless the handler already did.
pub(crate) async fn fallback_response(w: &mut dyn ResponseWriter, err: &HandlerError) {
    tracing::error!(error = %err, "Unhandled request error");
    if w.is_started() || w.is_hijacked() {
        return;
    }
    let body = StatusCode::INTERNAL_SERVER_ERROR
        .canonical_reason()
        .unwrap_or_default()
        .as_bytes();
    w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    w.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    if let Err(err) = w.send(StatusCode::INTERNAL_SERVER_ERROR, body).await {
        tracing::debug!(error = %err, "Failed to write fallback response");
    }
}

/// Parse one request off a raw connection, run it, and close the connection.
pub(crate) async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    pipeline: &Pipeline,
    limits: &LimitsConfig,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut stream = BufStream::new(stream);

    let mut request = match read_request(&mut stream, limits).await {
        Ok(request) => request,
        Err(ParseError::Closed) => return,
        Err(err) => {
            tracing::debug!(peer_addr = %peer, error = %err, "Request parse failed");
            reject(stream, err.status()).await;
            pipeline.report(HandlerError::Parse(err)).await;
            return;
        }
    };
    request.extensions_mut().insert(PeerAddr(peer));

    let mut writer = RawResponseWriter::new(stream);
    writer.set_header(header::CONNECTION, HeaderValue::from_static("close"));

    if let Err(err) = pipeline.dispatch(&mut writer, request).await {
        fallback_response(&mut writer, &err).await;
    }

    if let Err(err) = writer.finish().await {
        tracing::debug!(peer_addr = %peer, error = %err, "Failed to complete response");
    }
}

async fn reject<S>(stream: BufStream<S>, status: StatusCode)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut writer = RawResponseWriter::new(stream);
    writer.set_header(header::CONNECTION, HeaderValue::from_static("close"));
    writer.set_header(header::CONTENT_LENGTH, HeaderValue::from(0));
    let result = match writer.write_header(status).await {
        Ok(()) => writer.finish().await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        tracing::debug!(error = %err, "Failed to write rejection");
    }
}
