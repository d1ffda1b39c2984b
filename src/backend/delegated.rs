//! Host-server backend.
//!
//! # Responsibilities
//! - Mount the pipeline as the fallback of an axum router
//! - Serve it over plain TCP (`axum::serve`) or TLS (`axum-server` + rustls)
//! - Complete hijacks by bridging the handler's pipe to the upgraded connection
//!
//! # Design Decisions
//! - Each request runs in its own task so a hijacking handler can keep the
//!   connection after the host server got its response
//! - Bodies are collected up to `max_body_size`; larger bodies get 413

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{copy_bidirectional, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tower_http::trace::TraceLayer;

use super::{fallback_response, BackendSettings, ConnectionBackend, ServeError};
use crate::http::buffered::{read_upgrade_head, BufferedResponseWriter, Outcome};
use crate::http::pipeline::Pipeline;
use crate::http::request::{PeerAddr, Request};
use crate::net::listener::{parse_address, ListenerError};
use crate::net::tls::load_tls_config;

#[derive(Clone)]
struct DelegateState {
    pipeline: Arc<Pipeline>,
    max_body_size: usize,
}

/// The axum router every delegated request goes through.
pub fn router(pipeline: Arc<Pipeline>, max_body_size: usize) -> Router {
    Router::new()
        .fallback(delegate)
        .with_state(DelegateState {
            pipeline,
            max_body_size,
        })
        .layer(TraceLayer::new_for_http())
}

async fn delegate(State(state): State<DelegateState>, mut request: axum::extract::Request) -> Response {
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();
    let (mut parts, body) = request.into_parts();

    let body = match to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(err) => {
            tracing::debug!(error = %err, limit = state.max_body_size, "Request body rejected");
            return StatusCode::PAYLOAD_TOO_LARGE.into_response();
        }
    };
    if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>().cloned() {
        parts.extensions.insert(PeerAddr(peer));
    }
    let request = Request::from_parts(parts, body);

    let (mut writer, outcome) = BufferedResponseWriter::new();
    let pipeline = Arc::clone(&state.pipeline);
    tokio::spawn(async move {
        if let Err(err) = pipeline.dispatch(&mut writer, request).await {
            fallback_response(&mut writer, &err).await;
        }
        writer.finish();
    });

    match outcome.await {
        Ok(Outcome::Complete(response)) => response,
        Ok(Outcome::Hijacked(pipe)) => match on_upgrade {
            Some(on_upgrade) => bridge(pipe, on_upgrade).await,
            None => {
                tracing::warn!("Connection hijacked but the host server offers no upgrade");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(_) => {
            tracing::error!("Handler task ended without producing a response");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Turn what the hijacker wrote into the host response, then splice the
/// upgraded connection onto the pipe.
async fn bridge(mut pipe: DuplexStream, on_upgrade: OnUpgrade) -> Response {
    let (mut response, leftover) = match read_upgrade_head(&mut pipe).await {
        Ok(head) => head,
        Err(err) => {
            tracing::warn!(error = %err, "Hijacked connection wrote no usable response head");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        let mut body = leftover;
        if let Err(err) = pipe.read_to_end(&mut body).await {
            tracing::debug!(error = %err, "Failed to drain hijacked response body");
        }
        *response.body_mut() = Body::from(body);
        return response;
    }

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::debug!(error = %err, "Upgrade did not complete");
                return;
            }
        };
        let mut io = TokioIo::new(upgraded);
        if !leftover.is_empty() {
            if let Err(err) = io.write_all(&leftover).await {
                tracing::debug!(error = %err, "Failed to forward buffered upgrade bytes");
                return;
            }
        }
        match copy_bidirectional(&mut io, &mut pipe).await {
            Ok((to_handler, to_peer)) => {
                tracing::trace!(to_handler, to_peer, "Upgraded connection closed");
            }
            Err(err) => tracing::debug!(error = %err, "Upgraded connection failed"),
        }
    });

    response
}

pub struct DelegatedBackend {
    settings: BackendSettings,
}

impl DelegatedBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl ConnectionBackend for DelegatedBackend {
    fn name(&self) -> &'static str {
        "delegated"
    }

    async fn serve(&self, address: &str, pipeline: Arc<Pipeline>) -> Result<(), ServeError> {
        let app = router(pipeline, self.settings.limits.max_body_size)
            .into_make_service_with_connect_info::<SocketAddr>();

        match &self.settings.tls {
            Some(tls) => {
                let addr = parse_address(address)?;
                let rustls = load_tls_config(tls).await.map_err(ServeError::Tls)?;
                tracing::info!(address = %addr, backend = self.name(), "Serving over TLS");
                axum_server::bind_rustls(addr, rustls).serve(app).await?;
            }
            None => {
                let listener = tokio::net::TcpListener::bind(address)
                    .await
                    .map_err(|source| ListenerError::Bind {
                        address: address.to_string(),
                        source,
                    })?;
                tracing::info!(address = %listener.local_addr()?, backend = self.name(), "Listener bound");
                axum::serve(listener, app).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::{DefaultErrorHandler, HandlerError};
    use crate::http::handler::handler_fn;
    use crate::http::writer::ResponseWriter;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn echo_pipeline() -> Arc<Pipeline> {
        let handler = handler_fn(|w, req| {
            Box::pin(async move {
                w.send(StatusCode::ACCEPTED, req.body()).await?;
                Ok::<(), HandlerError>(())
            })
        });
        Arc::new(Pipeline::new(handler, &[], Some(Arc::new(DefaultErrorHandler))))
    }

    #[tokio::test]
    async fn buffered_response_reaches_the_host() {
        let response = router(echo_pipeline(), 1024)
            .oneshot(HttpRequest::post("/echo").body(Body::from("hello")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(body.as_ref(), b"hello");
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let response = router(echo_pipeline(), 4)
            .oneshot(HttpRequest::post("/echo").body(Body::from("too large")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn hijack_without_upgrade_support_is_500() {
        let handler = handler_fn(|w, _req| {
            Box::pin(async move {
                let mut transport = w.hijack().map_err(std::io::Error::from)?;
                transport
                    .write_all(b"HTTP/1.1 101 Switching Protocols\r\n\r\n")
                    .await?;
                Ok::<(), HandlerError>(())
            })
        });
        let pipeline = Arc::new(Pipeline::new(handler, &[], None));
        let response = router(pipeline, 1024)
            .oneshot(HttpRequest::get("/ws").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
