//! Access logging.
//!
//! Stamps every request with an `X-Request-ID` (kept if the client sent one)
//! and logs one event per completed request.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::http::{HeaderValue, StatusCode};
use uuid::Uuid;

use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::{PeerAddr, Request, X_REQUEST_ID};
use crate::http::writer::ResponseWriter;

#[derive(Debug, Clone, Copy, Default)]
pub struct Logger;

impl Middleware for Logger {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(LoggerHandler { next })
    }
}

struct LoggerHandler {
    next: BoxHandler,
}

fn request_id(req: &mut Request) -> HeaderValue {
    if let Some(existing) = req.headers().get(&X_REQUEST_ID) {
        return existing.clone();
    }
    let generated = HeaderValue::from_str(&Uuid::new_v4().to_string())
        .unwrap_or_else(|_| HeaderValue::from_static("unknown"));
    req.headers_mut().insert(X_REQUEST_ID, generated.clone());
    generated
}

#[async_trait]
impl Handler for LoggerHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, mut req: Request) -> HandlerResult {
        let id = request_id(&mut req);
        w.set_header(X_REQUEST_ID, id.clone());

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let query = req.uri().query().unwrap_or_default().to_string();
        let version = req.version();
        let peer = req
            .extensions()
            .get::<PeerAddr>()
            .map(|p| p.0.to_string())
            .unwrap_or_else(|| "-".to_string());
        let start = Instant::now();

        let result = self.next.call(w, req).await;

        let status = if w.is_hijacked() {
            StatusCode::SWITCHING_PROTOCOLS
        } else {
            w.status()
        };
        let request_id = id.to_str().unwrap_or("-");
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match &result {
            Ok(()) => tracing::info!(
                request_id,
                method = %method,
                path = %path,
                query = %query,
                peer_addr = %peer,
                status = status.as_u16(),
                duration_ms,
                version = ?version,
                "Request completed"
            ),
            Err(err) => tracing::warn!(
                request_id,
                method = %method,
                path = %path,
                query = %query,
                peer_addr = %peer,
                duration_ms,
                version = ?version,
                error = %err,
                "Request failed"
            ),
        }
        result
    }
}
