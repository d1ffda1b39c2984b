//! Request spans.
//!
//! A [`Tracer`] opens a span per request and closes it with the outcome. The
//! handler chain runs instrumented with that span, so every event a handler
//! emits carries the request's attributes.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::field::Empty;
use tracing::{Instrument, Span};

use crate::http::error::{HandlerError, HandlerResult};
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::{Request, RequestHead};
use crate::http::writer::ResponseWriter;

pub trait Tracer: Send + Sync + 'static {
    fn start_span(&self, head: &RequestHead) -> Span;

    fn end_span(&self, span: &Span, status: StatusCode, error: Option<&HandlerError>);
}

/// [`Tracer`] backed by `tracing` spans.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn start_span(&self, head: &RequestHead) -> Span {
        let remote = head
            .peer
            .map(|addr| addr.to_string())
            .unwrap_or_default();
        tracing::info_span!(
            "http.request",
            http.method = %head.method,
            http.url = %head.uri,
            http.remote_addr = %remote,
            http.status_code = Empty,
            error = Empty,
        )
    }

    fn end_span(&self, span: &Span, status: StatusCode, error: Option<&HandlerError>) {
        span.record("http.status_code", status.as_u16());
        if let Some(err) = error {
            span.record("error", tracing::field::display(err));
        }
    }
}

#[derive(Clone)]
pub struct Tracing {
    tracer: Arc<dyn Tracer>,
}

impl Tracing {
    pub fn new(tracer: Arc<dyn Tracer>) -> Self {
        Self { tracer }
    }
}

impl Default for Tracing {
    fn default() -> Self {
        Self::new(Arc::new(TracingTracer))
    }
}

impl Middleware for Tracing {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(TracingHandler {
            tracer: Arc::clone(&self.tracer),
            next,
        })
    }
}

struct TracingHandler {
    tracer: Arc<dyn Tracer>,
    next: BoxHandler,
}

#[async_trait]
impl Handler for TracingHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let span = self.tracer.start_span(&RequestHead::from_request(&req));
        let result = self.next.call(&mut *w, req).instrument(span.clone()).await;

        let status = match &result {
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Ok(()) if w.is_hijacked() => StatusCode::SWITCHING_PROTOCOLS,
            Ok(()) => w.status(),
        };
        self.tracer.end_span(&span, status, result.as_ref().err());
        result
    }
}
