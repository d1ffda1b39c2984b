//! Middleware composition and the per-request recovery boundary.
//!
//! # Responsibilities
//! - Fold the middleware list around the innermost handler
//! - Run each request inside a boundary that catches panics
//! - Hand every fault to the error handler exactly once
//!
//! # Design Decisions
//! - The first registered middleware is outermost: `m0(m1(...(h)))`
//! - The chain is built once, before serving; it is immutable afterwards
//! - With no error handler a panic resumes unwinding and a returned error is
//!   passed back to the backend

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;

use super::error::{ErrorHandler, HandlerError, HandlerResult};
use super::handler::{BoxHandler, Middleware};
use super::request::{Request, RequestHead};
use super::writer::ResponseWriter;

/// Wrap `handler` so that `middleware[0]` sees the request first.
pub fn compose(handler: BoxHandler, middleware: &[Arc<dyn Middleware>]) -> BoxHandler {
    middleware
        .iter()
        .rev()
        .fold(handler, |next, layer| layer.wrap(next))
}

/// Render a panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// The composed handler chain plus its error handler.
pub struct Pipeline {
    handler: BoxHandler,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl Pipeline {
    pub fn new(
        handler: BoxHandler,
        middleware: &[Arc<dyn Middleware>],
        error_handler: Option<Arc<dyn ErrorHandler>>,
    ) -> Self {
        Self {
            handler: compose(handler, middleware),
            error_handler,
        }
    }

    pub fn has_error_handler(&self) -> bool {
        self.error_handler.is_some()
    }

    /// Run one request through the chain.
    ///
    /// Returns `Ok` whenever the error handler took care of a fault.
    pub async fn dispatch(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let head = RequestHead::from_request(&req);

        let outcome = AssertUnwindSafe(self.handler.call(w, req))
            .catch_unwind()
            .await;

        let err = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => err,
            Err(payload) => {
                if self.error_handler.is_none() {
                    std::panic::resume_unwind(payload);
                }
                let message = panic_message(&*payload);
                tracing::error!(
                    method = %head.method,
                    path = %head.path(),
                    panic = %message,
                    "Handler panicked"
                );
                HandlerError::Panic(message)
            }
        };

        match &self.error_handler {
            Some(handler) => {
                handler.handle(Some(w), Some(&head), &err).await;
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Report a fault that happened outside any request, such as a parse failure.
    pub async fn report(&self, err: HandlerError) {
        match &self.error_handler {
            Some(handler) => handler.handle(None, None, &err).await,
            None => tracing::warn!(error = %err, "Unhandled connection error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::{DefaultErrorHandler, ValidationError};
    use crate::http::handler::{handler_fn, middleware_fn, Handler};
    use crate::http::recorder::MemoryWriter;
    use async_trait::async_trait;
    use axum::body::Bytes;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    struct RecordingHandler {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        next: BoxHandler,
    }

    #[async_trait]
    impl Handler for RecordingHandler {
        async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
            self.log.lock().unwrap().push(format!("{}-enter", self.name));
            let result = self.next.call(w, req).await;
            self.log.lock().unwrap().push(format!("{}-exit", self.name));
            result
        }
    }

    impl Middleware for Recording {
        fn wrap(&self, next: BoxHandler) -> BoxHandler {
            Arc::new(RecordingHandler {
                name: self.name,
                log: self.log.clone(),
                next,
            })
        }
    }

    fn explode(message: &str) -> HandlerResult {
        panic!("{message}")
    }

    fn request() -> Request {
        axum::http::Request::builder()
            .uri("/things")
            .body(Bytes::new())
            .unwrap()
    }

    #[tokio::test]
    async fn first_registered_middleware_is_outermost() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let inner_log = log.clone();
        let handler = handler_fn(move |_w, _req| {
            let log = inner_log.clone();
            Box::pin(async move {
                log.lock().unwrap().push("h".to_string());
                Ok::<(), HandlerError>(())
            })
        });
        let middleware: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording { name: "m0", log: log.clone() }),
            Arc::new(Recording { name: "m1", log: log.clone() }),
        ];

        let pipeline = Pipeline::new(handler, &middleware, None);
        let mut w = MemoryWriter::new();
        pipeline.dispatch(&mut w, request()).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            ["m0-enter", "m1-enter", "h", "m1-exit", "m0-exit"]
        );
    }

    #[tokio::test]
    async fn validation_fault_renders_json_with_its_status() {
        let handler = handler_fn(|_w, _req| {
            Box::pin(async move {
                Err::<(), HandlerError>(
                    ValidationError::new(422, "invalid")
                        .field("email", "required")
                        .into(),
                )
            })
        });
        let pipeline = Pipeline::new(handler, &[], Some(Arc::new(DefaultErrorHandler)));
        let mut w = MemoryWriter::new();
        pipeline.dispatch(&mut w, request()).await.unwrap();

        assert_eq!(w.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(w.headers()["content-type"], "application/json");
        let body: serde_json::Value = serde_json::from_slice(w.body()).unwrap();
        assert_eq!(body["fields"], serde_json::json!({"email": "required"}));
        assert_eq!(body["code"], 422);
    }

    #[tokio::test]
    async fn panic_is_recovered_as_500() {
        let handler = handler_fn(|_w, _req| Box::pin(async move { explode("kaboom") }));
        let pipeline = Pipeline::new(handler, &[], Some(Arc::new(DefaultErrorHandler)));
        let mut w = MemoryWriter::new();
        pipeline.dispatch(&mut w, request()).await.unwrap();

        assert_eq!(w.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(w.body(), b"kaboom");
    }

    #[tokio::test]
    async fn plain_error_is_500() {
        let handler = handler_fn(|_w, _req| {
            Box::pin(async move { Err::<(), _>(HandlerError::msg("database unavailable")) })
        });
        let pipeline = Pipeline::new(handler, &[], Some(Arc::new(DefaultErrorHandler)));
        let mut w = MemoryWriter::new();
        pipeline.dispatch(&mut w, request()).await.unwrap();

        assert_eq!(w.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(w.body(), b"database unavailable");
    }

    #[tokio::test]
    async fn without_error_handler_errors_propagate() {
        let handler =
            handler_fn(|_w, _req| Box::pin(async move { Err::<(), _>(HandlerError::msg("x")) }));
        let pipeline = Pipeline::new(handler, &[], None);
        let mut w = MemoryWriter::new();
        assert!(pipeline.dispatch(&mut w, request()).await.is_err());
        assert!(!w.is_started());
    }

    #[tokio::test]
    async fn error_handler_runs_once_per_fault() {
        struct Counting(Arc<Mutex<usize>>);

        #[async_trait]
        impl ErrorHandler for Counting {
            async fn handle(
                &self,
                _writer: Option<&mut dyn ResponseWriter>,
                _request: Option<&RequestHead>,
                _err: &HandlerError,
            ) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let count = Arc::new(Mutex::new(0));
        let handler = handler_fn(|_w, _req| Box::pin(async move { explode("once") }));
        let passthrough: Vec<Arc<dyn Middleware>> =
            vec![Arc::new(middleware_fn(|next| next))];
        let pipeline = Pipeline::new(handler, &passthrough, Some(Arc::new(Counting(count.clone()))));
        let mut w = MemoryWriter::new();
        pipeline.dispatch(&mut w, request()).await.unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn panic_payload_messages() {
        let payload: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(&*payload), "static");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(&*payload), "handler panicked");
    }
}
