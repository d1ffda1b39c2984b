//! Handler and middleware traits.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use super::error::HandlerResult;
use super::request::Request;
use super::writer::ResponseWriter;

/// Serves one request by writing to `w`.
///
/// A handler fails by returning an error or by panicking; both reach the
/// configured error handler.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult;
}

/// Shared, type-erased handler.
pub type BoxHandler = Arc<dyn Handler>;

/// Wraps a handler in another (`handler -> handler`).
pub trait Middleware: Send + Sync + 'static {
    fn wrap(&self, next: BoxHandler) -> BoxHandler;
}

/// Handler built from a closure returning a boxed future.
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: for<'a> Fn(&'a mut dyn ResponseWriter, Request) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        (self.0)(w, req).await
    }
}

/// Turn a closure into a handler.
///
/// ```ignore
/// let hello = handler_fn(|w, _req| Box::pin(async move {
///     w.write(b"hello").await?;
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F>(f: F) -> BoxHandler
where
    F: for<'a> Fn(&'a mut dyn ResponseWriter, Request) -> BoxFuture<'a, HandlerResult>
        + Send
        + Sync
        + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Middleware built from a `handler -> handler` closure.
pub struct MiddlewareFn<F>(F);

impl<F> Middleware for MiddlewareFn<F>
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        (self.0)(next)
    }
}

pub fn middleware_fn<F>(f: F) -> MiddlewareFn<F>
where
    F: Fn(BoxHandler) -> BoxHandler + Send + Sync + 'static,
{
    MiddlewareFn(f)
}
