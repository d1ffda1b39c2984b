//! Typed request body validation.
//!
//! `validate::<T>()` decodes the JSON body into `T`, runs [`Validate`], and
//! stores the value as [`Validated<T>`] in the request extensions. Failures
//! become [`ValidationError`]s for the error handler to render.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::http::error::{HandlerResult, ValidationError};
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;

/// Semantic checks run after a body decoded successfully.
pub trait Validate {
    fn validate(&self) -> Result<(), ValidationError>;
}

/// A decoded and validated body, stored in the request extensions.
#[derive(Debug, Clone, PartialEq)]
pub struct Validated<T>(pub T);

impl<T> Validated<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The validated body of `req`, if the middleware ran.
    pub fn from_request(req: &Request) -> Option<&T> {
        req.extensions().get::<Validated<T>>().map(|v| &v.0)
    }
}

pub struct Validation<T> {
    _body: PhantomData<fn() -> T>,
}

/// Middleware validating the request body as `T`.
pub fn validate<T>() -> Validation<T>
where
    T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
{
    Validation { _body: PhantomData }
}

impl<T> Middleware for Validation<T>
where
    T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
{
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(ValidationHandler::<T> {
            next,
            _body: PhantomData,
        })
    }
}

struct ValidationHandler<T> {
    next: BoxHandler,
    _body: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> Handler for ValidationHandler<T>
where
    T: DeserializeOwned + Validate + Clone + Send + Sync + 'static,
{
    async fn call(&self, w: &mut dyn ResponseWriter, mut req: Request) -> HandlerResult {
        let value: T = serde_json::from_slice(req.body()).map_err(|err| {
            ValidationError::new(400, "invalid request body").field("body", err.to_string())
        })?;
        value.validate()?;
        req.extensions_mut().insert(Validated(value));
        self.next.call(w, req).await
    }
}
