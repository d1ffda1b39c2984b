//! Handler faults and the error handler that renders them.
//!
//! # Responsibilities
//! - Normalize handler failures (returned errors and panics) into one type
//! - Carry the structured validation failure (message, status, field map)
//! - Render faults into a response when a writer is still usable
//!
//! # Design Decisions
//! - Validation failures keep their own status and render as JSON
//! - Every other fault renders as a plain-text 500
//! - Faults with no writer (request parse failures) are only logged

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::request::{ParseError, RequestHead};
use super::writer::ResponseWriter;

/// A request failed validation.
///
/// Rendered by [`DefaultErrorHandler`] as `{"message", "code", "fields"}` with
/// `code` as the response status.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub code: u16,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, Value>,
}

impl ValidationError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            fields: BTreeMap::new(),
        }
    }

    /// Attach a per-field error.
    pub fn field(mut self, name: impl Into<String>, error: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), error.into());
        self
    }

    /// Response status, falling back to 400 for codes outside the HTTP range.
    pub fn status(&self) -> StatusCode {
        StatusCode::from_u16(self.code).unwrap_or(StatusCode::BAD_REQUEST)
    }
}

/// Any failure surfaced by a handler or middleware.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The handler panicked; holds the panic message.
    #[error("{0}")]
    Panic(String),

    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn msg(message: impl Into<String>) -> Self {
        HandlerError::Message(message.into())
    }

    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        HandlerError::Other(Box::new(err))
    }
}

/// Result returned by every handler.
pub type HandlerResult = Result<(), HandlerError>;

/// Invoked exactly once per failed request.
///
/// `writer` is absent when the failure happened before a response writer
/// existed; `request` is absent when the request could not be parsed.
#[async_trait]
pub trait ErrorHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        writer: Option<&mut dyn ResponseWriter>,
        request: Option<&RequestHead>,
        err: &HandlerError,
    );
}

/// Renders validation failures as JSON and everything else as a 500.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(
        &self,
        writer: Option<&mut dyn ResponseWriter>,
        request: Option<&RequestHead>,
        err: &HandlerError,
    ) {
        let method = request.map(|r| r.method.as_str()).unwrap_or("-");
        let path = request.map(|r| r.path()).unwrap_or("-");

        let Some(writer) = writer else {
            tracing::warn!(error = %err, "Request failed before a response could be written");
            return;
        };
        if writer.is_started() || writer.is_hijacked() {
            tracing::warn!(
                method,
                path,
                error = %err,
                "Handler failed after the response started"
            );
            return;
        }

        let (status, content_type, body) = match err {
            HandlerError::Validation(validation) => match serde_json::to_vec(validation) {
                Ok(body) => (validation.status(), "application/json", body),
                Err(e) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain; charset=utf-8",
                    e.to_string().into_bytes(),
                ),
            },
            other => {
                tracing::error!(method, path, error = %other, "Handler failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "text/plain; charset=utf-8",
                    other.to_string().into_bytes(),
                )
            }
        };

        writer.set_header(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        if let Ok(length) = HeaderValue::try_from(body.len().to_string()) {
            writer.set_header(header::CONTENT_LENGTH, length);
        }
        if let Err(e) = writer.send(status, &body).await {
            tracing::debug!(method, path, error = %e, "Failed to write error response");
        }
    }
}
