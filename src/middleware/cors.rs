//! Cross-origin resource sharing.
//!
//! # Responsibilities
//! - Refuse requests from origins outside the policy (403)
//! - Answer preflight requests (204) without reaching the handler
//! - Decorate actual cross-origin responses
//!
//! # Design Decisions
//! - Requests without `Origin` pass through untouched
//! - Method and header names compare case-insensitively
//! - A wildcard origin is echoed back when credentials are allowed

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};

use crate::config::CorsConfig;
use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;

#[derive(Debug, Clone)]
pub struct Cors {
    policy: Arc<CorsConfig>,
}

impl Cors {
    pub fn new(policy: CorsConfig) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }
}

impl Default for Cors {
    fn default() -> Self {
        Self::new(CorsConfig::default())
    }
}

impl Middleware for Cors {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(CorsHandler {
            policy: Arc::clone(&self.policy),
            next,
        })
    }
}

struct CorsHandler {
    policy: Arc<CorsConfig>,
    next: BoxHandler,
}

fn contains_ignore_case(list: &[String], value: &str) -> bool {
    list.iter().any(|item| item.eq_ignore_ascii_case(value))
}

fn origin_allowed(policy: &CorsConfig, origin: &str) -> bool {
    policy.allow_all_origins
        || policy.allowed_origins.iter().any(|o| o == "*")
        || contains_ignore_case(&policy.allowed_origins, origin)
}

fn is_wildcard(policy: &CorsConfig) -> bool {
    policy.allow_all_origins || policy.allowed_origins.iter().any(|o| o == "*")
}

fn header_list(values: &[String]) -> Option<HeaderValue> {
    HeaderValue::from_str(&values.join(", ")).ok()
}

/// Headers shared by preflight and actual responses.
fn apply_origin(policy: &CorsConfig, origin: &HeaderValue, headers: &mut HeaderMap) {
    if is_wildcard(policy) && !policy.allow_credentials {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    } else {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        headers.append(header::VARY, HeaderValue::from_static("Origin"));
    }
    if policy.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
}

async fn forbid(w: &mut dyn ResponseWriter, reason: &'static str) -> HandlerResult {
    tracing::debug!(reason, "CORS request refused");
    w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    w.set_header(header::CONTENT_LENGTH, HeaderValue::from(reason.len()));
    w.send(StatusCode::FORBIDDEN, reason.as_bytes()).await?;
    Ok(())
}

impl CorsHandler {
    async fn preflight(
        &self,
        w: &mut dyn ResponseWriter,
        origin: &HeaderValue,
        req: &Request,
    ) -> HandlerResult {
        let policy = &*self.policy;
        let requested_method = req
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_METHOD)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !contains_ignore_case(&policy.allowed_methods, requested_method) {
            return forbid(w, "method not allowed by CORS policy").await;
        }

        let requested_headers = req
            .headers()
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let all_headers_allowed = requested_headers
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .all(|h| contains_ignore_case(&policy.allowed_headers, h));
        if !all_headers_allowed {
            return forbid(w, "header not allowed by CORS policy").await;
        }

        let headers = w.headers_mut();
        apply_origin(policy, origin, headers);
        if let Some(methods) = header_list(&policy.allowed_methods) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, methods);
        }
        if let Some(allowed) = header_list(&policy.allowed_headers) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, allowed);
        }
        headers.insert(header::ACCESS_CONTROL_MAX_AGE, HeaderValue::from(policy.max_age_secs));
        w.write_header(StatusCode::NO_CONTENT).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler for CorsHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let Some(origin) = req.headers().get(header::ORIGIN).cloned() else {
            return self.next.call(w, req).await;
        };
        let origin_text = origin.to_str().unwrap_or_default();
        if !origin_allowed(&self.policy, origin_text) {
            return forbid(w, "origin not allowed").await;
        }

        let is_preflight = req.method() == Method::OPTIONS
            && req.headers().contains_key(header::ACCESS_CONTROL_REQUEST_METHOD);
        if is_preflight {
            return self.preflight(w, &origin, &req).await;
        }

        let headers = w.headers_mut();
        apply_origin(&self.policy, &origin, headers);
        if !self.policy.exposed_headers.is_empty() {
            if let Some(exposed) = header_list(&self.policy.exposed_headers) {
                headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, exposed);
            }
        }
        self.next.call(w, req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::HandlerError;
    use crate::http::handler::handler_fn;
    use crate::http::recorder::MemoryWriter;
    use axum::body::Bytes;

    fn restricted() -> CorsConfig {
        CorsConfig {
            allowed_origins: vec!["https://app.example".to_string()],
            allow_all_origins: false,
            allow_credentials: true,
            ..CorsConfig::default()
        }
    }

    async fn run(policy: CorsConfig, req: Request) -> (StatusCode, HeaderMap, Vec<u8>) {
        let ok = handler_fn(|w, _req| {
            Box::pin(async move {
                w.send(StatusCode::OK, b"ok").await?;
                Ok::<(), HandlerError>(())
            })
        });
        let handler = Cors::new(policy).wrap(ok);
        let mut w = MemoryWriter::new();
        handler.call(&mut w, req).await.unwrap();
        w.into_parts()
    }

    fn request(method: Method, headers: &[(&str, &str)]) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri("/api");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn no_origin_passes_through() {
        let (status, headers, body) = run(restricted(), request(Method::GET, &[])).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"ok");
        assert!(!headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn disallowed_origin_is_403() {
        let req = request(Method::GET, &[("origin", "https://evil.example")]);
        let (status, _, _) = run(restricted(), req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn preflight_is_answered_with_204() {
        let req = request(
            Method::OPTIONS,
            &[
                ("origin", "https://app.example"),
                ("access-control-request-method", "PUT"),
                ("access-control-request-headers", "content-type"),
            ],
        );
        let (status, headers, body) = run(restricted(), req).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(body.is_empty());
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://app.example");
        assert_eq!(
            headers[header::ACCESS_CONTROL_ALLOW_METHODS],
            "GET, POST, PUT, DELETE, OPTIONS"
        );
        assert_eq!(headers[header::ACCESS_CONTROL_MAX_AGE], "3600");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        assert_eq!(headers[header::VARY], "Origin");
    }

    #[tokio::test]
    async fn preflight_with_unknown_method_or_header_is_403() {
        let req = request(
            Method::OPTIONS,
            &[("origin", "https://app.example"), ("access-control-request-method", "PATCH")],
        );
        assert_eq!(run(restricted(), req).await.0, StatusCode::FORBIDDEN);

        let req = request(
            Method::OPTIONS,
            &[
                ("origin", "https://app.example"),
                ("access-control-request-method", "GET"),
                ("access-control-request-headers", "x-secret"),
            ],
        );
        assert_eq!(run(restricted(), req).await.0, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn actual_request_gets_wildcard_and_exposed_headers() {
        let req = request(Method::GET, &[("origin", "https://anywhere.example")]);
        let (status, headers, _) = run(CorsConfig::default(), req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(headers[header::ACCESS_CONTROL_EXPOSE_HEADERS], "Content-Length");
        assert!(!headers.contains_key(header::VARY));
    }
}
