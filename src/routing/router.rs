//! Pattern-based request routing.
//!
//! # Responsibilities
//! - Register handlers under patterns
//! - Pick the most specific matching route per request
//! - Answer 404 and 405 itself
//!
//! # Design Decisions
//! - Registering an existing pattern replaces its handler
//! - Frozen once the pipeline is built (the server owns it by value)

use std::collections::BTreeSet;

use async_trait::async_trait;
use axum::http::{header, HeaderValue, Method, StatusCode};
use futures_util::future::BoxFuture;

use super::matcher::{request_host, Matcher, Pattern, PatternError};
use crate::http::error::HandlerResult;
use crate::http::handler::{handler_fn, BoxHandler, Handler};
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;

const NOT_FOUND_BODY: &[u8] = b"404 page not found\n";

struct Route {
    pattern: Pattern,
    handler: BoxHandler,
}

/// Result of looking a request up.
pub enum Lookup<'a> {
    Found(&'a BoxHandler),
    /// The path exists under other methods, listed in order.
    MethodNotAllowed(Vec<&'a str>),
    NotFound,
}

#[derive(Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, pattern: &str, handler: BoxHandler) -> Result<(), PatternError> {
        let pattern = Pattern::parse(pattern)?;
        match self.routes.iter_mut().find(|r| r.pattern == pattern) {
            Some(route) => route.handler = handler,
            None => self.routes.push(Route { pattern, handler }),
        }
        Ok(())
    }

    pub fn handle_fn<F>(&mut self, pattern: &str, f: F) -> Result<(), PatternError>
    where
        F: for<'a> Fn(&'a mut dyn ResponseWriter, Request) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.handle(pattern, handler_fn(f))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn lookup(&self, method: &Method, host: Option<&str>, path: &str) -> Lookup<'_> {
        let mut best: Option<&Route> = None;
        let mut allowed = BTreeSet::new();

        for route in self.routes.iter().filter(|r| r.pattern.matches_path(host, path)) {
            if !route.pattern.matches_method(method) {
                if let Some(m) = route.pattern.method() {
                    allowed.insert(m.as_str());
                }
                continue;
            }
            let better = match best {
                Some(current) => route.pattern.specificity(&current.pattern).is_gt(),
                None => true,
            };
            if better {
                best = Some(route);
            }
        }

        match best {
            Some(route) => Lookup::Found(&route.handler),
            None if !allowed.is_empty() => Lookup::MethodNotAllowed(allowed.into_iter().collect()),
            None => Lookup::NotFound,
        }
    }
}

#[async_trait]
impl Handler for Router {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let lookup = self.lookup(req.method(), request_host(req.headers()), req.uri().path());
        match lookup {
            Lookup::Found(handler) => handler.call(w, req).await,
            Lookup::MethodNotAllowed(methods) => {
                let allow = methods.join(", ");
                if let Ok(value) = HeaderValue::from_str(&allow) {
                    w.set_header(header::ALLOW, value);
                }
                let body = b"Method Not Allowed\n";
                w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                w.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                w.send(StatusCode::METHOD_NOT_ALLOWED, body).await?;
                Ok(())
            }
            Lookup::NotFound => {
                w.set_header(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                w.set_header(header::CONTENT_LENGTH, HeaderValue::from(NOT_FOUND_BODY.len()));
                w.send(StatusCode::NOT_FOUND, NOT_FOUND_BODY).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::error::HandlerError;
    use crate::http::recorder::MemoryWriter;
    use axum::body::Bytes;

    fn tagged(tag: &'static str) -> BoxHandler {
        handler_fn(move |w, _req| {
            Box::pin(async move {
                w.send(StatusCode::OK, tag.as_bytes()).await?;
                Ok::<(), HandlerError>(())
            })
        })
    }

    async fn route(router: &Router, method: Method, uri: &str) -> (StatusCode, axum::http::HeaderMap, String) {
        let req = axum::http::Request::builder()
            .method(method)
            .uri(uri)
            .header("host", "example.com")
            .body(Bytes::new())
            .unwrap();
        let mut w = MemoryWriter::new();
        router.call(&mut w, req).await.unwrap();
        let (status, headers, body) = w.into_parts();
        (status, headers, String::from_utf8(body).unwrap())
    }

    #[tokio::test]
    async fn longest_match_wins() {
        let mut router = Router::new();
        router.handle("/", tagged("root")).unwrap();
        router.handle("/api/", tagged("api")).unwrap();
        router.handle("/api/users", tagged("users")).unwrap();

        assert_eq!(route(&router, Method::GET, "/api/users").await.2, "users");
        assert_eq!(route(&router, Method::GET, "/api/orders").await.2, "api");
        assert_eq!(route(&router, Method::GET, "/elsewhere").await.2, "root");
    }

    #[tokio::test]
    async fn re_registering_replaces() {
        let mut router = Router::new();
        router.handle("/x", tagged("old")).unwrap();
        router.handle("/x", tagged("new")).unwrap();
        assert_eq!(router.len(), 1);
        assert_eq!(route(&router, Method::GET, "/x").await.2, "new");
    }

    #[tokio::test]
    async fn wrong_method_is_405_with_allow() {
        let mut router = Router::new();
        router.handle("GET /items", tagged("list")).unwrap();
        router.handle("POST /items", tagged("create")).unwrap();

        let (status, headers, _) = route(&router, Method::DELETE, "/items").await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(headers[header::ALLOW], "GET, POST");
        assert_eq!(route(&router, Method::POST, "/items").await.2, "create");
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let mut router = Router::new();
        router.handle("/only", tagged("only")).unwrap();
        let (status, _, body) = route(&router, Method::GET, "/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "404 page not found\n");
    }

    #[tokio::test]
    async fn host_specific_route_beats_generic() {
        let mut router = Router::new();
        router.handle("/", tagged("any")).unwrap();
        router.handle("example.com/", tagged("host")).unwrap();
        assert_eq!(route(&router, Method::GET, "/page").await.2, "host");
    }
}
