//! Middleware chains running inside real servers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request as HttpRequest, StatusCode};
use tideway::backend::delegated;
use tideway::config::{CorsConfig, RateLimitConfig};
use tideway::http::error::HandlerError;
use tideway::middleware::{Cors, Logger, MemoryCache, RateLimit, ResponseCache};
use tideway::{Backend, Server};
use tower::ServiceExt;

fn hello_server(addr: &str, backend: Backend) -> Server {
    let mut server = Server::new(addr).with_backend(backend);
    server
        .handle_fn("GET /hello", |w, _req| {
            Box::pin(async move {
                w.send(StatusCode::OK, b"hello").await?;
                Ok::<(), HandlerError>(())
            })
        })
        .unwrap();
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rate_limit_denies_after_burst() {
    let mut server = hello_server("127.0.0.1:28321", Backend::Reactor);
    server.use_middleware(RateLimit::from_config(&RateLimitConfig {
        enabled: true,
        requests_per_second: 1,
        burst_size: 2,
        ..RateLimitConfig::default()
    }));
    let addr = common::spawn_server(server).await;
    let url = format!("http://{addr}/hello");

    for remaining in ["1", "0"] {
        let response = reqwest::get(&url).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
    }

    let response = reqwest::get(&url).await.unwrap();
    assert_eq!(response.status(), 429);
    let retry_after: u64 = response.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1);
    assert_eq!(response.text().await.unwrap(), "Rate limit exceeded");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_cache_serves_second_get_from_cache() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);

    let mut server = Server::new("127.0.0.1:28322").with_backend(Backend::Threaded);
    server.use_middleware(Logger);
    server.use_middleware(ResponseCache::new(Arc::new(MemoryCache::new())));
    server
        .handle_fn("GET /report", move |w, _req| {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                w.send(StatusCode::OK, br#"{"total":3}"#).await?;
                Ok::<(), HandlerError>(())
            })
        })
        .unwrap();
    let addr = common::spawn_server(server).await;
    let url = format!("http://{addr}/report");

    let first = reqwest::get(&url).await.unwrap();
    assert_eq!(first.headers()["x-cache"], "MISS");
    assert!(first.headers().contains_key("x-request-id"));
    assert_eq!(first.text().await.unwrap(), r#"{"total":3}"#);

    let second = reqwest::get(&url).await.unwrap();
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers()["x-cache"], "HIT");
    assert_eq!(second.headers()[header::CONTENT_TYPE], "application/json");
    assert_eq!(second.text().await.unwrap(), r#"{"total":3}"#);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cors_preflight_through_delegated_router() {
    let mut server = hello_server("127.0.0.1:0", Backend::Delegated);
    server.use_middleware(Cors::new(CorsConfig {
        allowed_origins: vec!["https://app.example".into()],
        allow_all_origins: false,
        ..CorsConfig::default()
    }));
    let app = delegated::router(Arc::new(server.into_pipeline()), 1024);

    let preflight = HttpRequest::builder()
        .method("OPTIONS")
        .uri("/hello")
        .header(header::ORIGIN, "https://app.example")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(preflight).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example"
    );
    assert_eq!(response.headers()[header::ACCESS_CONTROL_MAX_AGE], "3600");

    let actual = HttpRequest::builder()
        .uri("/hello")
        .header(header::ORIGIN, "https://app.example")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(actual).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::VARY], "Origin");
    let body = to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"hello");

    let foreign = HttpRequest::builder()
        .uri("/hello")
        .header(header::ORIGIN, "https://evil.example")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(foreign).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
