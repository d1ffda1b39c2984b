//! End-to-end tests running the same routes over every backend.

use std::net::SocketAddr;

use reqwest::StatusCode;
use tideway::Backend;

mod common;

async fn start(addr: &str, backend: Backend) -> SocketAddr {
    common::spawn_server(common::demo_server(addr, backend)).await
}

async fn exercise(addr: SocketAddr) {
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let res = client.get(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "hello");

    let res = client
        .post(format!("{base}/echo"))
        .body("round trip")
        .send()
        .await
        .unwrap();
    assert_eq!(res.text().await.unwrap(), "round trip");

    let res = client.get(format!("{base}/missing")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(res.text().await.unwrap(), "404 page not found\n");

    let res = client.delete(format!("{base}/hello")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(res.headers()["allow"], "GET");

    let res = client.get(format!("{base}/panic")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(res.text().await.unwrap(), "kaboom");

    let res = client.post(format!("{base}/invalid")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let json: serde_json::Value = res.json().await.unwrap();
    assert_eq!(json["fields"]["email"], "required");
    assert_eq!(json["message"], "validation failed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn threaded_backend_serves_requests() {
    let addr = start("127.0.0.1:28301", Backend::Threaded).await;
    exercise(addr).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reactor_backend_serves_requests() {
    let addr = start("127.0.0.1:28302", Backend::Reactor).await;
    exercise(addr).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delegated_backend_serves_requests() {
    let addr = start("127.0.0.1:28303", Backend::Delegated).await;
    exercise(addr).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_backends_reject_malformed_requests() {
    for (port, backend) in [(28304, Backend::Threaded), (28305, Backend::Reactor)] {
        let addr = start(&format!("127.0.0.1:{port}"), backend).await;

        let response = common::raw_request(addr, b"NOT-HTTP\r\n\r\n").await;
        assert!(
            response.starts_with("HTTP/1.1 400 Bad Request\r\n"),
            "{backend}: {response:?}"
        );

        let response = common::raw_request(
            addr,
            b"GET /hello HTTP/1.1\r\nHost: x\r\nContent-Length: 99999999999\r\n\r\n",
        )
        .await;
        assert!(
            response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
            "{backend}: {response:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn raw_backends_close_after_one_response() {
    let addr = start("127.0.0.1:28306", Backend::Reactor).await;
    let response = common::raw_request(addr, b"GET /hello HTTP/1.1\r\nHost: x\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Connection: close\r\n"));
    assert!(response.ends_with("hello"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn address_in_use_is_a_serve_error() {
    let addr = start("127.0.0.1:28307", Backend::Reactor).await;
    let second = common::demo_server(&addr.to_string(), Backend::Reactor);
    assert!(second.listen_and_serve().await.is_err());
}
