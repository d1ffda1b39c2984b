//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use tideway::http::error::{HandlerError, ValidationError};
use tideway::{Backend, Server};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Wait until something accepts connections on `addr`.
pub async fn wait_for_port(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("nothing listening on {addr}");
}

/// Serve `server` in the background on its configured address.
pub async fn spawn_server(server: Server) -> SocketAddr {
    let addr: SocketAddr = server.address().parse().unwrap();
    tokio::spawn(async move {
        if let Err(err) = server.listen_and_serve().await {
            eprintln!("server on {addr} stopped: {err}");
        }
    });
    wait_for_port(addr).await;
    addr
}

/// Send raw bytes and read until the server closes the connection.
pub async fn raw_request(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("response timed out")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// A server exposing the routes every backend test exercises.
pub fn demo_server(addr: &str, backend: Backend) -> Server {
    let mut server = Server::new(addr).with_backend(backend);
    server
        .handle_fn("GET /hello", |w, _req| {
            Box::pin(async move {
                w.send(StatusCode::OK, b"hello").await?;
                Ok::<(), HandlerError>(())
            })
        })
        .unwrap()
        .handle_fn("POST /echo", |w, req| {
            Box::pin(async move {
                w.send(StatusCode::OK, req.body()).await?;
                Ok::<(), HandlerError>(())
            })
        })
        .unwrap()
        .handle_fn("/panic", |_w, _req| Box::pin(async { explode("kaboom") }))
        .unwrap()
        .handle_fn("/invalid", |_w, _req| {
            Box::pin(async {
                Err::<(), HandlerError>(
                    ValidationError::new(422, "validation failed")
                        .field("email", "required")
                        .into(),
                )
            })
        })
        .unwrap();
    server
}

pub fn explode(message: &str) -> Result<(), HandlerError> {
    panic!("{message}")
}
