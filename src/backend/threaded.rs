//! Thread-per-connection backend.
//!
//! # Responsibilities
//! - Blocking accept on a dedicated OS thread
//! - One OS thread per accepted connection, driving the async request path
//!   on the surrounding runtime through its handle
//!
//! # Design Decisions
//! - The accept loop is a plain thread, not `spawn_blocking`, so a blocked
//!   `accept` never holds the runtime open on drop
//! - A connection whose thread cannot be spawned is dropped; the listener
//!   keeps running

use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::thread;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Semaphore};

use super::{serve_connection, BackendSettings, ConnectionBackend, ServeError};
use crate::http::pipeline::Pipeline;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{is_transient_accept_error, parse_address, ListenerError};

pub struct ThreadedBackend {
    settings: BackendSettings,
    tracker: ConnectionTracker,
}

impl ThreadedBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

#[async_trait]
impl ConnectionBackend for ThreadedBackend {
    fn name(&self) -> &'static str {
        "threaded"
    }

    async fn serve(&self, address: &str, pipeline: Arc<Pipeline>) -> Result<(), ServeError> {
        if self.settings.tls.is_some() {
            return Err(ServeError::TlsUnsupported(super::Backend::Threaded));
        }
        let addr = parse_address(address)?;
        let listener = StdTcpListener::bind(addr).map_err(|source| ListenerError::Bind {
            address: address.to_string(),
            source,
        })?;
        tracing::info!(
            address = %addr,
            backend = self.name(),
            max_connections = self.settings.max_connections,
            "Listener bound"
        );

        let accept = AcceptLoop {
            listener,
            handle: Handle::current(),
            pipeline,
            settings: self.settings.clone(),
            tracker: self.tracker.clone(),
        };
        let (done_tx, done_rx) = oneshot::channel();
        thread::Builder::new()
            .name("tideway-accept".to_string())
            .spawn(move || {
                let _ = done_tx.send(accept.run());
            })
            .map_err(|source| ServeError::Spawn {
                what: "accept thread",
                source,
            })?;

        done_rx.await.unwrap_or(Err(ServeError::AcceptLoopExited))
    }
}

struct AcceptLoop {
    listener: StdTcpListener,
    handle: Handle,
    pipeline: Arc<Pipeline>,
    settings: BackendSettings,
    tracker: ConnectionTracker,
}

impl AcceptLoop {
    fn run(self) -> Result<(), ServeError> {
        let limit = Arc::new(Semaphore::new(self.settings.max_connections));
        loop {
            let permit = self
                .handle
                .block_on(limit.clone().acquire_owned())
                .map_err(|_| ListenerError::LimitClosed)?;

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(err) if is_transient_accept_error(&err) => {
                    tracing::warn!(error = %err, "Transient accept error");
                    continue;
                }
                Err(err) => return Err(ListenerError::Accept(err).into()),
            };

            let guard = self.tracker.track();
            let handle = self.handle.clone();
            let pipeline = Arc::clone(&self.pipeline);
            let settings = self.settings.clone();
            let spawned = thread::Builder::new()
                .name(format!("tideway-{}", guard.id()))
                .spawn(move || {
                    let _permit = permit;
                    tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, "Connection accepted");
                    handle.block_on(handle_connection(stream, peer, &pipeline, &settings));
                    drop(guard);
                });
            if let Err(err) = spawned {
                tracing::error!(peer_addr = %peer, error = %err, "Failed to spawn connection thread");
            }
        }
    }
}

async fn handle_connection(
    stream: StdTcpStream,
    peer: SocketAddr,
    pipeline: &Pipeline,
    settings: &BackendSettings,
) {
    let stream = match stream
        .set_nonblocking(true)
        .and_then(|()| TcpStream::from_std(stream))
    {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(peer_addr = %peer, error = %err, "Failed to register connection");
            return;
        }
    };
    serve_connection(stream, peer, pipeline, &settings.limits).await;
}
