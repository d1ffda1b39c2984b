//! Event-loop backend.
//!
//! # Responsibilities
//! - Accept on the runtime's reactor through the bounded listener
//! - Register one callback and invoke it when a connection becomes readable
//!
//! # Design Decisions
//! - The callback is built once per `serve`; every connection shares it
//! - Transient accept errors are logged and skipped

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::net::TcpStream;

use super::{serve_connection, Backend, BackendSettings, ConnectionBackend, ServeError};
use crate::http::pipeline::Pipeline;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::Listener;

/// Invoked once per connection after its first readiness event.
pub type ReadyCallback = Arc<dyn Fn(TcpStream, SocketAddr) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct ReactorBackend {
    settings: BackendSettings,
    tracker: ConnectionTracker,
}

impl ReactorBackend {
    pub fn new(settings: BackendSettings) -> Self {
        Self {
            settings,
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    fn callback(&self, pipeline: Arc<Pipeline>) -> ReadyCallback {
        let limits = Arc::new(self.settings.limits.clone());
        Arc::new(move |stream, peer| {
            let pipeline = Arc::clone(&pipeline);
            let limits = Arc::clone(&limits);
            Box::pin(async move {
                serve_connection(stream, peer, &pipeline, &limits).await;
            })
        })
    }
}

#[async_trait]
impl ConnectionBackend for ReactorBackend {
    fn name(&self) -> &'static str {
        "reactor"
    }

    async fn serve(&self, address: &str, pipeline: Arc<Pipeline>) -> Result<(), ServeError> {
        if self.settings.tls.is_some() {
            return Err(ServeError::TlsUnsupported(Backend::Reactor));
        }
        let listener = Listener::bind(address, self.settings.max_connections).await?;
        let on_ready = self.callback(pipeline);

        loop {
            let (stream, peer, permit) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) if err.is_transient() => {
                    tracing::warn!(error = %err, "Transient accept error");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let guard = self.tracker.track();
            let on_ready = Arc::clone(&on_ready);
            tokio::spawn(async move {
                let _permit = permit;
                if let Err(err) = stream.readable().await {
                    tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, error = %err, "Connection failed before becoming readable");
                    return;
                }
                tracing::trace!(connection_id = %guard.id(), peer_addr = %peer, "Connection readable");
                on_ready(stream, peer).await;
                drop(guard);
            });
        }
    }
}
