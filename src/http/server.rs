//! Server facade.
//!
//! # Responsibilities
//! - Collect routes, static file mounts, middleware and the error handler
//! - Freeze them into a [`Pipeline`] when serving starts
//! - Hand the pipeline to the selected connection backend
//!
//! # Design Decisions
//! - `listen_and_serve` consumes the server, so nothing can be registered
//!   once serving has started
//! - [`DefaultErrorHandler`] is installed unless cleared or replaced

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::error::{DefaultErrorHandler, ErrorHandler, HandlerResult};
use super::handler::{BoxHandler, Middleware};
use super::pipeline::Pipeline;
use super::request::Request;
use super::writer::ResponseWriter;
use crate::backend::{Backend, ServeError};
use crate::config::{ServerConfig, TlsConfig};
use crate::routing::{FileServer, Pattern, PatternError, Router, StripPrefix};
use crate::websocket::Upgrader;

pub struct Server {
    config: ServerConfig,
    router: Router,
    middleware: Vec<Arc<dyn Middleware>>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
}

impl Server {
    /// A server with default settings listening on `address`.
    pub fn new(address: impl Into<String>) -> Self {
        let mut config = ServerConfig::default();
        config.listener.bind_address = address.into();
        Self::from_config(config)
    }

    pub fn from_config(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
            middleware: Vec::new(),
            error_handler: Some(Arc::new(DefaultErrorHandler)),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn address(&self) -> &str {
        &self.config.listener.bind_address
    }

    pub fn backend(&self) -> Backend {
        self.config.listener.backend
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.config.listener.backend = backend;
        self
    }

    /// Serve over TLS. Only the delegated backend supports it.
    pub fn with_tls(mut self, cert_path: impl Into<String>, key_path: impl Into<String>) -> Self {
        self.config.listener.tls = Some(TlsConfig {
            cert_path: cert_path.into(),
            key_path: key_path.into(),
        });
        self
    }

    /// An upgrader using this server's WebSocket settings.
    pub fn upgrader(&self) -> Upgrader {
        Upgrader::new(&self.config.websocket)
    }

    /// Append a middleware. The first one registered runs outermost.
    pub fn use_middleware(&mut self, middleware: impl Middleware) -> &mut Self {
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn handle(&mut self, pattern: &str, handler: BoxHandler) -> Result<&mut Self, PatternError> {
        self.router.handle(pattern, handler)?;
        Ok(self)
    }

    pub fn handle_fn<F>(&mut self, pattern: &str, f: F) -> Result<&mut Self, PatternError>
    where
        F: for<'a> Fn(&'a mut dyn ResponseWriter, Request) -> BoxFuture<'a, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        self.router.handle_fn(pattern, f)?;
        Ok(self)
    }

    /// Serve files under `root` at `pattern`, which should end in `/`.
    ///
    /// The pattern's path is stripped before the file lookup, so
    /// `/static/app.js` maps to `root/app.js`.
    pub fn serve_files(
        &mut self,
        pattern: &str,
        root: impl Into<PathBuf>,
    ) -> Result<&mut Self, PatternError> {
        let prefix = Pattern::parse(pattern)?.path().trim_end_matches('/').to_string();
        let files: BoxHandler = Arc::new(FileServer::new(root));
        self.handle(pattern, Arc::new(StripPrefix::new(prefix, files)))
    }

    pub fn set_error_handler(&mut self, handler: impl ErrorHandler) -> &mut Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Remove the error handler: panics then propagate and errors reach the
    /// backend, which answers 500 when it still can.
    pub fn clear_error_handler(&mut self) -> &mut Self {
        self.error_handler = None;
        self
    }

    /// Freeze routes and middleware into the pipeline a backend runs.
    pub fn into_pipeline(self) -> Pipeline {
        let handler: BoxHandler = Arc::new(self.router);
        Pipeline::new(handler, &self.middleware, self.error_handler)
    }

    /// Serve until the backend hits a fatal listener fault.
    pub async fn listen_and_serve(self) -> Result<(), ServeError> {
        let address = self.config.listener.bind_address.clone();
        let backend = self.config.listener.backend.connection_backend(&self.config);
        tracing::info!(
            address = %address,
            backend = backend.name(),
            middleware = self.middleware.len(),
            routes = self.router.len(),
            "Starting server"
        );
        let pipeline = Arc::new(self.into_pipeline());
        backend.serve(&address, pipeline).await
    }
}
