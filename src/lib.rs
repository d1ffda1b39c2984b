//! tideway: an HTTP/1.1 server engine with a WebSocket layer.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ backend (threaded | reactor | delegated)
//!                   │
//!                   ▼
//!               http::pipeline ── middleware chain ── recovery boundary
//!                   │                                      │
//!                   ▼                                      ▼
//!               routing::Router ──▶ handler          ErrorHandler
//!                                     │
//!                                     ▼ (hijack)
//!                               websocket::Upgrader ──▶ Client ──▶ Room
//! ```

// Core subsystems
pub mod backend;
pub mod config;
pub mod http;
pub mod net;
pub mod routing;
pub mod websocket;

// Cross-cutting concerns
pub mod middleware;
pub mod observability;

pub use backend::{Backend, ConnectionBackend, ServeError};
pub use config::ServerConfig;
pub use http::{
    handler_fn, BoxHandler, ErrorHandler, Handler, HandlerError, HandlerResult, Middleware,
    Request, ResponseWriter, Server,
};
