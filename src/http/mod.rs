//! HTTP layer.
//!
//! # Data Flow
//! ```text
//! Raw connection (threaded / reactor backends)
//!     → request.rs (parse one request within limits)
//!     → response.rs (RawResponseWriter onto the socket)
//!
//! Host server (delegated backend)
//!     → buffered.rs (BufferedResponseWriter, duplex hijack)
//!
//! Either way
//!     → pipeline.rs (middleware chain, recovery boundary)
//!     → handler.rs (Handler / Middleware traits)
//!     → error.rs (ErrorHandler renders faults)
//! ```
//!
//! server.rs is the facade that assembles all of this.

pub mod buffered;
pub mod error;
pub mod handler;
pub mod pipeline;
pub mod recorder;
pub mod request;
pub mod response;
pub mod server;
pub mod writer;

pub use error::{DefaultErrorHandler, ErrorHandler, HandlerError, HandlerResult, ValidationError};
pub use handler::{handler_fn, middleware_fn, BoxHandler, Handler, Middleware};
pub use pipeline::Pipeline;
pub use request::{PeerAddr, Request, RequestHead, X_REQUEST_ID};
pub use server::Server;
pub use writer::{BoxTransport, HijackError, ResponseWriter, Transport};
