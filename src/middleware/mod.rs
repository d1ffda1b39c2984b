//! Middleware adapters.
//!
//! # Data Flow
//! ```text
//! Request
//!     → logger.rs     (request id, access log)
//!     → tracing.rs    (span per request, via a Tracer)
//!     → metrics.rs    (counters and latency, via a MetricsSink)
//!     → cors.rs       (origin policy, preflight)
//!     → rate_limit.rs (per-peer quota, via a RateLimiter)
//!     → cache.rs      (GET replay, via a Cache)
//!     → validation.rs (typed JSON body, via Validate)
//!     → handler
//! ```
//! The order above is only a suggestion; the server applies middleware in
//! registration order, first registered outermost.
//!
//! # Design Decisions
//! - Every capability is a trait with an in-process implementation;
//!   [`Cache`] also has a Redis one
//! - Middleware answer rejections themselves; only faults become errors

pub mod cache;
pub mod cors;
pub mod logger;
pub mod metrics;
pub mod rate_limit;
pub mod redis_cache;
mod sweep;
pub mod tracing;
pub mod validation;

pub use self::cache::{Cache, CacheError, MemoryCache, ResponseCache};
pub use self::cors::Cors;
pub use self::logger::Logger;
pub use self::metrics::{Metrics, MetricsSink};
pub use self::rate_limit::{Decision, Quota, RateLimit, RateLimiter, TokenBucketLimiter};
pub use self::redis_cache::RedisCache;
pub use self::tracing::{Tracer, Tracing, TracingTracer};
pub use self::validation::{validate, Validate, Validated};
