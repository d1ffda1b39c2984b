//! Per-client rate limiting.
//!
//! # Responsibilities
//! - Keep one token bucket per key (the peer IP for the middleware)
//! - Let callers override the quota of individual keys, optionally for a while
//! - Forget idle and expired buckets so the map tracks live peers only
//! - Answer 429 with `Retry-After` once a bucket is empty
//!
//! # Design Decisions
//! - Buckets refill continuously at `rps` up to `burst`
//! - Sharded map; no global lock on the request path

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use dashmap::DashMap;

use crate::config::RateLimitConfig;
use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::request::{PeerAddr, Request};
use crate::http::writer::ResponseWriter;
use super::sweep::{sweep, Sweeper};

pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Refill rate and capacity of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quota {
    pub rps: f64,
    pub burst: f64,
}

impl Quota {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self {
            rps: f64::from(rps),
            burst: f64::from(burst),
        }
    }
}

/// Outcome of one `allow` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the next token is available.
    pub reset_after: Duration,
}

/// Keyed admission control.
pub trait RateLimiter: Send + Sync + 'static {
    /// Take one token for `key`.
    fn allow(&self, key: &str) -> Decision;

    /// Override the quota for `key`, resetting its bucket.
    fn set(&self, key: &str, quota: Quota);

    /// Like [`RateLimiter::set`], but the override lapses after `ttl`.
    fn set_with_expiration(&self, key: &str, quota: Quota, ttl: Duration);

    fn get(&self, key: &str) -> Option<Quota>;

    /// Quota of `key` and when its bucket expires, if it does.
    fn get_with_expiration(&self, key: &str) -> Option<(Quota, Option<Instant>)>;

    /// Forget `key`. Returns whether it was known.
    fn delete(&self, key: &str) -> bool;

    fn exists(&self, key: &str) -> bool;

    /// Drop every expired bucket now. Returns how many were removed.
    fn cleanup(&self) -> usize;

    /// Stop background work. The limiter keeps answering `allow`.
    fn close(&self);
}

#[derive(Debug)]
struct TokenBucket {
    quota: Quota,
    tokens: f64,
    last_update: Instant,
    expires_at: Option<Instant>,
    /// Buckets created by `allow` expire once idle this long.
    idle_ttl: Option<Duration>,
}

impl TokenBucket {
    fn new(quota: Quota) -> Self {
        Self {
            quota,
            tokens: quota.burst,
            last_update: Instant::now(),
            expires_at: None,
            idle_ttl: None,
        }
    }

    fn idle(quota: Quota, idle_ttl: Option<Duration>) -> Self {
        Self {
            idle_ttl,
            ..Self::new(quota)
        }
    }

    fn expiring(quota: Quota, ttl: Duration) -> Self {
        let bucket = Self::new(quota);
        Self {
            expires_at: Some(bucket.last_update + ttl),
            ..bucket
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.quota.rps).min(self.quota.burst);
        self.last_update = now;
        if let Some(ttl) = self.idle_ttl {
            self.expires_at = Some(now + ttl);
        }
    }

    fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn until_next_token(&self) -> Duration {
        if self.tokens >= 1.0 || self.quota.rps <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / self.quota.rps)
    }
}

fn bucket_expired(bucket: &TokenBucket, now: Instant) -> bool {
    bucket.is_expired(now)
}

/// Idle time after which a peer's bucket is forgotten.
pub const DEFAULT_IDLE_TTL: Duration = Duration::from_secs(60 * 60);

/// In-memory token buckets keyed by string.
///
/// Buckets created by [`RateLimiter::allow`] expire after
/// [`DEFAULT_IDLE_TTL`] without traffic; expired buckets are removed by
/// [`RateLimiter::cleanup`] or the background sweep.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    default_quota: Quota,
    idle_ttl: Option<Duration>,
    buckets: Arc<DashMap<String, TokenBucket>>,
    sweeper: Sweeper,
}

impl TokenBucketLimiter {
    pub fn new(default_quota: Quota) -> Self {
        Self {
            default_quota,
            idle_ttl: Some(DEFAULT_IDLE_TTL),
            buckets: Arc::new(DashMap::new()),
            sweeper: Sweeper::default(),
        }
    }

    /// Builds the limiter and, inside a Tokio runtime, starts its sweep.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(Quota::new(config.requests_per_second, config.burst_size))
            .with_idle_ttl(Duration::from_secs(config.idle_ttl_secs))
            .with_cleanup_interval(Duration::from_secs(config.cleanup_interval_secs))
    }

    /// Idle time before a bucket created by `allow` expires.
    pub fn with_idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = Some(ttl);
        self
    }

    /// Sweep expired buckets every `every` until [`RateLimiter::close`].
    pub fn with_cleanup_interval(self, every: Duration) -> Self {
        self.sweeper
            .start("rate_limiter", Arc::downgrade(&self.buckets), every, bucket_expired);
        self
    }

    /// Stored buckets, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl RateLimiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::idle(self.default_quota, self.idle_ttl));
        if bucket.is_expired(now) {
            *bucket = TokenBucket::idle(self.default_quota, self.idle_ttl);
        }
        let allowed = bucket.try_acquire();
        Decision {
            allowed,
            limit: bucket.quota.burst as u32,
            remaining: bucket.tokens.max(0.0) as u32,
            reset_after: bucket.until_next_token(),
        }
    }

    fn set(&self, key: &str, quota: Quota) {
        self.buckets.insert(key.to_string(), TokenBucket::new(quota));
    }

    fn set_with_expiration(&self, key: &str, quota: Quota, ttl: Duration) {
        self.buckets
            .insert(key.to_string(), TokenBucket::expiring(quota, ttl));
    }

    fn get(&self, key: &str) -> Option<Quota> {
        self.get_with_expiration(key).map(|(quota, _)| quota)
    }

    fn get_with_expiration(&self, key: &str) -> Option<(Quota, Option<Instant>)> {
        let now = Instant::now();
        self.buckets
            .get(key)
            .filter(|bucket| !bucket.is_expired(now))
            .map(|bucket| (bucket.quota, bucket.expires_at))
    }

    fn delete(&self, key: &str) -> bool {
        self.buckets.remove(key).is_some()
    }

    fn exists(&self, key: &str) -> bool {
        self.get_with_expiration(key).is_some()
    }

    fn cleanup(&self) -> usize {
        sweep(&self.buckets, Instant::now(), bucket_expired)
    }

    fn close(&self) {
        self.sweeper.stop();
    }
}

/// Middleware limiting each peer IP through a [`RateLimiter`].
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<dyn RateLimiter>,
}

impl RateLimit {
    pub fn new(limiter: Arc<dyn RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(Arc::new(TokenBucketLimiter::from_config(config)))
    }
}

impl Middleware for RateLimit {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(RateLimitHandler {
            limiter: Arc::clone(&self.limiter),
            next,
        })
    }
}

struct RateLimitHandler {
    limiter: Arc<dyn RateLimiter>,
    next: BoxHandler,
}

fn client_key(req: &Request) -> String {
    req.extensions()
        .get::<PeerAddr>()
        .map(|p| p.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn reset_secs(decision: &Decision) -> u64 {
    decision.reset_after.as_secs_f64().ceil() as u64
}

#[async_trait]
impl Handler for RateLimitHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        let key = client_key(&req);
        let decision = self.limiter.allow(&key);

        let headers = w.headers_mut();
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(reset_secs(&decision)));

        if decision.allowed {
            return self.next.call(w, req).await;
        }

        tracing::warn!(client = %key, path = %req.uri().path(), "Rate limit exceeded");
        let body = b"Rate limit exceeded";
        let headers = w.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(reset_secs(&decision).max(1)));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        w.send(StatusCode::TOO_MANY_REQUESTS, body).await?;
        Ok(())
    }
}
