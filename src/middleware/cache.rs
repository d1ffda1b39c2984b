//! Response caching.
//!
//! # Responsibilities
//! - Key/value [`Cache`] capability with optional expiry
//! - In-memory implementation on a sharded map, with a background expiry sweep
//! - Redis implementation in `redis_cache.rs`
//! - Middleware replaying successful GET responses under `"{METHOD}:{path}"`
//!
//! # Design Decisions
//! - Only 200 responses with a non-empty body are stored
//! - Replays carry `application/json` when the body parses as JSON and
//!   `text/plain` otherwise; `X-Cache` tells hits from misses
//! - Cache failures never fail the request; they are logged and bypassed

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{header, HeaderName, HeaderValue, Method, StatusCode};
use dashmap::DashMap;
use thiserror::Error;

use crate::http::error::HandlerResult;
use crate::http::handler::{BoxHandler, Handler, Middleware};
use crate::http::recorder::BodyRecorder;
use crate::http::request::Request;
use crate::http::writer::ResponseWriter;
use super::sweep::{sweep, Sweeper};

pub const X_CACHE: HeaderName = HeaderName::from_static("x-cache");

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,

    #[error("expiration must be in the future")]
    ExpirationNotInFuture,

    #[error("cache backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait Cache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError>;

    /// A zero `ttl` is refused with [`CacheError::ExpirationNotInFuture`].
    async fn set_with_expiration(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Returns whether the key was present.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Release the cache. Every later call fails with [`CacheError::Closed`].
    async fn close(&self) -> Result<(), CacheError>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Process-local [`Cache`].
///
/// Expired entries are dropped when next touched, by [`MemoryCache::cleanup`],
/// and by the background sweep started with
/// [`MemoryCache::with_cleanup_interval`].
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Arc<DashMap<String, Entry>>,
    default_ttl: Option<Duration>,
    closed: AtomicBool,
    sweeper: Sweeper,
}

fn entry_expired(entry: &Entry, now: Instant) -> bool {
    entry.is_expired(now)
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expiry applied by [`Cache::set`].
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Sweep expired entries every `every` until [`Cache::close`].
    ///
    /// Needs a Tokio runtime; without one only touched or explicitly
    /// cleaned entries are dropped.
    pub fn with_cleanup_interval(self, every: Duration) -> Self {
        self.sweeper
            .start("memory_cache", Arc::downgrade(&self.entries), every, entry_expired);
        self
    }

    /// Drop every expired entry now. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        sweep(&self.entries, Instant::now(), entry_expired)
    }

    /// Stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_open(&self) -> Result<(), CacheError> {
        if self.closed.load(Ordering::Acquire) {
            Err(CacheError::Closed)
        } else {
            Ok(())
        }
    }

    fn insert(&self, key: &str, value: Vec<u8>, expires_at: Option<Instant>) -> Result<(), CacheError> {
        self.ensure_open()?;
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    fn live(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        let value = self
            .entries
            .get(key)
            .map(|entry| (!entry.is_expired(now)).then(|| entry.value.clone()))?;
        if value.is_none() {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        value
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        self.ensure_open()?;
        Ok(self.live(key))
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        let expires_at = self.default_ttl.map(|ttl| Instant::now() + ttl);
        self.insert(key, value, expires_at)
    }

    async fn set_with_expiration(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        if ttl.is_zero() {
            return Err(CacheError::ExpirationNotInFuture);
        }
        self.insert(key, value, Some(Instant::now() + ttl))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.ensure_open()?;
        Ok(self.live(key).is_some())
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        self.sweeper.stop();
        self.entries.clear();
        Ok(())
    }
}

/// Middleware caching GET responses in a [`Cache`].
#[derive(Clone)]
pub struct ResponseCache {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
}

impl ResponseCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache, ttl: None }
    }

    /// Expire stored responses after `ttl`.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Middleware for ResponseCache {
    fn wrap(&self, next: BoxHandler) -> BoxHandler {
        Arc::new(CacheHandler {
            cache: Arc::clone(&self.cache),
            ttl: self.ttl,
            next,
        })
    }
}

struct CacheHandler {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
    next: BoxHandler,
}

fn replay_content_type(body: &[u8]) -> HeaderValue {
    if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
        HeaderValue::from_static("application/json")
    } else {
        HeaderValue::from_static("text/plain; charset=utf-8")
    }
}

impl CacheHandler {
    async fn store(&self, key: &str, body: Vec<u8>) {
        let result = match self.ttl {
            Some(ttl) => self.cache.set_with_expiration(key, body, ttl).await,
            None => self.cache.set(key, body).await,
        };
        if let Err(err) = result {
            tracing::warn!(key, error = %err, "Failed to store cached response");
        }
    }
}

#[async_trait]
impl Handler for CacheHandler {
    async fn call(&self, w: &mut dyn ResponseWriter, req: Request) -> HandlerResult {
        if req.method() != Method::GET {
            return self.next.call(w, req).await;
        }
        let key = format!("{}:{}", req.method(), req.uri().path());

        match self.cache.get(&key).await {
            Ok(Some(body)) => {
                tracing::debug!(key = %key, "Cache hit");
                w.set_header(header::CONTENT_TYPE, replay_content_type(&body));
                w.set_header(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
                w.set_header(X_CACHE, HeaderValue::from_static("HIT"));
                w.send(StatusCode::OK, &body).await?;
                return Ok(());
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(key = %key, error = %err, "Cache lookup failed");
                return self.next.call(w, req).await;
            }
        }

        w.set_header(X_CACHE, HeaderValue::from_static("MISS"));
        let mut recorder = BodyRecorder::new(w);
        let result = self.next.call(&mut recorder, req).await;
        let cacheable = result.is_ok()
            && !recorder.is_hijacked()
            && recorder.status() == StatusCode::OK
            && !recorder.body().is_empty();
        if cacheable {
            self.store(&key, recorder.into_body()).await;
        }
        result
    }
}
