//! [`Cache`] backed by a Redis server.
//!
//! Values are stored as raw bytes under the caller's key. Every write
//! carries an expiry: [`Cache::set`] uses the default TTL (five minutes
//! unless overridden), so entries never outlive the server's own eviction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError};

use super::cache::{Cache, CacheError};

pub const DEFAULT_REDIS_TTL: Duration = Duration::from_secs(5 * 60);

fn backend(err: RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

/// Whole seconds for `SET ... EX`, rounding sub-second remainders up.
fn expiry_secs(ttl: Duration) -> Result<u64, CacheError> {
    if ttl.is_zero() {
        return Err(CacheError::ExpirationNotInFuture);
    }
    Ok(ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0))
}

pub struct RedisCache {
    connection: ConnectionManager,
    default_ttl: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("default_ttl", &self.default_ttl)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect to `url` (`redis://host:port/db`) and check the server answers `PING`.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(backend)?;
        let mut connection = client.get_connection_manager().await.map_err(backend)?;
        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await
            .map_err(backend)?;
        tracing::info!(url, "Connected to Redis cache");
        Ok(Self {
            connection,
            default_ttl: DEFAULT_REDIS_TTL,
            closed: AtomicBool::new(false),
        })
    }

    /// Expiry applied by [`Cache::set`].
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn connection(&self) -> Result<ConnectionManager, CacheError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        Ok(self.connection.clone())
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut connection = self.connection()?;
        redis::cmd("GET")
            .arg(key)
            .query_async::<Option<Vec<u8>>>(&mut connection)
            .await
            .map_err(backend)
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), CacheError> {
        self.set_with_expiration(key, value, self.default_ttl).await
    }

    async fn set_with_expiration(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let secs = expiry_secs(ttl)?;
        let mut connection = self.connection()?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(secs)
            .query_async::<()>(&mut connection)
            .await
            .map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut connection = self.connection()?;
        let removed = redis::cmd("DEL")
            .arg(key)
            .query_async::<u64>(&mut connection)
            .await
            .map_err(backend)?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut connection = self.connection()?;
        let found = redis::cmd("EXISTS")
            .arg(key)
            .query_async::<u64>(&mut connection)
            .await
            .map_err(backend)?;
        Ok(found > 0)
    }

    /// Refuse further calls. The pooled connection is released on drop.
    async fn close(&self) -> Result<(), CacheError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
