//! Connection bookkeeping shared by the backends.
//!
//! # Responsibilities
//! - Hand out a process-unique `conn-N` id per accepted connection
//! - Count live connections and mirror the count into the metrics gauge
//! - Log how long each connection stayed open

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::observability::metrics::{CONNECTIONS_ACCEPTED_TOTAL, CONNECTIONS_ACTIVE};

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier, rendered as `conn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Live connection count for one backend. Clones share the count.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    live: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a freshly accepted connection until the returned guard drops.
    pub fn track(&self) -> ConnectionGuard {
        self.live.fetch_add(1, Ordering::SeqCst);
        metrics::counter!(CONNECTIONS_ACCEPTED_TOTAL).increment(1);
        metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
        ConnectionGuard {
            live: Arc::clone(&self.live),
            id: ConnectionId::next(),
            opened_at: Instant::now(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.live.load(Ordering::SeqCst)
    }
}

/// One tracked connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    live: Arc<AtomicU64>,
    id: ConnectionId,
    opened_at: Instant,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
        tracing::trace!(
            connection_id = %self.id,
            open_ms = self.opened_at.elapsed().as_millis() as u64,
            "Connection closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_prefixed() {
        let first = ConnectionId::next();
        let second = ConnectionId::next();
        assert_ne!(first, second);
        assert!(second.as_u64() > first.as_u64());
        assert_eq!(first.to_string(), format!("conn-{}", first.as_u64()));
    }

    #[test]
    fn clones_share_the_live_count() {
        let tracker = ConnectionTracker::new();
        let shared = tracker.clone();

        let a = tracker.track();
        let b = shared.track();
        assert_eq!(tracker.active_count(), 2);
        assert_ne!(a.id(), b.id());

        drop(a);
        assert_eq!(shared.active_count(), 1);
        drop(b);
        assert_eq!(tracker.active_count(), 0);
    }
}
