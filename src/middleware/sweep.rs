//! Background expiry sweep shared by the in-memory stores.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Remove every entry `is_expired` reports as expired at `now`.
/// Returns how many were removed.
pub(crate) fn sweep<K, V>(map: &DashMap<K, V>, now: Instant, is_expired: fn(&V, Instant) -> bool) -> usize
where
    K: Eq + Hash,
{
    let before = map.len();
    map.retain(|_, value| !is_expired(value, now));
    before.saturating_sub(map.len())
}

/// Handle on a running sweep task. Stopping it, or dropping the map, ends it.
#[derive(Debug, Default)]
pub(crate) struct Sweeper {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    /// Sweep `map` every `every` on the current Tokio runtime.
    ///
    /// Outside a runtime nothing is started and entries are only dropped by
    /// explicit cleanup.
    pub(crate) fn start<K, V>(
        &self,
        store: &'static str,
        map: Weak<DashMap<K, V>>,
        every: Duration,
        is_expired: fn(&V, Instant) -> bool,
    ) where
        K: Eq + Hash + Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(store, "No Tokio runtime; expired entries will not be swept");
            return;
        };
        let task = runtime.spawn(async move {
            let mut ticks = tokio::time::interval(every);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let Some(map) = map.upgrade() else {
                    break;
                };
                let removed = sweep(&map, Instant::now(), is_expired);
                if removed > 0 {
                    tracing::debug!(store, removed, "Swept expired entries");
                }
            }
        });
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task)
        {
            previous.abort();
        }
    }

    pub(crate) fn stop(&self) {
        if let Some(task) = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
