//! TTL cache for expensive upstream reads.
//!
//! Each key maps to a shared [`OnceCell`]. The first caller for a missing or
//! expired key installs a fresh cell and runs the fetch; callers arriving
//! while that fetch is in flight await the same cell instead of issuing a
//! second upstream request. Failed fetches are never stored: a caller already
//! waiting on the cell retries with its own fetch, otherwise the slot is
//! dropped and the next caller starts over.
//!
//! Expiry uses [`tokio::time::Instant`], so tests can drive it with a paused
//! clock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
}

type Slot<V> = Arc<OnceCell<Entry<V>>>;

/// Counters reported by [`TtlCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Callers that joined a fetch already in flight.
    pub coalesced: u64,
}

#[derive(Debug)]
pub struct TtlCache<V> {
    slots: Mutex<HashMap<String, Slot<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl<V> Default for TtlCache<V> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> TtlCache<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot<V>>> {
        // Slot maps stay consistent even if a holder panicked.
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Return the cached value for `key`, or run `fetch` and cache its result
    /// for `ttl`.
    ///
    /// # Errors
    ///
    /// Propagates the fetch error; errors are never cached.
    pub async fn get_or_fetch<F, Fut, E>(&self, key: &str, ttl: Duration, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let now = Instant::now();
        let slot = {
            let mut slots = self.slots();
            match slots.get(key) {
                Some(slot) => match slot.get() {
                    Some(entry) if now < entry.expires_at => {
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(entry.value.clone());
                    }
                    Some(_) => {
                        self.misses.fetch_add(1, Ordering::Relaxed);
                        let fresh: Slot<V> = Arc::new(OnceCell::new());
                        slots.insert(key.to_string(), Arc::clone(&fresh));
                        fresh
                    }
                    None => {
                        self.coalesced.fetch_add(1, Ordering::Relaxed);
                        Arc::clone(slot)
                    }
                },
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let fresh: Slot<V> = Arc::new(OnceCell::new());
                    slots.insert(key.to_string(), Arc::clone(&fresh));
                    fresh
                }
            }
        };

        let result = slot
            .get_or_try_init(|| async {
                let value = fetch().await?;
                Ok(Entry {
                    value,
                    expires_at: Instant::now() + ttl,
                })
            })
            .await;

        match result {
            Ok(entry) => Ok(entry.value.clone()),
            Err(err) => {
                let mut slots = self.slots();
                // Coalesced waiters still holding the cell retry the fetch on it
                // themselves; the slot goes only once nobody else is attached.
                let abandoned = slots.get(key).is_some_and(|current| {
                    Arc::ptr_eq(current, &slot)
                        && !current.initialized()
                        && Arc::strong_count(current) == 2
                });
                if abandoned {
                    slots.remove(key);
                }
                Err(err)
            }
        }
    }

    /// Drop one key.
    pub fn invalidate(&self, key: &str) {
        self.slots().remove(key);
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut slots = self.slots();
        let dropped = slots.len();
        slots.clear();
        tracing::debug!(dropped, "cache cleared");
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}
