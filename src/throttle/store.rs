//! Counter store trait and the in-memory implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use super::counter::WindowCounter;

/// Errors raised by counter store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
}

/// Storage for window counters.
///
/// The throttler only needs an atomic increment plus a read for
/// introspection. Implementations own expiry: once a key's TTL elapses it
/// must read as absent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to `key` and return the new count.
    ///
    /// An absent or expired key starts at 1 and lives for `ttl_secs`.
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError>;

    /// Read the live count for `key` without incrementing.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Drop every counter.
    async fn clear(&self) -> Result<(), StoreError>;
}

/// Process-local counter store.
///
/// Increments hold the `DashMap` shard lock for the whole
/// reset-then-increment sequence, so concurrent requests on one key never
/// lose updates. Keys of past windows are never read again, so the first
/// increment in each new second sweeps expired entries. A background
/// [`MemoryStore::spawn_sweeper`] additionally frees memory while idle.
pub struct MemoryStore {
    counters: DashMap<String, WindowCounter>,
    clock: Arc<dyn Clock>,
    /// Unix second of the last inline sweep
    last_sweep: AtomicU64,
}

impl MemoryStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            clock,
            last_sweep: AtomicU64::new(0),
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Remove expired entries. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_at(self.clock.unix_secs())
    }

    /// Sweep at most once per clock second. Only the caller that advances
    /// `last_sweep` does the work.
    fn sweep_if_due(&self, now: u64) {
        let last = self.last_sweep.load(Ordering::Relaxed);
        if now > last
            && self
                .last_sweep
                .compare_exchange(last, now, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            let removed = self.sweep_at(now);
            if removed > 0 {
                trace!(removed, "Evicted expired counters");
            }
        }
    }

    fn sweep_at(&self, now: u64) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| !counter.is_expired(now));
        before.saturating_sub(self.counters.len())
    }

    /// Periodically sweep expired entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired();
                if removed > 0 {
                    debug!(removed, remaining = store.len(), "Swept expired counters");
                }
            }
        })
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl_secs: u64) -> Result<u64, StoreError> {
        let now = self.clock.unix_secs();
        // Must run before taking the entry: retain locks every shard.
        self.sweep_if_due(now);

        let mut counter = self
            .counters
            .entry(key.to_string())
            .or_insert_with(|| {
                debug!(key = %key, ttl_secs, "Creating window counter");
                WindowCounter::new(now, ttl_secs)
            });
        let count = counter.increment(now, ttl_secs);

        trace!(key = %key, count, expires_at = counter.expires_at(), "Incremented counter");
        Ok(count)
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        let now = self.clock.unix_secs();
        Ok(self.counters.get(key).and_then(|counter| counter.current(now)))
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.counters.clear();
        Ok(())
    }
}
