#![deny(rust_2018_idioms)]

//! A bounded, idle-evicting cache keyed by target.
//!
//! Entries are created lazily on first access, capped at `capacity`, and
//! reclaimed by a background purge task once they've sat unused longer
//! than `max_idle_age`.

use corral2_clock::Clock;
use corral2_error::Error;
use indexmap::IndexMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

struct Entry<V> {
    value: V,
    last_used: Instant,
}

struct Inner<K, V> {
    capacity: usize,
    max_idle_age: Duration,
    entries: IndexMap<K, Entry<V>>,
}

impl<K: Clone + Eq + Hash, V: Clone> Inner<K, V> {
    fn access(&mut self, key: &K, now: Instant) -> Option<V> {
        let entry = self.entries.get_mut(key)?;
        entry.last_used = now;
        Some(entry.value.clone())
    }

    fn can_insert(&self) -> bool {
        self.entries.len() < self.capacity
    }

    fn insert(&mut self, key: K, value: V, now: Instant) {
        self.entries.insert(key, Entry { value, last_used: now });
    }

    fn purge(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_used) < self.max_idle_age);
        before - self.entries.len()
    }
}

/// A shareable cache handle. Cheap to clone; every clone sees the same
/// underlying entries.
pub struct Cache<K, V, C> {
    inner: Arc<Mutex<Inner<K, V>>>,
    clock: C,
    max_idle_age: Duration,
}

impl<K, V, C: Clone> Clone for Cache<K, V, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            clock: self.clock.clone(),
            max_idle_age: self.max_idle_age,
        }
    }
}

impl<K, V, C> Cache<K, V, C>
where
    K: Clone + Eq + Hash + Send + 'static,
    V: Clone + Send + 'static,
    C: Clock,
{
    pub fn new(capacity: usize, max_idle_age: Duration, clock: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                capacity,
                max_idle_age,
                entries: IndexMap::new(),
            })),
            clock,
            max_idle_age,
        }
    }

    /// Returns the cached value for `key`, or runs `make` to produce,
    /// insert, and return one. Fails with `ResourceExhausted` if the cache
    /// is full and `key` isn't already present.
    pub async fn get_or_insert_with<F, Fut>(&self, key: K, make: F) -> Result<V, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        if let Some(v) = inner.access(&key, now) {
            return Ok(v);
        }
        if !inner.can_insert() {
            return Err(Error::new(
                corral2_error::Kind::ResourceExhausted,
                format!("cache at capacity ({})", inner.capacity),
            ));
        }
        let value = make().await;
        inner.insert(key, value.clone(), now);
        Ok(value)
    }

    /// Returns the cached value for `key` if present, refreshing its
    /// `last_used` time. Unlike [`Cache::get_or_insert_with`], a miss
    /// returns `None` rather than populating the entry.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        self.inner.lock().await.access(key, now)
    }

    /// A snapshot of every currently-cached value, in insertion order.
    pub async fn values(&self) -> Vec<V> {
        self.inner.lock().await.entries.values().map(|e| e.value.clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawns a background task that periodically evicts entries idle
    /// longer than `max_idle_age`. Dropping the returned handle does not
    /// stop the task; callers that need to stop it should abort the handle
    /// explicitly.
    pub fn spawn_purge(&self) -> JoinHandle<()>
    where
        K: std::fmt::Debug,
    {
        let inner = self.inner.clone();
        let clock = self.clock.clone();
        // purge twice per idle window so eviction latency is bounded
        // without the task running a tight loop.
        let interval = std::cmp::max(Duration::from_millis(1), self.max_idle_age / 2);
        tokio::spawn(async move {
            loop {
                clock.sleep(interval).await;
                let now = clock.now();
                let evicted = inner.lock().await.purge(now);
                if evicted > 0 {
                    debug!(evicted, "purged idle cache entries");
                }
            }
        })
    }
}
