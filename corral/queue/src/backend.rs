//! The list operations the queue transport needs from its backing store,
//! and two implementations: a real Redis client and an in-process double
//! for tests that would otherwise need a live Redis to exercise the
//! inbound loop's blocking-pop semantics.

use async_trait::async_trait;
use bytes::Bytes;
use corral2_error::{Error, Kind};
use redis::AsyncCommands;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// The subset of Redis list commands the queue transport drives: a
/// blocking move for the inbound loop, a removal once an item has been
/// durably claimed, and a push for outbound sends.
#[async_trait]
pub trait Backend: Send + Sync {
    /// A cheap liveness check used only by the startup policy.
    async fn ping(&self) -> Result<(), Error>;

    /// Blocks up to `timeout` for an item to appear on `source`, moving it
    /// to `destination` atomically. `Ok(None)` means the timeout elapsed
    /// with nothing to pop.
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, Error>;

    /// Removes one occurrence of `value` from `key`.
    async fn lrem(&self, key: &str, value: &[u8]) -> Result<(), Error>;

    /// Pushes `value` onto the head of `key`.
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error>;
}

fn backend_error(context: &'static str, e: redis::RedisError) -> Error {
    Error::with_cause(Kind::Unavailable, context, e)
}

/// A [`Backend`] over a real Redis server, via `redis`'s
/// auto-reconnecting [`redis::aio::ConnectionManager`]. The manager is
/// cheap to clone -- every call clones it rather than holding a lock
/// across an await, matching how the crate is meant to be used.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url)
            .map_err(|e| backend_error("invalid redis connection string", e))?;
        let manager = client
            .get_tokio_connection_manager()
            .await
            .map_err(|e| backend_error("failed to connect to redis", e))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn ping(&self) -> Result<(), Error> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| backend_error("redis ping failed", e))?;
        Ok(())
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, Error> {
        let mut conn = self.manager.clone();
        let timeout_secs = timeout.as_secs_f64().max(0.0);
        let result: Option<Vec<u8>> = conn
            .brpoplpush(source, destination, timeout_secs)
            .await
            .map_err(|e| backend_error("redis BRPOPLPUSH failed", e))?;
        Ok(result.map(Bytes::from))
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .lrem(key, 1, value)
            .await
            .map_err(|e| backend_error("redis LREM failed", e))?;
        Ok(())
    }

    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut conn = self.manager.clone();
        let _: i64 = conn
            .lpush(key, value)
            .await
            .map_err(|e| backend_error("redis LPUSH failed", e))?;
        Ok(())
    }
}

/// An in-process [`Backend`] double. Supports the same blocking-pop
/// semantics as Redis (a push on an empty source wakes a waiting
/// `brpoplpush` immediately) without a network round trip.
#[derive(Default)]
pub struct InMemoryBackend {
    lists: Mutex<HashMap<String, VecDeque<Bytes>>>,
    notify: Notify,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    async fn ping(&self) -> Result<(), Error> {
        Ok(())
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> Result<Option<Bytes>, Error> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut lists = self.lists.lock().await;
                if let Some(item) = lists.entry(source.to_string()).or_default().pop_back() {
                    lists.entry(destination.to_string()).or_default().push_front(item.clone());
                    return Ok(Some(item));
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn lrem(&self, key: &str, value: &[u8]) -> Result<(), Error> {
        let mut lists = self.lists.lock().await;
        if let Some(list) = lists.get_mut(key) {
            if let Some(pos) = list.iter().position(|v| v.as_ref() == value) {
                list.remove(pos);
            }
        }
        Ok(())
    }

    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        let mut lists = self.lists.lock().await;
        lists.entry(key.to_string()).or_default().push_front(Bytes::from(value));
        drop(lists);
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn brpoplpush_times_out_on_an_empty_source() {
        let backend = InMemoryBackend::new();
        let result = backend
            .brpoplpush("src", "processing", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn brpoplpush_moves_the_item_to_the_destination() {
        let backend = InMemoryBackend::new();
        backend.lpush("src", b"item".to_vec()).await.unwrap();

        let popped = backend
            .brpoplpush("src", "processing", Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(popped.as_deref(), Some(&b"item"[..]));

        backend.lrem("processing", b"item").await.unwrap();
        let again = backend
            .brpoplpush("processing", "src", Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn brpoplpush_wakes_immediately_on_a_concurrent_push() {
        let backend = std::sync::Arc::new(InMemoryBackend::new());
        let waiter = tokio::spawn({
            let backend = backend.clone();
            async move { backend.brpoplpush("src", "processing", Duration::from_secs(5)).await }
        });

        tokio::task::yield_now().await;
        backend.lpush("src", b"woken".to_vec()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(result.as_deref(), Some(&b"woken"[..]));
    }
}
