#![deny(rust_2018_idioms)]

//! Mutual exclusion / single-flight middleware.
//!
//! A caller holds a `tokio::sync::Mutex` guard across the (single)
//! in-flight attempt, so concurrent callers naturally serialize on it --
//! the first one through does the work, and everyone behind it observes
//! the same cached outcome without redoing it.
//!
//! Used by the outbound chain so that two requests racing to use the same
//! peer+transport connection don't open two TCP connections.

use std::sync::Arc;
use tokio::sync::Mutex;

enum State<T> {
    Empty,
    Value(T),
    Poisoned(Arc<corral2_error::Error>),
}

/// A single-flight cell: the first caller to call [`Lock::get_or_init`]
/// computes the value; everyone else -- concurrent or later -- gets the
/// cached value or the cached poison error.
pub struct Lock<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone> Default for Lock<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Lock<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Empty),
        }
    }

    /// Returns the cached value, or runs `f` to produce (and cache) one.
    /// Holds the internal mutex across `f`'s execution, so concurrent
    /// callers queue behind the first rather than each calling `f`.
    pub async fn get_or_init<F, Fut>(&self, f: F) -> Result<T, Arc<corral2_error::Error>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, corral2_error::Error>>,
    {
        let mut guard = self.state.lock().await;
        match &*guard {
            State::Value(v) => return Ok(v.clone()),
            State::Poisoned(e) => return Err(e.clone()),
            State::Empty => {}
        }

        match f().await {
            Ok(v) => {
                *guard = State::Value(v.clone());
                Ok(v)
            }
            Err(e) => {
                let e = Arc::new(e);
                *guard = State::Poisoned(e.clone());
                Err(e)
            }
        }
    }

    /// Clears a poisoned (or populated) cell so the next `get_or_init` call
    /// attempts the work again -- used after a backoff interval elapses.
    pub async fn reset(&self) {
        *self.state.lock().await = State::Empty;
    }

    pub async fn is_poisoned(&self) -> bool {
        matches!(&*self.state.lock().await, State::Poisoned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_invocation() {
        let lock = Arc::new(Lock::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let lock = lock.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                lock.get_or_init(|| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    Ok(42)
                })
                .await
                .unwrap()
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poisoned_cell_returns_cached_error_to_losers() {
        let lock = Arc::new(Lock::<u32>::new());
        let first = lock
            .get_or_init(|| async { Err(corral2_error::Error::unavailable("dial failed")) })
            .await;
        assert!(first.is_err());

        let second = lock.get_or_init(|| async { Ok(1) }).await;
        assert!(second.is_err());
        assert!(lock.is_poisoned().await);

        lock.reset().await;
        let third = lock.get_or_init(|| async { Ok(7) }).await.unwrap();
        assert_eq!(third, 7);
    }
}
