#![deny(rust_2018_idioms)]

//! A clock abstraction so that timer-driven logic (deadlines, backoff, the
//! token-bucket rate limiter's "now") can run against either real wall-clock
//! time or a manually-advanced fake clock in tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// A source of "now" and of sleep futures. `Clone` is cheap (an `Arc`
/// handle); every component that needs to tell time takes `C: Clock` rather
/// than calling `Instant::now()`/`tokio::time::sleep` directly.
#[async_trait]
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Resolves once `dur` has elapsed according to this clock.
    async fn sleep(&self, dur: Duration);
}

/// The real clock: `Instant::now()` plus `tokio::time::sleep`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RealClock;

#[async_trait]
impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// A fake clock: time only moves when [`FakeClock::advance`] is called.
/// Timers waiting on [`Clock::sleep`] fire in deadline order, ties broken by
/// the order they were registered (insertion order), so timer-driven logic
/// is deterministic under test.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    now: Instant,
    next_seq: u64,
    timers: Vec<Timer>,
}

struct Timer {
    deadline: Instant,
    seq: u64,
    tx: Option<oneshot::Sender<()>>,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                now: Instant::now(),
                next_seq: 0,
                timers: Vec::new(),
            })),
        }
    }

    /// Advances time by `dur`, firing (in deadline order, ties by insertion
    /// order) every timer whose deadline is now `<=` the new time.
    pub fn advance(&self, dur: Duration) {
        let mut inner = self.inner.lock().unwrap();
        inner.now += dur;
        let now = inner.now;

        let mut due: Vec<Timer> = Vec::new();
        let mut remaining = Vec::new();
        std::mem::swap(&mut remaining, &mut inner.timers);
        for t in remaining {
            if t.deadline <= now {
                due.push(t);
            } else {
                inner.timers.push(t);
            }
        }
        due.sort_by(|a, b| a.deadline.cmp(&b.deadline).then(a.seq.cmp(&b.seq)));
        for mut t in due {
            if let Some(tx) = t.tx.take() {
                let _ = tx.send(());
            }
        }
    }

    pub fn pending_timers(&self) -> usize {
        self.inner.lock().unwrap().timers.len()
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.inner.lock().unwrap().now
    }

    async fn sleep(&self, dur: Duration) {
        let rx = {
            let mut inner = self.inner.lock().unwrap();
            let deadline = inner.now + dur;
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            if dur == Duration::ZERO {
                let _ = tx.send(());
            } else {
                inner.timers.push(Timer {
                    deadline,
                    seq,
                    tx: Some(tx),
                });
            }
            rx
        };
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_timers_in_deadline_then_insertion_order() {
        let clock = FakeClock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        // two timers due at +10ms (registered first and second), one at +5ms
        for (label, dur) in [("a", 10), ("b", 10), ("c", 5)] {
            let clock = clock.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                clock.sleep(Duration::from_millis(dur)).await;
                order.lock().unwrap().push(label);
            }));
            // ensure registration order matches spawn order
            tokio::task::yield_now().await;
        }

        clock.advance(Duration::from_millis(10));
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn advance_only_fires_due_timers() {
        let clock = FakeClock::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let f = fired.clone();
        let c = clock.clone();
        let handle = tokio::spawn(async move {
            c.sleep(Duration::from_millis(100)).await;
            f.fetch_add(1, Ordering::SeqCst);
        });
        tokio::task::yield_now().await;

        clock.advance(Duration::from_millis(50));
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(clock.pending_timers(), 1);

        clock.advance(Duration::from_millis(50));
        handle.await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
