#![deny(rust_2018_idioms)]

//! Reconnect-with-backoff middleware.
//!
//! Rather than retrying a failed connect immediately (and potentially
//! hot-looping against a peer that's down), each failure advances an
//! exponential backoff with full jitter, and the caller awaits that delay
//! before the connector is invoked again.

use corral2_clock::Clock;
use corral2_error::Error;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, trace};

/// `base * 2^attempt`, clamped to `max`, with full jitter (a uniform draw
/// in `[0, computed)`) -- the same shape AWS's exponential-backoff-with-
/// jitter guidance describes.
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_millis().saturating_mul(1u128 << attempt.min(20));
        let capped = exp.min(self.max.as_millis());
        Duration::from_millis(capped as u64)
    }

    /// Samples a jittered delay for the given zero-indexed attempt number.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let ceiling = self.delay_for(attempt);
        if ceiling.is_zero() {
            return ceiling;
        }
        let millis = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
        Duration::from_millis(millis)
    }
}

/// Drives repeated connection attempts against a peer's connector,
/// sleeping a jittered backoff between failures.
pub struct Reconnect<C> {
    clock: C,
    backoff: Backoff,
    attempt: u32,
}

impl<C: Clock> Reconnect<C> {
    pub fn new(clock: C, backoff: Backoff) -> Self {
        Self {
            clock,
            backoff,
            attempt: 0,
        }
    }

    /// Runs `connect` until it succeeds, sleeping a jittered backoff between
    /// failed attempts. `connect` is re-invoked from scratch each time: the
    /// caller is expected to dial a fresh connection, not retry a single
    /// handshake.
    pub async fn connect<T, F, Fut>(&mut self, mut connect: F) -> T
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        loop {
            match connect().await {
                Ok(value) => {
                    if self.attempt > 0 {
                        debug!(attempts = self.attempt + 1, "reconnected");
                    }
                    self.attempt = 0;
                    return value;
                }
                Err(error) => {
                    let delay = self.backoff.jittered(self.attempt);
                    trace!(%error, attempt = self.attempt, ?delay, "connect failed, backing off");
                    self.attempt = self.attempt.saturating_add(1);
                    if !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Runs `connect` at most `max_attempts` times, returning the last
    /// error if every attempt fails -- used by callers (e.g. the queue
    /// transport's startup policy) that must give up rather than retry
    /// forever.
    pub async fn connect_bounded<T, F, Fut>(
        &mut self,
        max_attempts: u32,
        mut connect: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        let mut last_err = None;
        for attempt in 0..max_attempts {
            match connect().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    let delay = self.backoff.jittered(attempt);
                    trace!(%error, attempt, ?delay, "bounded connect attempt failed");
                    last_err = Some(error);
                    if attempt + 1 < max_attempts && !delay.is_zero() {
                        self.clock.sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::unavailable("no connect attempts were made")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral2_clock::FakeClock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn retries_until_success_sleeping_between_attempts() {
        let clock = FakeClock::new();
        let backoff = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut reconnect = Reconnect::new(clock.clone(), backoff);
        let attempts = Arc::new(AtomicU32::new(0));

        let a = attempts.clone();
        let driver = tokio::spawn(async move {
            reconnect
                .connect(|| {
                    let a = a.clone();
                    async move {
                        let n = a.fetch_add(1, Ordering::SeqCst);
                        if n < 2 {
                            Err(Error::unavailable("down"))
                        } else {
                            Ok(n)
                        }
                    }
                })
                .await
        });

        // allow the two failed attempts to register and sleep
        for _ in 0..5 {
            tokio::task::yield_now().await;
            clock.advance(Duration::from_secs(1));
        }

        let result = driver.await.unwrap();
        assert_eq!(result, 2);
        assert!(attempts.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test]
    async fn bounded_connect_gives_up_after_max_attempts() {
        let clock = FakeClock::new();
        let backoff = Backoff::new(Duration::from_millis(1), Duration::from_millis(1));
        let mut reconnect = Reconnect::new(clock.clone(), backoff);

        let driver = tokio::spawn(async move {
            reconnect
                .connect_bounded(3, || async { Err::<(), _>(Error::unavailable("still down")) })
                .await
        });

        for _ in 0..5 {
            tokio::task::yield_now().await;
            clock.advance(Duration::from_millis(1));
        }

        let err = driver.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::Unavailable);
    }

    #[test]
    fn backoff_is_clamped_to_max() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500));
        assert!(backoff.delay_for(10) <= Duration::from_millis(500));
    }
}
