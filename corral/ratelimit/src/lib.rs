#![deny(rust_2018_idioms)]

//! The token-bucket rate limiter: a non-blocking admission decision driven
//! by a single atomic "time of next permissible request", advanced on
//! every call regardless of whether that call was admitted.
//!
//! `minAllowableTime` wants to live in an absolute time domain (nanoseconds
//! since some fixed epoch) so that an idle bucket looks arbitrarily
//! "behind" rather than pinned at some small number close to zero.
//! [`corral2_clock::Clock`] only hands out [`Instant`]s, which have no
//! fixed epoch, so this crate fakes one: the state is seeded, at
//! construction, far enough before the clock's current reading that the
//! very first `burst` calls see the same clamp-to-floor behavior an
//! epoch-nanos representation would give them for free.

use corral2_clock::{Clock, RealClock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// How many times `throttle` retries a lost CAS race before giving up and
/// leaning toward rejecting the call.
const MAX_CAS_RETRIES: usize = 8;

/// A non-blocking, lock-free token bucket. Cheap to share: every field is
/// either `Copy` or an atomic.
pub struct RateLimiter<C = RealClock> {
    clock: C,
    reference: Instant,
    min_allowable_nanos: AtomicI64,
    request_interval_nanos: i64,
    max_slack_nanos: i64,
}

impl RateLimiter<RealClock> {
    pub fn new(rps: u32, burst: u32) -> Self {
        Self::with_clock(RealClock, rps, burst)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(clock: C, rps: u32, burst: u32) -> Self {
        assert!(rps > 0, "rps must be positive");
        let request_interval_nanos = 1_000_000_000i64 / rps as i64;
        let max_slack_nanos = request_interval_nanos * burst as i64;
        let reference = clock.now();
        // Seed the state strictly before any floor the first call could
        // compute, so the initial burst is admitted exactly as it would be
        // against a real epoch-nanos reading of "a long time ago".
        let initial = -(max_slack_nanos + request_interval_nanos);
        Self {
            clock,
            reference,
            min_allowable_nanos: AtomicI64::new(initial),
            request_interval_nanos,
            max_slack_nanos,
        }
    }

    fn nanos_since_reference(&self, instant: Instant) -> i64 {
        instant.saturating_duration_since(self.reference).as_nanos() as i64
    }

    /// Returns `true` iff this call should be dropped. Never blocks or
    /// awaits -- at most `MAX_CAS_RETRIES` spin iterations.
    pub fn throttle(&self) -> bool {
        let now = self.nanos_since_reference(self.clock.now());
        let mut observed = self.min_allowable_nanos.load(Ordering::Acquire);

        for _ in 0..MAX_CAS_RETRIES {
            let floor = now - self.max_slack_nanos;
            let clamped = observed.max(floor);
            let would_throttle = now <= clamped;
            let next = clamped + self.request_interval_nanos;

            match self.min_allowable_nanos.compare_exchange_weak(
                observed,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return would_throttle,
                Err(actual) => observed = actual,
            }
        }
        true
    }
}
