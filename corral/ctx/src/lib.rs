#![deny(rust_2018_idioms)]

//! A per-call cancellation/deadline context, threaded through choosers, the
//! router, and the outbound call chain the way a `context.Context` would be
//! in the source system this crate's vocabulary is modeled on.
//!
//! `Ctx` pairs an optional deadline with an explicit [`tokio_util::sync::
//! CancellationToken`], and exposes a single `done()` future so a multi-wait
//! (deadline, cancellation, or some other event) can race all three with
//! first-to-fire semantics.

use corral2_error::Error;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug)]
pub struct Ctx {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}

impl Ctx {
    /// A context with no deadline and no cancellation -- analogous to
    /// `context.Background()`. Most of this crate's safety rules forbid
    /// *outbound* calls from using this directly; it exists as the root a
    /// real deadline is derived from.
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Derives a child context with a deadline `timeout` from now. If the
    /// parent already has an earlier deadline, the earlier one wins.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(d) if d < deadline => Some(d),
            _ => Some(deadline),
        };
        Self {
            deadline,
            cancel: self.cancel.child_token(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Explicitly cancels this context and every child derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// True once the deadline has passed or the context was cancelled.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Resolves when this context is done, whichever of deadline or
    /// cancellation fires first.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.into()) => {}
                }
            }
            None => self.cancel.cancelled().await,
        }
    }

    /// Races `fut` against this context's `done()` signal. Returns the
    /// classified error (`DeadlineExceeded` or `Cancelled`) if `done()` fires
    /// first.
    pub async fn select<F, T>(&self, fut: F) -> Result<T, Error>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            out = fut => Ok(out),
            _ = self.done() => Err(self.done_error()),
        }
    }

    fn done_error(&self) -> Error {
        if self.is_cancelled() {
            Error::cancelled("context cancelled")
        } else {
            Error::deadline_exceeded("context deadline exceeded")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn select_returns_deadline_exceeded_on_timeout() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(10));
        let err = ctx
            .select(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn select_returns_cancelled_when_cancelled() {
        let ctx = Ctx::background();
        let child = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            child.cancel();
        });
        let err = ctx
            .select(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::Cancelled);
    }

    #[tokio::test]
    async fn select_returns_ok_when_future_wins() {
        let ctx = Ctx::background().with_timeout(Duration::from_secs(3600));
        let out = ctx.select(async { 42 }).await.unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn child_deadline_cannot_exceed_parent() {
        let parent = Ctx::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(parent.deadline(), child.deadline());
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let parent = Ctx::background();
        let child = parent.with_timeout(Duration::from_secs(1));
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
