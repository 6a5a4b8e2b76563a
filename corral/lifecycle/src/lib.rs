#![deny(rust_2018_idioms)]

//! Idempotent start/stop, shared by every inbound, outbound and chooser: a
//! concurrent pile of callers can call `start`/`stop`/`wait_until_running`
//! and the side-effecting closures still run exactly once each, with late
//! callers observing the first outcome.

use corral2_error::{Error, Kind};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::Notify;
use tokio::time::Duration;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct Inner {
    state: State,
    start_result: Option<Result<(), Arc<Error>>>,
    stop_result: Option<Result<(), Arc<Error>>>,
}

/// A shareable idempotent lifecycle gate. Cheap to clone (an `Arc` handle).
#[derive(Clone)]
pub struct Lifecycle {
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                state: State::Idle,
                start_result: None,
                stop_result: None,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Runs `f` exactly once. Concurrent and subsequent callers observe the
    /// same outcome without re-invoking `f`.
    pub async fn start<F, Fut>(&self, f: F) -> Result<(), Arc<Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let mut f = Some(f);
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(result) = &inner.start_result {
                    return result.clone();
                }
                if inner.state == State::Idle {
                    inner.state = State::Starting;
                } else {
                    // another caller is starting; wait for it.
                    drop(inner);
                    self.notify.notified().await;
                    continue;
                }
            }

            trace!("lifecycle starting");
            let f = f.take().expect("start invoked once per Starting transition");
            let result = f().await.map_err(Arc::new);

            let mut inner = self.inner.lock().await;
            inner.state = if result.is_ok() {
                State::Running
            } else {
                State::Idle
            };
            inner.start_result = Some(result.clone());
            drop(inner);
            self.notify.notify_waiters();
            return result;
        }
    }

    /// Runs `f` exactly once, iff `start` has already run (successfully or
    /// not). Waits for an in-flight `start` to settle first. A no-op if
    /// `start` was never called.
    pub async fn stop<F, Fut>(&self, f: F) -> Result<(), Arc<Error>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), Error>>,
    {
        let mut f = Some(f);
        loop {
            let mut inner = self.inner.lock().await;
            if let Some(result) = &inner.stop_result {
                return result.clone();
            }
            match inner.state {
                State::Idle => {
                    // start never ran: stop is a no-op.
                    inner.stop_result = Some(Ok(()));
                    return Ok(());
                }
                State::Starting => {
                    drop(inner);
                    self.notify.notified().await;
                    continue;
                }
                State::Running | State::Stopping => {
                    if inner.state == State::Running {
                        inner.state = State::Stopping;
                    } else {
                        drop(inner);
                        self.notify.notified().await;
                        continue;
                    }
                }
                State::Stopped => unreachable!("stopped implies stop_result is set"),
            }
            drop(inner);

            trace!("lifecycle stopping");
            let f = f.take().expect("stop invoked once per Stopping transition");
            let result = f().await.map_err(Arc::new);

            let mut inner = self.inner.lock().await;
            inner.state = State::Stopped;
            inner.stop_result = Some(result.clone());
            drop(inner);
            self.notify.notify_waiters();
            return result;
        }
    }

    /// Blocks until `start` has completed (successfully), or `deadline`
    /// elapses, or the lifecycle has been stopped -- whichever comes first.
    pub async fn wait_until_running(&self, deadline: Duration) -> Result<(), Error> {
        let fut = async {
            loop {
                {
                    let inner = self.inner.lock().await;
                    match inner.state {
                        State::Running => return Ok(()),
                        State::Stopping | State::Stopped => {
                            return Err(Error::failed_precondition(
                                "lifecycle was stopped before it started running",
                            ));
                        }
                        _ => {}
                    }
                }
                self.notify.notified().await;
            }
        };
        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::new(
                Kind::FailedPrecondition,
                "deadline exceeded waiting for lifecycle to start running",
            )),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.state == State::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn start_runs_exactly_once_under_concurrency() {
        let lifecycle = Lifecycle::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lifecycle = lifecycle.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                lifecycle
                    .start(|| async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn stop_before_start_completes_waits() {
        let lifecycle = Lifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        let l1 = lifecycle.clone();
        let starter = tokio::spawn(async move {
            l1.start(|| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                o1.lock().await.push("started");
                Ok(())
            })
            .await
            .unwrap();
        });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let o2 = order.clone();
        let l2 = lifecycle.clone();
        let stopper = tokio::spawn(async move {
            l2.stop(|| async move {
                o2.lock().await.push("stopped");
                Ok(())
            })
            .await
            .unwrap();
        });

        starter.await.unwrap();
        stopper.await.unwrap();
        assert_eq!(*order.lock().await, vec!["started", "stopped"]);
        assert!(!lifecycle.is_running().await);
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let lifecycle = Lifecycle::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        lifecycle
            .stop(|| async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn wait_until_running_times_out() {
        let lifecycle = Lifecycle::new();
        let err = lifecycle
            .wait_until_running(Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::FailedPrecondition);
    }
}
