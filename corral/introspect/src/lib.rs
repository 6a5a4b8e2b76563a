#![deny(rust_2018_idioms)]

//! The introspection surface: every configured inbound and outbound
//! publishes a small `{transport, endpoint, state}` entry, and the
//! dispatcher aggregates whatever is currently registered into a read-only
//! snapshot an operator can poll.
//!
//! This crate only names the shape and the aggregation; it does not expose
//! it over any particular wire (an HTTP `/status` handler, a CLI command)
//! -- that belongs to whatever inbound a caller wires up.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One reported entry: which transport it is, what endpoint it names (a
/// bound address for an inbound, a logical service name for an outbound),
/// and a free-form state string (`"listening on 0.0.0.0:4040"`,
/// `"running"`, `"stopped"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub transport: String,
    pub endpoint: String,
    pub state: String,
}

impl Entry {
    pub fn new(transport: impl Into<String>, endpoint: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            transport: transport.into(),
            endpoint: endpoint.into(),
            state: state.into(),
        }
    }
}

/// Anything that can describe its own current status on demand. Inbounds
/// and outbounds implement this (directly, or via a small adapter) and
/// register themselves with a [`Registry`] at construction time.
#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self) -> Entry;
}

/// A read-only status snapshot, one list per direction: every configured
/// inbound and outbound publishes into its own side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub inbounds: Vec<Entry>,
    pub outbounds: Vec<Entry>,
}

/// Aggregates every registered inbound/outbound reporter into a
/// [`Snapshot`] on demand. Cheap to clone; every clone shares the same
/// underlying registration lists.
#[derive(Clone, Default)]
pub struct Registry {
    inbounds: Arc<Mutex<Vec<Arc<dyn Reporter>>>>,
    outbounds: Arc<Mutex<Vec<Arc<dyn Reporter>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_inbound(&self, reporter: Arc<dyn Reporter>) {
        self.inbounds.lock().await.push(reporter);
    }

    pub async fn register_outbound(&self, reporter: Arc<dyn Reporter>) {
        self.outbounds.lock().await.push(reporter);
    }

    /// Polls every registered reporter and returns the current snapshot.
    /// Reporters are polled concurrently; their relative order in the
    /// result matches registration order.
    pub async fn snapshot(&self) -> Snapshot {
        let inbounds = {
            let reporters = self.inbounds.lock().await.clone();
            report_all(reporters).await
        };
        let outbounds = {
            let reporters = self.outbounds.lock().await.clone();
            report_all(reporters).await
        };
        Snapshot { inbounds, outbounds }
    }
}

async fn report_all(reporters: Vec<Arc<dyn Reporter>>) -> Vec<Entry> {
    futures::future::join_all(reporters.iter().map(|r| r.report())).await
}

/// Wraps a fixed, precomputed [`Entry`] as a [`Reporter`] -- useful for
/// static endpoints (a `Single` chooser's outbound, say) whose state never
/// changes after construction.
pub struct StaticReporter(Entry);

impl StaticReporter {
    pub fn new(entry: Entry) -> Self {
        Self(entry)
    }
}

#[async_trait]
impl Reporter for StaticReporter {
    async fn report(&self) -> Entry {
        self.0.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingReporter {
        transport: &'static str,
        polls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Reporter for CountingReporter {
        async fn report(&self) -> Entry {
            self.polls.fetch_add(1, Ordering::SeqCst);
            Entry::new(self.transport, "127.0.0.1:0", "running")
        }
    }

    #[tokio::test]
    async fn snapshot_is_empty_with_nothing_registered() {
        let registry = Registry::new();
        let snapshot = registry.snapshot().await;
        assert!(snapshot.inbounds.is_empty());
        assert!(snapshot.outbounds.is_empty());
    }

    #[tokio::test]
    async fn snapshot_groups_inbounds_and_outbounds_separately() {
        let registry = Registry::new();
        let polls = Arc::new(AtomicUsize::new(0));
        registry
            .register_inbound(Arc::new(CountingReporter {
                transport: "http",
                polls: polls.clone(),
            }))
            .await;
        registry
            .register_outbound(Arc::new(CountingReporter {
                transport: "tchannel",
                polls: polls.clone(),
            }))
            .await;

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.inbounds, vec![Entry::new("http", "127.0.0.1:0", "running")]);
        assert_eq!(snapshot.outbounds, vec![Entry::new("tchannel", "127.0.0.1:0", "running")]);
        assert_eq!(polls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn static_reporter_always_reports_the_same_entry() {
        let reporter = StaticReporter::new(Entry::new("queue", "jobs", "connected"));
        assert_eq!(reporter.report().await, Entry::new("queue", "jobs", "connected"));
        assert_eq!(reporter.report().await, Entry::new("queue", "jobs", "connected"));
    }

    #[tokio::test]
    async fn registration_order_is_preserved_in_snapshot() {
        let registry = Registry::new();
        for i in 0..3 {
            registry
                .register_inbound(Arc::new(StaticReporter::new(Entry::new(
                    "http",
                    format!("127.0.0.1:{}", 4000 + i),
                    "running",
                ))))
                .await;
        }
        let snapshot = registry.snapshot().await;
        let endpoints: Vec<_> = snapshot.inbounds.iter().map(|e| e.endpoint.clone()).collect();
        assert_eq!(endpoints, vec!["127.0.0.1:4000", "127.0.0.1:4001", "127.0.0.1:4002"]);
    }
}
