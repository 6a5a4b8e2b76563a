#![deny(rust_2018_idioms)]

//! The peer entity: connection status, pending-request counters, and the
//! subscriber fanout a transport uses to tell its choosers "this peer just
//! became available/unavailable".
//!
//! [`PeerSet`] is the transport-owned registry behind `retainPeer`/
//! `releasePeer`: peers are reference-counted *per subscriber*, so two
//! choosers retaining the same peer id track independent counts (see
//! `DESIGN.md` for why this crate resolves it that way).

mod set;

pub use set::{PeerSet, SubscriberId};

use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

pub type PeerId = String;

/// A peer's connection status.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Available,
    Connecting,
    Unavailable,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Snapshot {
    pub status: Status,
    pub pending_request_count: usize,
}

/// Any party holding a reference to a peer and wanting to hear about status
/// transitions -- typically a chooser.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn notify_status_changed(&self, id: &PeerId);
}

/// A process-addressable endpoint owned by one transport.
pub struct Peer {
    id: PeerId,
    status: Mutex<Status>,
    pending: AtomicUsize,
    subscribers: Mutex<IndexMap<SubscriberId, Weak<dyn Subscriber>>>,
}

impl Peer {
    fn new(id: PeerId, status: Status) -> Arc<Self> {
        Arc::new(Self {
            id,
            status: Mutex::new(status),
            pending: AtomicUsize::new(0),
            subscribers: Mutex::new(IndexMap::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Snapshot {
        Snapshot {
            status: *self.status.lock().await,
            pending_request_count: self.pending.load(Ordering::SeqCst),
        }
    }

    /// Atomically increments the pending-request counter. Choosers call
    /// this when they hand a peer out for a request.
    pub fn start_request(&self) -> usize {
        self.pending.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Atomically decrements the pending-request counter.
    pub fn end_request(&self) -> usize {
        self.pending.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Updates this peer's status. If it actually changed, notifies every
    /// subscriber *outside* the status lock.
    pub async fn set_status(&self, new_status: Status) {
        let changed = {
            let mut status = self.status.lock().await;
            if *status == new_status {
                false
            } else {
                *status = new_status;
                true
            }
        };
        if !changed {
            return;
        }

        let live: Vec<Arc<dyn Subscriber>> = {
            let subs = self.subscribers.lock().await;
            subs.values().filter_map(Weak::upgrade).collect()
        };
        let id = self.id.clone();
        futures::future::join_all(live.iter().map(|s| {
            let id = id.clone();
            async move { s.notify_status_changed(&id).await }
        }))
        .await;
    }

    async fn add_subscriber(&self, id: SubscriberId, subscriber: Weak<dyn Subscriber>) {
        self.subscribers.lock().await.insert(id, subscriber);
    }

    async fn remove_subscriber(&self, id: SubscriberId) {
        self.subscribers.lock().await.shift_remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct Recorder(Arc<StdMutex<Vec<(PeerId, Status)>>>, Status);

    #[async_trait]
    impl Subscriber for Recorder {
        async fn notify_status_changed(&self, id: &PeerId) {
            self.0.lock().unwrap().push((id.clone(), self.1));
        }
    }

    #[tokio::test]
    async fn notifies_subscribers_only_on_change() {
        let peer = Peer::new("p1".into(), Status::Connecting);
        let events = Arc::new(StdMutex::new(Vec::new()));
        let sub: Arc<dyn Subscriber> = Arc::new(Recorder(events.clone(), Status::Available));
        peer.add_subscriber(1, Arc::downgrade(&sub)).await;

        peer.set_status(Status::Connecting).await; // no-op, same status
        assert!(events.lock().unwrap().is_empty());

        peer.set_status(Status::Available).await;
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn pending_request_counters_are_atomic() {
        let peer = Peer::new("p1".into(), Status::Available);
        assert_eq!(peer.start_request(), 1);
        assert_eq!(peer.start_request(), 2);
        assert_eq!(peer.end_request(), 1);
        assert_eq!(peer.status().await.pending_request_count, 1);
    }
}
