use crate::{Peer, Status, Subscriber};
use corral2_error::Error;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::debug;

/// An opaque identifier a subscriber (typically a chooser) uses to
/// distinguish itself across `retain`/`release` calls against the same
/// peer set. [`PeerSet::next_subscriber_id`] hands these out.
pub type SubscriberId = u64;

struct Entry {
    peer: Arc<Peer>,
    /// Per-subscriber reference counts. A given subscriber may retain the
    /// same peer more than once (e.g. it appears in more than one inner
    /// chooser); its count must reach zero before it stops receiving
    /// notifications.
    refcounts: HashMap<SubscriberId, usize>,
}

/// The reference-counted peer registry a transport owns. Identical ids
/// retained twice return the same [`Peer`]; the peer is torn down (its
/// on-destroy callback invoked) once every subscriber has released every
/// reference they held.
pub struct PeerSet {
    entries: Mutex<HashMap<String, Entry>>,
    /// Ids that were retained at least once and have since been fully torn
    /// down. Releasing against one of these is a no-op rather than
    /// `NotFound`.
    torn_down: Mutex<HashSet<String>>,
    next_subscriber_id: AtomicU64,
}

impl Default for PeerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSet {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            torn_down: Mutex::new(HashSet::new()),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Mints a subscriber id for a new chooser to use across this set's
    /// lifetime.
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.next_subscriber_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Retains the peer identified by `id` on behalf of `subscriber_id`,
    /// creating it with `initial_status` if this is the first retain for
    /// that id. Returns the shared [`Peer`].
    pub async fn retain_peer(
        &self,
        id: &str,
        subscriber_id: SubscriberId,
        subscriber: Weak<dyn Subscriber>,
        initial_status: Status,
    ) -> Arc<Peer> {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(id.to_string()).or_insert_with(|| Entry {
            peer: Peer::new(id.to_string(), initial_status),
            refcounts: HashMap::new(),
        });

        let count = entry.refcounts.entry(subscriber_id).or_insert(0);
        if *count == 0 {
            entry.peer.add_subscriber(subscriber_id, subscriber).await;
        }
        *count += 1;
        entry.peer.clone()
    }

    /// Releases one reference `subscriber_id` held on peer `id`. Once that
    /// subscriber's count reaches zero it stops receiving notifications;
    /// once *every* subscriber's count reaches zero the peer is removed
    /// from the set and `on_destroy` is invoked so the transport can tear
    /// down its connections.
    pub async fn release_peer<F, Fut>(
        &self,
        id: &str,
        subscriber_id: SubscriberId,
        on_destroy: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(Arc<Peer>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let (destroy, peer) = {
            let mut entries = self.entries.lock().await;
            let entry = match entries.get_mut(id) {
                Some(entry) => entry,
                None => {
                    if self.torn_down.lock().await.contains(id) {
                        return Ok(());
                    }
                    return Err(Error::not_found(format!("peer {} is not retained", id)));
                }
            };

            let count = entry
                .refcounts
                .get_mut(&subscriber_id)
                .ok_or_else(|| Error::not_found(format!("subscriber did not retain peer {}", id)))?;
            if *count == 0 {
                return Err(Error::not_found(format!("subscriber did not retain peer {}", id)));
            }
            *count -= 1;
            let subscriber_done = *count == 0;
            if subscriber_done {
                entry.refcounts.remove(&subscriber_id);
            }

            if subscriber_done && entry.refcounts.is_empty() {
                let removed = entries.remove(id).expect("entry exists");
                (true, Some(removed.peer))
            } else {
                if subscriber_done {
                    entry.peer.remove_subscriber(subscriber_id).await;
                }
                (false, None)
            }
        };

        if destroy {
            let peer = peer.expect("destroy implies peer");
            self.torn_down.lock().await.insert(peer.id().to_string());
            debug!(peer = %peer.id(), "last reference released, tearing down");
            on_destroy(peer).await;
        }
        Ok(())
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.entries.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering as AOrdering};

    struct NullSub;
    #[async_trait]
    impl Subscriber for NullSub {
        async fn notify_status_changed(&self, _: &crate::PeerId) {}
    }

    #[tokio::test]
    async fn identical_id_retained_twice_returns_same_peer() {
        let set = PeerSet::new();
        let sub: Arc<dyn Subscriber> = Arc::new(NullSub);
        let sid = set.next_subscriber_id();

        let p1 = set
            .retain_peer("p1", sid, Arc::downgrade(&sub), Status::Available)
            .await;
        let p2 = set
            .retain_peer("p1", sid, Arc::downgrade(&sub), Status::Available)
            .await;
        assert!(Arc::ptr_eq(&p1, &p2));
    }

    #[tokio::test]
    async fn teardown_happens_once_last_reference_released() {
        let set = PeerSet::new();
        let sub: Arc<dyn Subscriber> = Arc::new(NullSub);
        let sid = set.next_subscriber_id();

        set.retain_peer("p1", sid, Arc::downgrade(&sub), Status::Available).await;
        set.retain_peer("p1", sid, Arc::downgrade(&sub), Status::Available).await;
        assert!(set.contains("p1").await);

        let torn_down = Arc::new(AtomicUsize::new(0));
        let t1 = torn_down.clone();
        set.release_peer("p1", sid, |_| async move {
            t1.fetch_add(1, AOrdering::SeqCst);
        })
        .await
        .unwrap();
        assert!(set.contains("p1").await, "one reference remains");
        assert_eq!(torn_down.load(AOrdering::SeqCst), 0);

        let t2 = torn_down.clone();
        set.release_peer("p1", sid, |_| async move {
            t2.fetch_add(1, AOrdering::SeqCst);
        })
        .await
        .unwrap();
        assert!(!set.contains("p1").await);
        assert_eq!(torn_down.load(AOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn releasing_untracked_pair_is_not_found() {
        let set = PeerSet::new();
        let err = set.release_peer("ghost", 1, |_| async {}).await.unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::NotFound);
    }

    #[tokio::test]
    async fn releasing_after_teardown_is_a_no_op() {
        let set = PeerSet::new();
        let sub: Arc<dyn Subscriber> = Arc::new(NullSub);
        let sid = set.next_subscriber_id();

        set.retain_peer("p1", sid, Arc::downgrade(&sub), Status::Available).await;
        set.release_peer("p1", sid, |_| async {}).await.unwrap();
        assert!(!set.contains("p1").await);

        // same subscriber releasing again, or a different one, must not error.
        set.release_peer("p1", sid, |_| async {}).await.unwrap();
        set.release_peer("p1", 999, |_| async {}).await.unwrap();
    }

    #[tokio::test]
    async fn independent_subscribers_have_independent_counts() {
        let set = PeerSet::new();
        let sub: Arc<dyn Subscriber> = Arc::new(NullSub);
        let a = set.next_subscriber_id();
        let b = set.next_subscriber_id();

        set.retain_peer("p1", a, Arc::downgrade(&sub), Status::Available).await;
        set.retain_peer("p1", b, Arc::downgrade(&sub), Status::Available).await;

        // releasing subscriber a's only reference must not affect b's.
        set.release_peer("p1", a, |_| async {}).await.unwrap();
        assert!(set.contains("p1").await);
        set.release_peer("p1", b, |_| async {}).await.unwrap();
        assert!(!set.contains("p1").await);
    }
}
