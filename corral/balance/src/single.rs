//! Single chooser: retains exactly one peer identifier at start and hands
//! it out unconditionally for every call.

use crate::{Chooser, Lease, PeerSpec};
use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_peer::{Peer, PeerId, PeerSet, Status, Subscriber, SubscriberId};
use corral2_request::Request;
use std::sync::{Arc, Mutex, Weak};

/// A chooser bound to exactly one peer for its entire lifetime -- used by
/// outbounds configured with a single, fixed address rather than a
/// dynamically-updated peer list.
pub struct Single {
    peer_set: Arc<PeerSet>,
    subscriber_id: SubscriberId,
    id: PeerId,
    self_weak: Mutex<Weak<Single>>,
    lifecycle: Lifecycle,
    peer: Mutex<Option<Arc<Peer>>>,
}

impl Single {
    pub fn new(peer_set: Arc<PeerSet>, id: impl Into<PeerId>) -> Arc<Self> {
        let subscriber_id = peer_set.next_subscriber_id();
        let this = Arc::new(Self {
            peer_set,
            subscriber_id,
            id: id.into(),
            self_weak: Mutex::new(Weak::new()),
            lifecycle: Lifecycle::new(),
            peer: Mutex::new(None),
        });
        *this.self_weak.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    /// Retains the single configured peer. Idempotent: a second call
    /// observes the same outcome as the first (`Lifecycle::start`).
    pub async fn start(&self) -> Result<(), Arc<Error>> {
        let weak: Weak<dyn Subscriber> = self.self_weak.lock().unwrap().clone();
        self.lifecycle
            .start(|| async {
                let peer = self
                    .peer_set
                    .retain_peer(&self.id, self.subscriber_id, weak, Status::Available)
                    .await;
                *self.peer.lock().unwrap() = Some(peer);
                Ok(())
            })
            .await
    }

    pub async fn stop(&self) -> Result<(), Arc<Error>> {
        self.lifecycle
            .stop(|| async {
                self.peer_set
                    .release_peer(&self.id, self.subscriber_id, |_| async {})
                    .await?;
                *self.peer.lock().unwrap() = None;
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl Chooser for Single {
    /// A single chooser's peer set is fixed at construction; `update` is
    /// accepted only as a no-op for the already-retained id so that generic
    /// callers that treat every `Chooser` uniformly don't need a special
    /// case, and rejected otherwise.
    async fn update(&self, additions: Vec<PeerSpec>, removals: Vec<PeerId>) -> Result<(), Error> {
        for spec in &additions {
            if spec.id != self.id {
                return Err(Error::failed_precondition(
                    "single chooser cannot add a peer other than its configured one",
                ));
            }
        }
        for id in &removals {
            if id != &self.id {
                return Err(Error::not_found(format!("peer {} is not in this chooser", id)));
            }
        }
        Ok(())
    }

    async fn choose(&self, _ctx: &Ctx, _req: &Request) -> Result<Lease, Error> {
        if !self.lifecycle.is_running().await {
            return Err(Error::failed_precondition("chooser is not running"));
        }
        let peer = self.peer.lock().unwrap().clone();
        match peer {
            Some(peer) => Ok(Lease::new(peer)),
            None => Err(Error::failed_precondition("single chooser has no retained peer")),
        }
    }
}

#[async_trait]
impl Subscriber for Single {
    /// The sole peer's status is observable via `Peer::status`, but a
    /// single chooser never removes or swaps it out based on status --
    /// there is nowhere else to route to.
    async fn notify_status_changed(&self, _id: &PeerId) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral2_request::Request;

    fn req() -> Request {
        Request::builder()
            .caller("c")
            .service("s")
            .procedure("p")
            .encoding("json")
            .build()
    }

    #[tokio::test]
    async fn returns_the_configured_peer_unconditionally() {
        let peer_set = Arc::new(PeerSet::new());
        let single = Single::new(peer_set, "only-peer:1234");
        single.start().await.unwrap();

        let ctx = Ctx::background();
        for _ in 0..5 {
            let lease = single.choose(&ctx, &req()).await.unwrap();
            assert_eq!(lease.id(), "only-peer:1234");
        }
    }

    #[tokio::test]
    async fn choose_fails_before_start() {
        let peer_set = Arc::new(PeerSet::new());
        let single = Single::new(peer_set, "p1");
        let err = single.choose(&Ctx::background(), &req()).await.unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::FailedPrecondition);
    }

    #[tokio::test]
    async fn stop_releases_the_peer() {
        let peer_set = Arc::new(PeerSet::new());
        let single = Single::new(peer_set.clone(), "p1");
        single.start().await.unwrap();
        assert!(peer_set.contains("p1").await);
        single.stop().await.unwrap();
        assert!(!peer_set.contains("p1").await);
    }
}
