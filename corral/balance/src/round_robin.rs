//! Round-robin chooser.

use crate::ring::Ring;
use crate::{Chooser, Lease, PeerSpec};
use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_peer::{Peer, PeerId, PeerSet, Status, Subscriber, SubscriberId};
use corral2_request::Request;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::debug;

struct State {
    available: Ring<Arc<Peer>>,
    unavailable: Ring<Arc<Peer>>,
}

/// Retains a set of peers and hands them out in cyclic insertion order,
/// skipping any peer not currently `Available`.
pub struct RoundRobin {
    peer_set: Arc<PeerSet>,
    subscriber_id: SubscriberId,
    self_weak: Mutex<Weak<RoundRobin>>,
    lifecycle: Lifecycle,
    state: Mutex<State>,
    peer_available: Notify,
}

impl RoundRobin {
    pub fn new(peer_set: Arc<PeerSet>) -> Arc<Self> {
        let subscriber_id = peer_set.next_subscriber_id();
        let this = Arc::new(Self {
            peer_set,
            subscriber_id,
            self_weak: Mutex::new(Weak::new()),
            lifecycle: Lifecycle::new(),
            state: Mutex::new(State {
                available: Ring::new(),
                unavailable: Ring::new(),
            }),
            peer_available: Notify::new(),
        });
        *this.self_weak.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    pub async fn start(&self) {
        let _ = self.lifecycle.start(|| async { Ok(()) }).await;
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let ids: Vec<PeerId> = {
            let state = self.state.lock().unwrap();
            state
                .available
                .peer_ids()
                .chain(state.unavailable.peer_ids())
                .collect()
        };
        self.update(vec![], ids).await?;
        let _ = self.lifecycle.stop(|| async { Ok(()) }).await;
        Ok(())
    }

    fn weak_subscriber(&self) -> Weak<dyn Subscriber> {
        self.self_weak.lock().unwrap().clone()
    }
}

#[async_trait]
impl Chooser for RoundRobin {
    async fn update(&self, additions: Vec<PeerSpec>, removals: Vec<PeerId>) -> Result<(), Error> {
        let mut errs = Vec::new();

        for id in removals {
            let removed = {
                let mut state = self.state.lock().unwrap();
                state
                    .available
                    .remove(&id)
                    .or_else(|| state.unavailable.remove(&id))
            };
            if removed.is_none() {
                errs.push(Error::not_found(format!("peer {} is not in this chooser", id)));
                continue;
            }
            if let Err(e) = self
                .peer_set
                .release_peer(&id, self.subscriber_id, |_| async {})
                .await
            {
                errs.push(e);
            }
        }

        for spec in additions {
            let peer = self
                .peer_set
                .retain_peer(&spec.id, self.subscriber_id, self.weak_subscriber(), spec.initial_status)
                .await;
            let mut state = self.state.lock().unwrap();
            match spec.initial_status {
                Status::Available => {
                    state.available.insert(spec.id.clone(), peer);
                    drop(state);
                    self.peer_available.notify_one();
                }
                _ => state.unavailable.insert(spec.id.clone(), peer),
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(crate::aggregate_to_error(errs))
        }
    }

    async fn choose(&self, ctx: &Ctx, _req: &Request) -> Result<Lease, Error> {
        if !self.lifecycle.is_running().await {
            return Err(Error::failed_precondition("chooser is not running"));
        }
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if let Some((_, peer)) = state.available.next() {
                    let peer = peer.clone();
                    drop(state);
                    // best-effort nudge: lets another waiter re-check now too.
                    self.peer_available.notify_one();
                    return Ok(Lease::new(peer));
                }
            }

            if !ctx.has_deadline() {
                return Err(Error::failed_precondition(
                    "ctx has no deadline and no peer is available",
                ));
            }
            tokio::select! {
                _ = self.peer_available.notified() => continue,
                _ = ctx.done() => return Err(Error::unavailable("no peer became available before ctx deadline")),
            }
        }
    }
}

#[async_trait]
impl Subscriber for RoundRobin {
    async fn notify_status_changed(&self, id: &PeerId) {
        let peer = {
            let state = self.state.lock().unwrap();
            state.available.get(id).or_else(|| state.unavailable.get(id)).cloned()
        };
        let Some(peer) = peer else {
            return;
        };
        let snapshot = peer.status().await;
        let mut state = self.state.lock().unwrap();
        match snapshot.status {
            Status::Available => {
                if let Some(p) = state.unavailable.remove(id) {
                    state.available.insert(id.clone(), p);
                    drop(state);
                    self.peer_available.notify_one();
                    debug!(peer = %id, "peer became available");
                }
            }
            Status::Connecting | Status::Unavailable => {
                if let Some(p) = state.available.remove(id) {
                    state.unavailable.insert(id.clone(), p);
                    debug!(peer = %id, "peer became unavailable");
                }
            }
        }
    }
}
