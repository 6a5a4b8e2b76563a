//! Sharded chooser: a map `shardKey -> inner round-robin`, populated by
//! periodically probing each retained peer for the shard set it currently
//! advertises.

use crate::round_robin::RoundRobin;
use crate::{Chooser, Lease, PeerSpec};
use async_trait::async_trait;
use corral2_cache::Cache;
use corral2_clock::RealClock;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_peer::{PeerId, PeerSet, Status, Subscriber, SubscriberId};
use corral2_request::Request;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Shard inner-choosers are never explicitly removed (a shard losing its
/// last peer just means its round-robin is temporarily empty), so the
/// cache is sized large enough that capacity is never the reason a shard
/// fails to register; eviction is driven purely by idle age.
const SHARD_CACHE_CAPACITY: usize = 1 << 20;

/// The peer-side protocol the sharded chooser polls: a health check and a
/// shard-info query, run together on the same cadence, one background
/// probe loop per retained peer.
#[async_trait]
pub trait ShardProbe: Send + Sync {
    async fn healthy(&self, id: &PeerId) -> bool;
    async fn shards(&self, id: &PeerId) -> Result<Vec<String>, Error>;
}

/// What `choose` does when a request names a shard key with no peer
/// advertising it yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockPolicy {
    /// Wait (respecting the call's ctx deadline) for a peer to advertise
    /// the shard.
    BlockForPeer,
    /// Fail immediately with `Unavailable`.
    NoBlock,
}

pub struct Sharded<P> {
    peer_set: Arc<PeerSet>,
    subscriber_id: SubscriberId,
    self_weak: Mutex<Weak<Sharded<P>>>,
    lifecycle: Lifecycle,
    probe: Arc<P>,
    poll_interval: Duration,
    policy: BlockPolicy,
    /// One inner round-robin per shard key, idle-evicted: a shard that
    /// stops being chosen against for `shard_idle_age` is dropped along
    /// with its (by then almost certainly empty) round-robin.
    inner: Cache<String, Arc<RoundRobin>, RealClock>,
    purge_handle: Mutex<Option<JoinHandle<()>>>,
    shard_waiters: Mutex<HashMap<String, Arc<Notify>>>,
    peer_tasks: Mutex<HashMap<PeerId, JoinHandle<()>>>,
    peer_shards: Mutex<HashMap<PeerId, HashSet<String>>>,
    /// A shared dummy subscriber used for every peer this chooser retains.
    /// Shard membership is driven by reprobing, not by peer status
    /// notifications, so retains only need *some* subscriber to own the
    /// reference count against -- this one never does anything with a
    /// notification. Held for this chooser's whole lifetime so the weak
    /// references `PeerSet` stores for it stay valid.
    null_subscriber: Arc<dyn Subscriber>,
}

impl<P: ShardProbe + 'static> Sharded<P> {
    pub fn new(peer_set: Arc<PeerSet>, probe: P, poll_interval: Duration, policy: BlockPolicy) -> Arc<Self> {
        Self::with_shard_idle_age(peer_set, probe, poll_interval, policy, Duration::from_secs(600))
    }

    /// As [`Sharded::new`], but with an explicit idle age after which a
    /// shard's inner round-robin is evicted from the cache if nothing has
    /// chosen against it.
    pub fn with_shard_idle_age(
        peer_set: Arc<PeerSet>,
        probe: P,
        poll_interval: Duration,
        policy: BlockPolicy,
        shard_idle_age: Duration,
    ) -> Arc<Self> {
        let this = Arc::new(Self {
            subscriber_id: peer_set.next_subscriber_id(),
            peer_set,
            self_weak: Mutex::new(Weak::new()),
            lifecycle: Lifecycle::new(),
            probe: Arc::new(probe),
            poll_interval,
            policy,
            inner: Cache::new(SHARD_CACHE_CAPACITY, shard_idle_age, RealClock),
            purge_handle: Mutex::new(None),
            shard_waiters: Mutex::new(HashMap::new()),
            peer_tasks: Mutex::new(HashMap::new()),
            peer_shards: Mutex::new(HashMap::new()),
            null_subscriber: Arc::new(NullSubscriber),
        });
        *this.self_weak.lock().unwrap() = Arc::downgrade(&this);
        this
    }

    pub async fn start(&self) {
        *self.purge_handle.lock().unwrap() = Some(self.inner.spawn_purge());
        let _ = self.lifecycle.start(|| async { Ok(()) }).await;
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let ids: Vec<PeerId> = self.peer_shards.lock().unwrap().keys().cloned().collect();
        self.update(vec![], ids).await?;
        for inner in self.inner.values().await {
            let _ = inner.stop().await;
        }
        if let Some(handle) = self.purge_handle.lock().unwrap().take() {
            handle.abort();
        }
        let _ = self.lifecycle.stop(|| async { Ok(()) }).await;
        Ok(())
    }

    fn weak_self(&self) -> Arc<Sharded<P>> {
        self.self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("Sharded always outlives its own background tasks via this Arc")
    }

    fn waiter_for(&self, shard: &str) -> Arc<Notify> {
        self.shard_waiters
            .lock()
            .unwrap()
            .entry(shard.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    async fn inner_for(&self, shard: &str) -> Arc<RoundRobin> {
        let peer_set = self.peer_set.clone();
        self.inner
            .get_or_insert_with(shard.to_string(), || async move {
                let rr = RoundRobin::new(peer_set);
                rr.start().await;
                rr
            })
            .await
            .expect("shard cache capacity is effectively unbounded")
    }

    /// Probes `id` once, diffs the shard set against what was last
    /// observed, and reflects the delta into each affected inner
    /// round-robin.
    async fn reprobe(&self, id: &PeerId) {
        let healthy = self.probe.healthy(id).await;
        let shards = match self.probe.shards(id).await {
            Ok(s) => s,
            Err(error) => {
                warn!(peer = %id, %error, "shard-info probe failed");
                return;
            }
        };
        let new_set: HashSet<String> = shards.into_iter().collect();
        let status = if healthy { Status::Available } else { Status::Unavailable };

        let old_set = self
            .peer_shards
            .lock()
            .unwrap()
            .insert(id.clone(), new_set.clone())
            .unwrap_or_default();

        for shard in new_set.difference(&old_set) {
            let inner = self.inner_for(shard).await;
            if inner
                .update(vec![PeerSpec::new(id.clone(), status)], vec![])
                .await
                .is_ok()
            {
                debug!(peer = %id, shard, "peer now advertises shard");
                self.waiter_for(shard).notify_waiters();
            }
        }
        for shard in old_set.difference(&new_set) {
            let inner = self.inner_for(shard).await;
            let _ = inner.update(vec![], vec![id.clone()]).await;
            debug!(peer = %id, shard, "peer no longer advertises shard");
        }
    }
}

struct NullSubscriber;
#[async_trait]
impl Subscriber for NullSubscriber {
    async fn notify_status_changed(&self, _id: &PeerId) {}
}

#[async_trait]
impl<P: ShardProbe + 'static> Chooser for Sharded<P> {
    async fn update(&self, additions: Vec<PeerSpec>, removals: Vec<PeerId>) -> Result<(), Error> {
        let mut errs = Vec::new();

        for id in removals {
            if let Some(handle) = self.peer_tasks.lock().unwrap().remove(&id) {
                handle.abort();
            }
            let shards = self.peer_shards.lock().unwrap().remove(&id).unwrap_or_default();
            for shard in shards {
                if let Some(inner) = self.inner.get(&shard).await {
                    let _ = inner.update(vec![], vec![id.clone()]).await;
                }
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
            self.peer_set
                .retain_peer(
                    &spec.id,
                    self.subscriber_id,
                    Arc::downgrade(&self.null_subscriber),
                    spec.initial_status,
                )
                .await;

            self.reprobe(&spec.id).await;

            let this = self.weak_self();
            let id = spec.id.clone();
            let interval = self.poll_interval;
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    this.reprobe(&id).await;
                }
            });
            self.peer_tasks.lock().unwrap().insert(spec.id, handle);
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(crate::aggregate_to_error(errs))
        }
    }

    async fn choose(&self, ctx: &Ctx, req: &Request) -> Result<Lease, Error> {
        if !self.lifecycle.is_running().await {
            return Err(Error::failed_precondition("chooser is not running"));
        }
        let shard = req
            .shard_key
            .as_deref()
            .ok_or_else(|| Error::bad_request("request has no shard key"))?;

        loop {
            let inner = self.inner.get(&shard.to_string()).await;
            if let Some(inner) = inner {
                return inner.choose(ctx, req).await;
            }

            match self.policy {
                BlockPolicy::NoBlock => {
                    return Err(Error::unavailable(format!("no peer advertises shard {}", shard)));
                }
                BlockPolicy::BlockForPeer => {
                    if !ctx.has_deadline() {
                        return Err(Error::failed_precondition(
                            "ctx has no deadline and no peer advertises the requested shard",
                        ));
                    }
                    let waiter = self.waiter_for(shard);
                    tokio::select! {
                        _ = waiter.notified() => continue,
                        _ = ctx.done() => {
                            return Err(Error::unavailable(format!(
                                "no peer advertised shard {} before ctx deadline",
                                shard
                            )));
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl<P: ShardProbe + 'static> Subscriber for Sharded<P> {
    /// The per-peer probe loop (not peer status) drives shard membership;
    /// this chooser never registers itself as a peer's subscriber.
    async fn notify_status_changed(&self, _id: &PeerId) {}
}
