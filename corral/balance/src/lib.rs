#![deny(rust_2018_idioms)]

//! Peer choosers: strategies for picking which retained peer should carry
//! the next outbound call.
//!
//! All three choosers (`round_robin`, `single`, `sharded`) implement
//! [`Chooser`] and are themselves [`corral2_peer::Subscriber`]s of the
//! peers they retain, so a peer's status transition is delivered straight
//! back into the chooser that retained it.

mod ring;
mod round_robin;
mod sharded;
mod single;

pub use round_robin::RoundRobin;
pub use sharded::{BlockPolicy, ShardProbe, Sharded};
pub use single::Single;

use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_peer::{Peer, PeerId, Status};
use corral2_request::Request;
use std::ops::Deref;
use std::sync::Arc;

/// Folds a batch of per-peer `update` failures into a single classified
/// error, joined so callers may inspect individual components. The
/// aggregate keeps the first failure's kind so a caller inspecting only
/// `.kind()` still sees a sensible classification.
pub(crate) fn aggregate_to_error(errs: Vec<Error>) -> Error {
    let kind = errs.first().map(|e| e.kind()).unwrap_or(corral2_error::Kind::Internal);
    let agg = corral2_error::Aggregate(errs);
    Error::with_cause(kind, agg.to_string(), agg)
}

/// A peer to add to a chooser's managed set, with the status it should
/// start in.
#[derive(Clone, Debug)]
pub struct PeerSpec {
    pub id: PeerId,
    pub initial_status: Status,
}

impl PeerSpec {
    pub fn new(id: impl Into<PeerId>, initial_status: Status) -> Self {
        Self {
            id: id.into(),
            initial_status,
        }
    }
}

/// A peer handed out by [`Chooser::choose`]. Dropping it calls the peer's
/// `endRequest` exactly once -- the RAII equivalent of invoking an
/// `onFinish` callback on every return path.
pub struct Lease {
    peer: Arc<Peer>,
}

impl Lease {
    fn new(peer: Arc<Peer>) -> Self {
        peer.start_request();
        Self { peer }
    }
}

impl Deref for Lease {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.peer.end_request();
    }
}

/// A strategy for selecting one retained peer per outbound call.
#[async_trait]
pub trait Chooser: Send + Sync {
    /// Adds and removes peers from this chooser's managed set. Individual
    /// failures (e.g. removing a peer that was never added) do not abort
    /// the whole call; every failure is collected into the returned
    /// aggregate error.
    async fn update(&self, additions: Vec<PeerSpec>, removals: Vec<PeerId>) -> Result<(), Error>;

    async fn choose(&self, ctx: &Ctx, req: &Request) -> Result<Lease, Error>;
}
