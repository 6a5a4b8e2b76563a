//! Small wrappers making each transport crate's concrete inbound/outbound
//! type satisfy [`crate::ManagedComponent`] and
//! [`corral2_introspect::Reporter`] without either of those crates needing
//! to depend on the other.

use crate::ManagedComponent;
use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_http::{ConnHandler, Inbound};
use corral2_introspect::{Entry, Reporter};
use corral2_outbound::{Outbound, Transport};
use corral2_queue::{Backend, QueueInbound, QueueOutbound};
use std::net::SocketAddr;
use std::sync::Arc;

/// Flattens the `Arc<Error>` [`corral2_lifecycle::Lifecycle`] hands back
/// into a plain `Error`, the same pattern every transport crate already
/// duplicates at its own public boundary.
fn flatten(err: Arc<Error>) -> Error {
    Error::new(err.kind(), err.message().to_string())
}

/// Wraps a [`corral2_http::Inbound`] bound to a fixed address.
pub struct HttpInboundHandle<H> {
    inbound: Arc<Inbound<H>>,
    addr: SocketAddr,
}

impl<H: ConnHandler + 'static> HttpInboundHandle<H> {
    pub fn new(inbound: Arc<Inbound<H>>, addr: SocketAddr) -> Self {
        Self { inbound, addr }
    }
}

#[async_trait]
impl<H: ConnHandler + 'static> ManagedComponent for HttpInboundHandle<H> {
    async fn start(&self) -> Result<(), Error> {
        self.inbound.listen_and_serve(self.addr).await
    }

    async fn stop(&self, ctx: &Ctx) -> Result<(), Error> {
        self.inbound.shutdown(ctx).await
    }
}

#[async_trait]
impl<H: ConnHandler + 'static> Reporter for HttpInboundHandle<H> {
    async fn report(&self) -> Entry {
        let state = match self.inbound.listener().await {
            Some(addr) => format!("listening on {}", addr),
            None => "stopped".to_string(),
        };
        Entry::new("http", self.addr.to_string(), state)
    }
}

/// Wraps a [`corral2_queue::QueueInbound`] poll loop.
pub struct QueueInboundHandle<B, C> {
    inbound: Arc<QueueInbound<B, C>>,
}

impl<B: Backend + 'static, C: corral2_clock::Clock> QueueInboundHandle<B, C> {
    pub fn new(inbound: Arc<QueueInbound<B, C>>) -> Self {
        Self { inbound }
    }
}

#[async_trait]
impl<B: Backend + 'static, C: corral2_clock::Clock> ManagedComponent for QueueInboundHandle<B, C> {
    async fn start(&self) -> Result<(), Error> {
        self.inbound.start().await
    }

    async fn stop(&self, ctx: &Ctx) -> Result<(), Error> {
        self.inbound.stop(ctx).await
    }
}

#[async_trait]
impl<B: Backend + 'static, C: corral2_clock::Clock> Reporter for QueueInboundHandle<B, C> {
    async fn report(&self) -> Entry {
        let state = if self.inbound.is_running().await { "running" } else { "stopped" };
        Entry::new("queue", self.inbound.queue_key(), state)
    }
}

/// Wraps a [`corral2_outbound::Outbound`] call chain under the logical
/// service name it carries calls for -- `Outbound` itself is keyed by
/// peer, not by service, so the label comes from whoever attaches it.
pub struct OutboundHandle<C = corral2_clock::RealClock> {
    outbound: Arc<Outbound<C>>,
    label: String,
}

impl<C: corral2_clock::Clock> OutboundHandle<C> {
    pub fn new(outbound: Arc<Outbound<C>>, label: impl Into<String>) -> Self {
        Self {
            outbound,
            label: label.into(),
        }
    }
}

#[async_trait]
impl<C: corral2_clock::Clock> ManagedComponent for OutboundHandle<C> {
    async fn start(&self) -> Result<(), Error> {
        self.outbound.start().await.map_err(flatten)
    }

    async fn stop(&self, _ctx: &Ctx) -> Result<(), Error> {
        self.outbound.stop().await.map_err(flatten)
    }
}

#[async_trait]
impl<C: corral2_clock::Clock> Reporter for OutboundHandle<C> {
    async fn report(&self) -> Entry {
        let state = if self.outbound.is_running().await { "running" } else { "stopped" };
        Entry::new(self.outbound.transport_name(), &self.label, state)
    }
}

/// Wraps a [`corral2_queue::QueueOutbound`] -- oneway-only, so `stop`
/// ignores `ctx` just as the underlying type's own `stop()` takes none.
pub struct QueueOutboundHandle<B, C = corral2_clock::RealClock> {
    outbound: Arc<QueueOutbound<B, C>>,
}

impl<B: Backend + 'static, C: corral2_clock::Clock> QueueOutboundHandle<B, C> {
    pub fn new(outbound: Arc<QueueOutbound<B, C>>) -> Self {
        Self { outbound }
    }
}

#[async_trait]
impl<B: Backend + 'static, C: corral2_clock::Clock> ManagedComponent for QueueOutboundHandle<B, C> {
    async fn start(&self) -> Result<(), Error> {
        self.outbound.start().await
    }

    async fn stop(&self, _ctx: &Ctx) -> Result<(), Error> {
        self.outbound.stop().await
    }
}

#[async_trait]
impl<B: Backend + 'static, C: corral2_clock::Clock> Reporter for QueueOutboundHandle<B, C> {
    async fn report(&self) -> Entry {
        let state = if self.outbound.is_running().await { "running" } else { "stopped" };
        Entry::new("queue", self.outbound.queue_key(), state)
    }
}
