#![deny(rust_2018_idioms)]

//! The outbound call chain: caller -> chooser -> peer -> transport
//! write/await, with tracing injected before the chooser picks a peer and
//! `onFinish` (here, [`corral2_balance::Lease`]'s `Drop`) run on every
//! return path regardless of outcome.

use async_trait::async_trait;
use corral2_balance::{Chooser, Lease};
use corral2_clock::{Clock, RealClock};
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_request::{Request, Response};
use corral2_tracing::{Span, Tracer};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::trace;

/// What a transport does with a chosen peer and an outbound request: open
/// or reuse a connection, write the framed request, and await the reply
/// (unary) or the transport's acceptance acknowledgement (oneway).
///
/// Connection pooling is the transport's own concern; this trait only
/// names the send/await boundary the outbound chain drives.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_unary(&self, ctx: &Ctx, peer: &Lease, req: Request) -> Result<Response, Error>;

    async fn send_oneway(&self, ctx: &Ctx, peer: &Lease, req: Request) -> Result<Instant, Error>;
}

/// The outbound chain for one logical downstream service: a chooser over
/// its peers, the transport that knows how to talk to them, and an
/// optional tracer.
pub struct Outbound<C = RealClock> {
    chooser: Arc<dyn Chooser>,
    transport: Arc<dyn Transport>,
    tracer: Option<Arc<dyn Tracer>>,
    transport_name: String,
    lifecycle: Lifecycle,
    clock: C,
}

impl Outbound<RealClock> {
    pub fn new(
        chooser: Arc<dyn Chooser>,
        transport: Arc<dyn Transport>,
        transport_name: impl Into<String>,
    ) -> Self {
        Self::with_clock(chooser, transport, transport_name, RealClock)
    }
}

impl<C: Clock> Outbound<C> {
    pub fn with_clock(
        chooser: Arc<dyn Chooser>,
        transport: Arc<dyn Transport>,
        transport_name: impl Into<String>,
        clock: C,
    ) -> Self {
        Self {
            chooser,
            transport,
            tracer: None,
            transport_name: transport_name.into(),
            lifecycle: Lifecycle::new(),
            clock,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub async fn start(&self) -> Result<(), Arc<Error>> {
        self.lifecycle.start(|| async { Ok(()) }).await
    }

    pub async fn stop(&self) -> Result<(), Arc<Error>> {
        self.lifecycle.stop(|| async { Ok(()) }).await
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    pub fn transport_name(&self) -> &str {
        &self.transport_name
    }

    async fn start_span(&self, req: &Request) -> Option<(Box<dyn Span>, Arc<dyn Tracer>)> {
        let tracer = self.tracer.clone()?;
        let span = tracer
            .start_span(&self.transport_name, &req.procedure, SystemTime::now(), None)
            .await;
        Some((span, tracer))
    }

    fn inject_span(&self, req: &mut Request, span: &dyn Span, tracer: &dyn Tracer) {
        let carrier = tracer.inject(span);
        if !carrier.is_empty() {
            req.headers.insert("$tracing$", hex_encode(&carrier));
        }
    }

    /// Assert running + deadlined, inject tracing, choose a peer, send,
    /// await the reply until the ctx deadline.
    pub async fn call_unary(&self, ctx: &Ctx, mut req: Request) -> Result<Response, Error> {
        self.assert_ready(ctx).await?;

        let span_and_tracer = self.start_span(&req).await;
        if let Some((span, tracer)) = &span_and_tracer {
            self.inject_span(&mut req, span.as_ref(), tracer.as_ref());
        }

        let result = self.call_unary_inner(ctx, req).await;

        if let Some((span, _)) = &span_and_tracer {
            if let Err(e) = &result {
                span.set_error(e.kind());
            }
            span.finish();
        }
        result
    }

    async fn call_unary_inner(&self, ctx: &Ctx, req: Request) -> Result<Response, Error> {
        let lease = self.chooser.choose(ctx, &req).await?;
        trace!(peer = lease.id(), procedure = %req.procedure, "calling peer");
        // `lease`'s Drop runs `onFinish` (endRequest) on every path below,
        // success or failure, once it goes out of scope.
        ctx.select(self.transport.send_unary(ctx, &lease, req))
            .await
            .and_then(|r| r)
    }

    /// Same setup as `callUnary`, but returns the transport's acceptance
    /// timestamp rather than awaiting a reply body.
    pub async fn call_oneway(&self, ctx: &Ctx, mut req: Request) -> Result<Instant, Error> {
        self.assert_ready(ctx).await?;

        let span_and_tracer = self.start_span(&req).await;
        if let Some((span, tracer)) = &span_and_tracer {
            self.inject_span(&mut req, span.as_ref(), tracer.as_ref());
        }

        let result = self.call_oneway_inner(ctx, req).await;

        if let Some((span, _)) = &span_and_tracer {
            if let Err(e) = &result {
                span.set_error(e.kind());
            }
            span.finish();
        }
        result
    }

    async fn call_oneway_inner(&self, ctx: &Ctx, req: Request) -> Result<Instant, Error> {
        let lease = self.chooser.choose(ctx, &req).await?;
        let ack = ctx
            .select(self.transport.send_oneway(ctx, &lease, req))
            .await
            .and_then(|r| r)?;
        let _ = self.clock.now();
        Ok(ack)
    }

    async fn assert_ready(&self, ctx: &Ctx) -> Result<(), Error> {
        if !self.lifecycle.is_running().await {
            return Err(Error::failed_precondition("outbound is not running"));
        }
        if !ctx.has_deadline() {
            return Err(Error::failed_precondition(
                "outbound calls must be made with a ctx deadline",
            ));
        }
        Ok(())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
