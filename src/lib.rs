#![deny(rust_2018_idioms)]

//! The facade: wires the dispatcher/router, the outbound call chain, peer
//! lifecycle, and a service's concrete transports into one thing a process
//! can `start`/`stop` and poll for status.
//!
//! This crate assembles a dispatcher configuration -- a name plus optional
//! logging/tracing hooks and a set of inbounds/outbounds. It does not add
//! any new routing or call-chain logic of its own -- every
//! [`corral2_router::Dispatcher`]/[`corral2_outbound::Outbound`]/transport
//! concern lives in its own crate; this one only owns *when* those things
//! start, stop, and how an operator sees their current state.

mod adapt;

pub use adapt::{HttpInboundHandle, OutboundHandle, QueueInboundHandle, QueueOutboundHandle};
pub use corral2_ctx::Ctx;
pub use corral2_error::{Error, Kind};
pub use corral2_introspect::{Entry, Snapshot};
pub use corral2_request::{Body, Headers, Request, Response};
pub use corral2_router::{Dispatcher, HandlerSpec, OnewayHandler, Procedure, StreamHandler, UnaryHandler};
pub use corral2_tracing::Tracer;

use corral2_clock::{Clock, RealClock};
use corral2_error::Aggregate;
use corral2_lifecycle::Lifecycle;
use corral2_router::Registry;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

/// A hook invoked with every classified error the dispatcher or outbound
/// chain surfaces, for a caller that wants its own structured log sink.
/// The framework itself always logs through `tracing`, independent of
/// whether a hook is configured.
pub type LoggingHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Anything a [`Corral`] can start, stop, and otherwise not know the
/// internals of: a concrete inbound transport's listen loop, or an
/// outbound call chain's readiness gate. Status reporting is a separate
/// capability ([`corral2_introspect::Reporter`]) a component may also
/// implement, dispatched by capability rather than by type assertion.
#[async_trait::async_trait]
pub trait ManagedComponent: Send + Sync {
    async fn start(&self) -> Result<(), Error>;
    async fn stop(&self, ctx: &Ctx) -> Result<(), Error>;
}

/// The dispatcher configuration: a required non-empty `name`, and
/// optional hooks. `inbounds`/`outbounds` are attached after construction
/// via [`Corral::add_inbound`]/[`Corral::add_outbound`] rather than being
/// part of this struct, since each transport needs its own constructor
/// arguments (a bind address, a queue key, ...) this crate doesn't know
/// about.
#[derive(Default)]
pub struct Config {
    pub name: String,
    pub logging_hook: Option<LoggingHook>,
    pub tracing_hook: Option<Arc<dyn Tracer>>,
}

impl Config {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            logging_hook: None,
            tracing_hook: None,
        }
    }

    pub fn with_logging_hook(mut self, hook: LoggingHook) -> Self {
        self.logging_hook = Some(hook);
        self
    }

    pub fn with_tracing_hook(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracing_hook = Some(tracer);
        self
    }
}

/// The wired-up service: a frozen-on-first-use [`Dispatcher`], a set of
/// named inbounds and outbounds, and an introspection registry aggregating
/// both.
pub struct Corral<C = RealClock> {
    name: String,
    clock: C,
    logging_hook: Option<LoggingHook>,
    tracing_hook: Option<Arc<dyn Tracer>>,
    registry: Mutex<Registry>,
    dispatcher: OnceCell<Arc<Dispatcher<C>>>,
    lifecycle: Lifecycle,
    inbounds: Mutex<Vec<(String, Arc<dyn ManagedComponent>)>>,
    outbounds: Mutex<Vec<(String, Arc<dyn ManagedComponent>)>>,
    introspection: corral2_introspect::Registry,
}

impl Corral<RealClock> {
    pub fn new(config: Config) -> Result<Self, Error> {
        Self::with_clock(config, RealClock)
    }
}

impl<C: Clock> Corral<C> {
    /// Builds a `Corral` against an injected clock -- used by tests that
    /// need deterministic oneway ack timestamps out of the dispatcher.
    pub fn with_clock(config: Config, clock: C) -> Result<Self, Error> {
        if config.name.is_empty() {
            return Err(Error::bad_request("corral name must not be empty"));
        }
        Ok(Self {
            name: config.name,
            clock,
            logging_hook: config.logging_hook,
            tracing_hook: config.tracing_hook,
            registry: Mutex::new(Registry::new()),
            dispatcher: OnceCell::new(),
            lifecycle: Lifecycle::new(),
            inbounds: Mutex::new(Vec::new()),
            outbounds: Mutex::new(Vec::new()),
            introspection: corral2_introspect::Registry::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tracing_hook(&self) -> Option<Arc<dyn Tracer>> {
        self.tracing_hook.clone()
    }

    /// Registers procedures with the not-yet-frozen registry. Collisions
    /// on registration are fatal, and the registry is immutable once
    /// frozen. Fails with `FailedPrecondition` once [`Corral::dispatcher`]
    /// has been called, which happens implicitly the first time
    /// [`Corral::start`] runs.
    pub async fn register(&self, procedures: Vec<Procedure>) -> Result<(), Error> {
        if self.dispatcher.initialized() {
            return Err(Error::failed_precondition(
                "cannot register procedures after the dispatcher has started",
            ));
        }
        self.registry.lock().await.register(procedures)
    }

    /// Attaches a named inbound component. Started/stopped (in
    /// registration order / reverse registration order) by
    /// [`Corral::start`]/[`Corral::stop`], and polled for status by
    /// [`Corral::snapshot`] if `component` also implements
    /// [`corral2_introspect::Reporter`].
    pub async fn add_inbound<T>(&self, label: impl Into<String>, component: Arc<T>)
    where
        T: ManagedComponent + corral2_introspect::Reporter + 'static,
    {
        let reporter: Arc<dyn corral2_introspect::Reporter> = component.clone();
        self.introspection.register_inbound(reporter).await;
        let managed: Arc<dyn ManagedComponent> = component;
        self.inbounds.lock().await.push((label.into(), managed));
    }

    /// Attaches a named outbound component under the logical service name
    /// it carries calls for.
    pub async fn add_outbound<T>(&self, service: impl Into<String>, component: Arc<T>)
    where
        T: ManagedComponent + corral2_introspect::Reporter + 'static,
    {
        let reporter: Arc<dyn corral2_introspect::Reporter> = component.clone();
        self.introspection.register_outbound(reporter).await;
        let managed: Arc<dyn ManagedComponent> = component;
        self.outbounds.lock().await.push((service.into(), managed));
    }

    /// Freezes the registry into a [`Dispatcher`] on first call; later
    /// calls return the same instance. Inbounds needing a `Dispatcher` to
    /// route into should call this rather than building their own.
    pub async fn dispatcher(&self) -> Arc<Dispatcher<C>>
    where
        C: Clone,
    {
        if let Some(d) = self.dispatcher.get() {
            return d.clone();
        }
        let registry = std::mem::take(&mut *self.registry.lock().await);
        let dispatcher = Arc::new(Dispatcher::with_clock(Arc::new(registry), self.clock.clone()));
        match self.dispatcher.set(dispatcher.clone()) {
            Ok(()) => dispatcher,
            // Lost a race with another caller; their value already won.
            Err(_) => self.dispatcher.get().expect("just lost a race to set it").clone(),
        }
    }

    /// Starts every registered inbound and outbound, in registration
    /// order, aggregating individual failures rather than short-circuiting
    /// on the first one. Idempotent like every other lifecycle gate in
    /// this workspace.
    pub async fn start(&self) -> Result<(), Error>
    where
        C: Clone,
    {
        let _ = self.dispatcher().await;
        let inbounds = self.inbounds.lock().await.clone();
        let outbounds = self.outbounds.lock().await.clone();
        let name = self.name.clone();
        let hook = self.logging_hook.clone();

        self.lifecycle
            .start(|| async move {
                let mut errs = Vec::new();
                for (label, component) in &inbounds {
                    if let Err(e) = component.start().await {
                        warn!(corral = %name, inbound = %label, error = %e, "inbound failed to start");
                        report(&hook, &e);
                        errs.push(e);
                    }
                }
                for (label, component) in &outbounds {
                    if let Err(e) = component.start().await {
                        warn!(corral = %name, outbound = %label, error = %e, "outbound failed to start");
                        report(&hook, &e);
                        errs.push(e);
                    }
                }
                if errs.is_empty() {
                    info!(corral = %name, "started");
                    Ok(())
                } else {
                    Err(aggregate(errs))
                }
            })
            .await
            .map_err(|e| Error::new(e.kind(), e.message().to_string()))
    }

    /// Stops every registered outbound then inbound (reverse of start
    /// order), up to `ctx`'s deadline for each.
    pub async fn stop(&self, ctx: &Ctx) -> Result<(), Error>
    where
        C: Clone,
    {
        let inbounds = self.inbounds.lock().await.clone();
        let outbounds = self.outbounds.lock().await.clone();
        let name = self.name.clone();
        let ctx = ctx.clone();

        self.lifecycle
            .stop(|| async move {
                let mut errs = Vec::new();
                for (label, component) in outbounds.iter().rev() {
                    if let Err(e) = component.stop(&ctx).await {
                        warn!(corral = %name, outbound = %label, error = %e, "outbound failed to stop cleanly");
                        errs.push(e);
                    }
                }
                for (label, component) in inbounds.iter().rev() {
                    if let Err(e) = component.stop(&ctx).await {
                        warn!(corral = %name, inbound = %label, error = %e, "inbound failed to stop cleanly");
                        errs.push(e);
                    }
                }
                if errs.is_empty() {
                    info!(corral = %name, "stopped");
                    Ok(())
                } else {
                    Err(aggregate(errs))
                }
            })
            .await
            .map_err(|e| Error::new(e.kind(), e.message().to_string()))
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    pub async fn wait_until_running(&self, deadline: std::time::Duration) -> Result<(), Error> {
        self.lifecycle.wait_until_running(deadline).await
    }

    /// The aggregated introspection snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        self.introspection.snapshot().await
    }
}

fn aggregate(errs: Vec<Error>) -> Error {
    let kind = errs.first().map(|e| e.kind()).unwrap_or(Kind::Internal);
    let agg = Aggregate(errs);
    Error::with_cause(kind, agg.to_string(), agg)
}

fn report(hook: &Option<LoggingHook>, err: &Error) {
    if let Some(hook) = hook {
        hook(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapt::OutboundHandle;
    use async_trait::async_trait;
    use corral2_balance::{PeerSpec, RoundRobin};
    use corral2_outbound::{Outbound, Transport};
    use corral2_peer::{PeerSet, Status};
    use corral2_request::Body;
    use std::time::Duration;

    fn req() -> Request {
        Request::builder()
            .caller("c")
            .service("s")
            .procedure("echo")
            .encoding("json")
            .body(Body::empty())
            .build()
    }

    struct Echo;
    #[async_trait]
    impl UnaryHandler for Echo {
        async fn call(&self, _ctx: &Ctx, mut req: Request) -> Result<Response, Error> {
            let body = req.body.read_to_end().await?;
            Ok(Response::new(Body::from_bytes(body)))
        }
    }

    #[tokio::test]
    async fn rejects_empty_name() {
        let err = Corral::new(Config::new("")).unwrap_err();
        assert_eq!(err.kind(), Kind::BadRequest);
    }

    #[tokio::test]
    async fn registers_and_dispatches_a_procedure() {
        let corral = Corral::new(Config::new("svc")).unwrap();
        corral
            .register(vec![Procedure::unary("s", "echo", "json", Echo)])
            .await
            .unwrap();

        let dispatcher = corral.dispatcher().await;
        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        let resp = dispatcher.dispatch_unary(&ctx, req(), None).await.unwrap();
        assert!(!resp.is_application_error());
    }

    #[tokio::test]
    async fn registration_after_dispatcher_is_frozen_fails() {
        let corral = Corral::new(Config::new("svc")).unwrap();
        let _ = corral.dispatcher().await;
        let err = corral
            .register(vec![Procedure::unary("s", "echo", "json", Echo)])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Kind::FailedPrecondition);
    }

    struct EchoTransport;
    #[async_trait]
    impl Transport for EchoTransport {
        async fn send_unary(
            &self,
            _ctx: &Ctx,
            _peer: &corral2_balance::Lease,
            req: Request,
        ) -> Result<Response, Error> {
            Ok(Response::new(Body::from_bytes(bytes::Bytes::from(req.procedure))))
        }
        async fn send_oneway(
            &self,
            _ctx: &Ctx,
            _peer: &corral2_balance::Lease,
            _req: Request,
        ) -> Result<std::time::Instant, Error> {
            Ok(std::time::Instant::now())
        }
    }

    #[tokio::test]
    async fn starts_and_stops_an_attached_outbound() {
        let corral = Corral::new(Config::new("svc")).unwrap();

        let peer_set = Arc::new(PeerSet::new());
        let rr = RoundRobin::new(peer_set);
        rr.start().await;
        rr.update(vec![PeerSpec::new("p1", Status::Available)], vec![])
            .await
            .unwrap();
        let outbound = Arc::new(Outbound::new(rr, Arc::new(EchoTransport), "http"));
        corral
            .add_outbound("downstream", Arc::new(OutboundHandle::new(outbound.clone(), "downstream")))
            .await;

        corral.start().await.unwrap();
        assert!(corral.is_running().await);
        assert!(outbound.is_running().await);

        let snapshot = corral.snapshot().await;
        assert_eq!(snapshot.outbounds.len(), 1);

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        corral.stop(&ctx).await.unwrap();
        assert!(!corral.is_running().await);
    }
}
