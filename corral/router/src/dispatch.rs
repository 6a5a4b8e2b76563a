use crate::handler::HandlerSpec;
use crate::registry::Registry;
use crate::stream::{channel_pair, StreamChannel};
use corral2_clock::{Clock, RealClock};
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_request::{Request, Response};
use corral2_tracing::Span;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Routes requests to registered handlers and enforces the per-type
/// dispatch contract. Generic over [`Clock`] so oneway ack timestamps are
/// deterministic under tests.
pub struct Dispatcher<C = RealClock> {
    registry: Arc<Registry>,
    clock: C,
}

impl Dispatcher<RealClock> {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_clock(registry, RealClock)
    }
}

impl<C: Clock> Dispatcher<C> {
    pub fn with_clock(registry: Arc<Registry>, clock: C) -> Self {
        Self { registry, clock }
    }

    /// Looks up the handler for `req` without dispatching -- exposed for
    /// transports that need to branch on handler type before they've
    /// finished reading the request off the wire.
    pub fn choose(&self, req: &Request) -> Result<HandlerSpec, Error> {
        self.registry.choose(req)
    }

    /// Unary dispatch: runs the handler within `ctx`'s deadline (required),
    /// recovers a panic as `Internal`, and tags/finishes `span` if
    /// provided.
    pub async fn dispatch_unary(
        &self,
        ctx: &Ctx,
        req: Request,
        span: Option<&dyn Span>,
    ) -> Result<Response, Error> {
        let result = self.dispatch_unary_inner(ctx, req).await;
        if let Some(span) = span {
            if let Err(e) = &result {
                span.set_error(e.kind());
            } else if let Ok(resp) = &result {
                if let Some(e) = &resp.application_error {
                    span.set_error(e.kind());
                }
            }
            span.finish();
        }
        result
    }

    async fn dispatch_unary_inner(&self, ctx: &Ctx, req: Request) -> Result<Response, Error> {
        req.validate()?;
        if !ctx.has_deadline() {
            return Err(Error::failed_precondition(
                "unary dispatch requires a ctx deadline",
            ));
        }
        let handler = match self.registry.choose(&req)? {
            HandlerSpec::Unary(h) => h,
            other => {
                return Err(Error::bad_request(format!(
                    "procedure \"{}\"::\"{}\" is {}, not unary",
                    req.service,
                    req.procedure,
                    other.kind()
                )))
            }
        };

        let guarded = AssertUnwindSafe(handler.call(ctx, req)).catch_unwind();
        match ctx.select(guarded).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(panic)) => {
                let msg = panic_message(panic.as_ref());
                error!(panic = %msg, "handler panicked");
                Err(Error::internal(format!("handler panicked: {}", msg)))
            }
            Err(timeout_or_cancel) => Err(timeout_or_cancel),
        }
    }

    /// Oneway dispatch: the body is fully read before the ack is minted,
    /// then the handler runs asynchronously -- its outcome isn't observed
    /// by the caller.
    pub async fn dispatch_oneway(&self, mut req: Request) -> Result<Instant, Error> {
        req.validate()?;
        req.body.read_to_end().await?;

        let handler = match self.registry.choose(&req)? {
            HandlerSpec::Oneway(h) => h,
            other => {
                return Err(Error::unimplemented(format!(
                    "procedure \"{}\"::\"{}\" is {}, not oneway",
                    req.service,
                    req.procedure,
                    other.kind()
                )))
            }
        };

        let ack = self.clock.now();
        tokio::spawn(async move {
            handler.call(req).await;
        });
        Ok(ack)
    }

    /// Streaming dispatch: spawns the handler against one end of a duplex
    /// channel bounded by `ctx`, returning the other end to the transport.
    pub async fn dispatch_streaming(
        &self,
        ctx: &Ctx,
        req: &Request,
        buffer: usize,
    ) -> Result<StreamChannel, Error> {
        req.validate()?;
        let handler = match self.registry.choose(req)? {
            HandlerSpec::Streaming(h) => h,
            other => {
                return Err(Error::bad_request(format!(
                    "procedure \"{}\"::\"{}\" is {}, not streaming",
                    req.service,
                    req.procedure,
                    other.kind()
                )))
            }
        };

        let (handler_side, transport_side) = channel_pair(ctx.clone(), buffer);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handler.call(&ctx, handler_side).await;
        });
        Ok(transport_side)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{OnewayHandler, Procedure, StreamHandler, UnaryHandler};
    use async_trait::async_trait;
    use corral2_clock::FakeClock;
    use corral2_request::Body;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn req(service: &str, procedure: &str, encoding: &str) -> Request {
        Request::builder()
            .caller("c")
            .service(service)
            .procedure(procedure)
            .encoding(encoding)
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

    struct Slow;
    #[async_trait]
    impl UnaryHandler for Slow {
        async fn call(&self, _ctx: &Ctx, _req: Request) -> Result<Response, Error> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            unreachable!()
        }
    }

    struct Panics;
    #[async_trait]
    impl UnaryHandler for Panics {
        async fn call(&self, _ctx: &Ctx, _req: Request) -> Result<Response, Error> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn dispatches_unary_handler() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::unary("svc", "echo", "json", Echo)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        let resp = dispatcher
            .dispatch_unary(&ctx, req("svc", "echo", "json"), None)
            .await
            .unwrap();
        assert!(!resp.is_application_error());
    }

    #[tokio::test]
    async fn unary_without_deadline_is_rejected() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::unary("svc", "echo", "json", Echo)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let err = dispatcher
            .dispatch_unary(&Ctx::background(), req("svc", "echo", "json"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::FailedPrecondition);
    }

    #[tokio::test]
    async fn unary_exceeding_deadline_is_deadline_exceeded() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::unary("svc", "slow", "json", Slow)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let ctx = Ctx::background().with_timeout(Duration::from_millis(10));
        let err = dispatcher
            .dispatch_unary(&ctx, req("svc", "slow", "json"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::DeadlineExceeded);
    }

    #[tokio::test]
    async fn panicking_handler_is_recovered_as_internal() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::unary("svc", "panics", "json", Panics)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        let err = dispatcher
            .dispatch_unary(&ctx, req("svc", "panics", "json"), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::Internal);
    }

    struct RecordsInvocation(Arc<AtomicBool>);
    #[async_trait]
    impl OnewayHandler for RecordsInvocation {
        async fn call(&self, _req: Request) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn oneway_acks_before_handler_finishes_then_runs_it() {
        let called = Arc::new(AtomicBool::new(false));
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::oneway(
                "svc",
                "fireforget",
                "raw",
                RecordsInvocation(called.clone()),
            )])
            .unwrap();
        let clock = FakeClock::new();
        let dispatcher = Dispatcher::with_clock(Arc::new(registry), clock.clone());

        let ack = dispatcher.dispatch_oneway(req("svc", "fireforget", "raw")).await.unwrap();
        assert_eq!(ack, clock.now());

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn procedure_type_mismatch_on_oneway_is_unimplemented() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::unary("svc", "echo", "json", Echo)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let err = dispatcher
            .dispatch_oneway(req("svc", "echo", "json"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::Unimplemented);
    }

    struct EchoStream;
    #[async_trait]
    impl StreamHandler for EchoStream {
        async fn call(&self, _ctx: &Ctx, mut channel: StreamChannel) {
            while let Some(msg) = channel.recv().await {
                if channel.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn streaming_handler_echoes_messages() {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::streaming("svc", "echo", "raw", EchoStream)])
            .unwrap();
        let dispatcher = Dispatcher::new(Arc::new(registry));

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        let mut transport_side = dispatcher
            .dispatch_streaming(&ctx, &req("svc", "echo", "raw"), 4)
            .await
            .unwrap();

        transport_side.send(bytes::Bytes::from_static(b"hi")).await.unwrap();
        assert_eq!(transport_side.recv().await, Some(bytes::Bytes::from_static(b"hi")));
    }
}
