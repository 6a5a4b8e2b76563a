//! The queue transport's inbound half: a `BRPopLPush`-driven loop that
//! claims one item at a time, removes it from the durable queue once
//! claimed, decodes its envelope, and dispatches it as a oneway call.

use crate::backend::Backend;
use crate::envelope;
use corral2_clock::{Clock, RealClock};
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_reconnect::{Backoff, Reconnect};
use corral2_router::Dispatcher;
use corral2_tracing::{ExtractSpan, Tracer};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct Running {
    task: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct QueueInbound<B, C = RealClock> {
    backend: Arc<B>,
    queue_key: String,
    processing_key: String,
    poll_timeout: Duration,
    dispatcher: Arc<Dispatcher<C>>,
    tracer: Option<Arc<dyn Tracer>>,
    transport_name: String,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running>>,
}

impl<B: Backend + 'static> QueueInbound<B, RealClock> {
    pub fn new(
        backend: Arc<B>,
        queue_key: impl Into<String>,
        processing_key: impl Into<String>,
        dispatcher: Arc<Dispatcher<RealClock>>,
    ) -> Self {
        Self::with_clock_dispatcher(backend, queue_key, processing_key, dispatcher)
    }
}

impl<B: Backend + 'static, C: Clock> QueueInbound<B, C> {
    pub fn with_clock_dispatcher(
        backend: Arc<B>,
        queue_key: impl Into<String>,
        processing_key: impl Into<String>,
        dispatcher: Arc<Dispatcher<C>>,
    ) -> Self {
        Self {
            backend,
            queue_key: queue_key.into(),
            processing_key: processing_key.into(),
            poll_timeout: Duration::from_secs(1),
            dispatcher,
            tracer: None,
            transport_name: "queue".to_string(),
            lifecycle: Lifecycle::new(),
            running: Mutex::new(None),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    /// Retries the backend connection up to the startup bound, then spawns
    /// the background poll loop.
    pub async fn start(&self) -> Result<(), Error> {
        let backend = self.backend.clone();
        let queue_key = self.queue_key.clone();
        let processing_key = self.processing_key.clone();
        let poll_timeout = self.poll_timeout;
        let dispatcher = self.dispatcher.clone();
        let tracer = self.tracer.clone();
        let transport_name = self.transport_name.clone();
        let running_slot = &self.running;

        self.lifecycle
            .start(|| async move {
                let mut reconnect =
                    Reconnect::new(RealClock, Backoff::new(Duration::from_millis(10), Duration::from_millis(10)));
                reconnect
                    .connect_bounded(100, || {
                        let backend = backend.clone();
                        async move { backend.ping().await }
                    })
                    .await?;

                let cancel = CancellationToken::new();
                let task_cancel = cancel.clone();
                let task = tokio::spawn(poll_loop(
                    backend,
                    queue_key,
                    processing_key,
                    poll_timeout,
                    dispatcher,
                    tracer,
                    transport_name,
                    task_cancel,
                ));
                *running_slot.lock().await = Some(Running { task, cancel });
                Ok(())
            })
            .await
            .map_err(|e| e.clone_shallow())
    }

    /// Cancels the poll loop and waits for it to finish, up to `ctx`'s
    /// deadline.
    pub async fn stop(&self, ctx: &Ctx) -> Result<(), Error> {
        let running_slot = &self.running;
        self.lifecycle
            .stop(|| async move {
                let running = running_slot.lock().await.take();
                let Some(running) = running else {
                    return Ok(());
                };
                running.cancel.cancel();
                ctx.select(async {
                    let _ = running.task.await;
                })
                .await
            })
            .await
            .map_err(|e| e.clone_shallow())
    }
}

async fn poll_loop<B: Backend + 'static, C: Clock>(
    backend: Arc<B>,
    queue_key: String,
    processing_key: String,
    poll_timeout: Duration,
    dispatcher: Arc<Dispatcher<C>>,
    tracer: Option<Arc<dyn Tracer>>,
    transport_name: String,
    cancel: CancellationToken,
) {
    loop {
        let popped = tokio::select! {
            _ = cancel.cancelled() => return,
            popped = backend.brpoplpush(&queue_key, &processing_key, poll_timeout) => popped,
        };

        let item = match popped {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "queue poll failed");
                continue;
            }
        };

        // Removed from the processing list on claim, not after dispatch
        // completes: a crash between here and `handle_item` returning loses
        // the item rather than redelivering it. spec.md leaves at-least-once
        // delivery beyond BRPopLPush+LREM an open question and calls the
        // original best-effort; this keeps that same best-effort contract
        // rather than holding the processing-list entry until dispatch
        // finishes.
        if let Err(e) = backend.lrem(&processing_key, &item).await {
            warn!(error = %e, "failed to remove claimed item from the processing list");
        }

        if let Err(e) = handle_item(&item, &dispatcher, tracer.as_ref(), &transport_name).await {
            warn!(error = %e, "failed to dispatch a queued item");
        }
    }
}

async fn handle_item<C: Clock>(
    bytes: &[u8],
    dispatcher: &Dispatcher<C>,
    tracer: Option<&Arc<dyn Tracer>>,
    transport_name: &str,
) -> Result<(), Error> {
    let (span_context, mut req) = envelope::from_bytes(bytes)?;
    req.transport = transport_name.to_string();

    let span = match tracer {
        Some(tracer) => {
            let hook = ExtractSpan::new(span_context, tracer.clone(), transport_name, SystemTime::now());
            let (_, span) = hook.do_(&Ctx::background(), &req).await;
            Some(span)
        }
        None => None,
    };

    let result = dispatcher.dispatch_oneway(req).await;
    if let Some(span) = &span {
        if let Err(e) = &result {
            span.set_error(e.kind());
        }
        span.finish();
    }
    result.map(|_| ())
}

trait ClonedError {
    fn clone_shallow(&self) -> Error;
}

impl ClonedError for Error {
    fn clone_shallow(&self) -> Error {
        Error::new(self.kind(), self.message().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use corral2_router::{OnewayHandler, Procedure, Registry};
    use corral2_request::{Body, Request};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct RecordsInvocation(Arc<AtomicBool>);
    #[async_trait::async_trait]
    impl OnewayHandler for RecordsInvocation {
        async fn call(&self, _req: Request) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    fn dispatcher_with_oneway(called: Arc<AtomicBool>) -> Arc<Dispatcher<RealClock>> {
        let mut registry = Registry::new();
        registry
            .register(vec![Procedure::oneway("svc", "notify", "raw", RecordsInvocation(called))])
            .unwrap();
        Arc::new(Dispatcher::new(Arc::new(registry)))
    }

    async fn envelope_for(service: &str, procedure: &str) -> Vec<u8> {
        let mut req = Request::builder()
            .caller("c")
            .service(service)
            .procedure(procedure)
            .encoding("raw")
            .body(Body::empty())
            .build();
        envelope::to_bytes(None, &mut req).await.unwrap()
    }

    #[tokio::test]
    async fn claims_and_dispatches_a_queued_item() {
        let backend = Arc::new(InMemoryBackend::new());
        let called = Arc::new(AtomicBool::new(false));
        let dispatcher = dispatcher_with_oneway(called.clone());

        let inbound = QueueInbound::new(backend.clone(), "work", "processing", dispatcher)
            .with_poll_timeout(Duration::from_millis(50));
        inbound.start().await.unwrap();

        backend.lpush("work", envelope_for("svc", "notify").await).await.unwrap();

        for _ in 0..50 {
            if called.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(called.load(Ordering::SeqCst));

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        inbound.stop(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let backend = Arc::new(InMemoryBackend::new());
        let dispatcher = dispatcher_with_oneway(Arc::new(AtomicBool::new(false)));
        let inbound = QueueInbound::new(backend, "work", "processing", dispatcher);
        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        inbound.stop(&ctx).await.unwrap();
    }

    #[tokio::test]
    async fn procedure_type_mismatch_is_logged_and_does_not_crash_the_loop() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut registry = Registry::new();
        registry
            .register(vec![corral2_router::Procedure::unary(
                "svc",
                "notify",
                "raw",
                UnaryOnly,
            )])
            .unwrap();
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry)));

        let inbound = QueueInbound::new(backend.clone(), "work", "processing", dispatcher)
            .with_poll_timeout(Duration::from_millis(50));
        inbound.start().await.unwrap();

        backend.lpush("work", envelope_for("svc", "notify").await).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let ctx = Ctx::background().with_timeout(Duration::from_secs(1));
        inbound.stop(&ctx).await.unwrap();
    }

    struct UnaryOnly;
    #[async_trait::async_trait]
    impl corral2_router::UnaryHandler for UnaryOnly {
        async fn call(&self, _ctx: &Ctx, _req: Request) -> Result<corral2_request::Response, Error> {
            unreachable!("never dispatched: procedure is unary, item is sent oneway")
        }
    }
}
