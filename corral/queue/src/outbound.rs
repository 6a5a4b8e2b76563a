//! The queue transport's outbound half: serialize the envelope, `LPush`
//! it, and hand back the current time as the ack. The queue never
//! confirms that anything read the item back off the list -- acceptance
//! onto the list is the only guarantee a oneway send over this transport
//! makes.

use crate::backend::Backend;
use crate::envelope;
use corral2_clock::{Clock, RealClock};
use corral2_error::Error;
use corral2_lifecycle::Lifecycle;
use corral2_reconnect::{Backoff, Reconnect};
use corral2_request::Request;
use corral2_tracing::{Carrier, Span, Tracer};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

pub struct QueueOutbound<B, C = RealClock> {
    backend: Arc<B>,
    queue_key: String,
    tracer: Option<Arc<dyn Tracer>>,
    transport_name: String,
    lifecycle: Lifecycle,
    clock: C,
}

impl<B: Backend + 'static> QueueOutbound<B, RealClock> {
    pub fn new(backend: Arc<B>, queue_key: impl Into<String>) -> Self {
        Self::with_clock(backend, queue_key, RealClock)
    }
}

impl<B: Backend + 'static, C: Clock> QueueOutbound<B, C> {
    pub fn with_clock(backend: Arc<B>, queue_key: impl Into<String>, clock: C) -> Self {
        Self {
            backend,
            queue_key: queue_key.into(),
            tracer: None,
            transport_name: "queue".to_string(),
            lifecycle: Lifecycle::new(),
            clock,
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Startup policy: the backend gets up to 100 ping attempts, ~10ms
    /// apart, before `start` fails.
    pub async fn start(&self) -> Result<(), Error> {
        let backend = self.backend.clone();
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
                Ok(())
            })
            .await
            .map_err(|e| e.clone_shallow())
    }

    pub async fn stop(&self) -> Result<(), Error> {
        self.lifecycle.stop(|| async { Ok(()) }).await.map_err(|e| e.clone_shallow())
    }

    pub fn queue_key(&self) -> &str {
        &self.queue_key
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.is_running().await
    }

    /// Serializes `req`'s envelope and `LPush`es it onto the queue.
    pub async fn call_oneway(&self, mut req: Request) -> Result<Instant, Error> {
        self.assert_ready().await?;

        let span_and_tracer = self.start_span(&req).await;
        let span_context = span_and_tracer
            .as_ref()
            .map(|(span, tracer)| tracer.inject(span.as_ref()));

        let result = self.call_oneway_inner(span_context, &mut req).await;

        if let Some((span, _)) = &span_and_tracer {
            if let Err(e) = &result {
                span.set_error(e.kind());
            }
            span.finish();
        }
        result
    }

    async fn call_oneway_inner(
        &self,
        span_context: Option<Carrier>,
        req: &mut Request,
    ) -> Result<Instant, Error> {
        let bytes = envelope::to_bytes(span_context, req).await?;
        self.backend.lpush(&self.queue_key, bytes).await?;
        Ok(self.clock.now())
    }

    async fn start_span(&self, req: &Request) -> Option<(Box<dyn Span>, Arc<dyn Tracer>)> {
        let tracer = self.tracer.clone()?;
        let span = tracer
            .start_span(&self.transport_name, &req.procedure, SystemTime::now(), None)
            .await;
        Some((span, tracer))
    }

    async fn assert_ready(&self) -> Result<(), Error> {
        if !self.lifecycle.is_running().await {
            return Err(Error::failed_precondition("queue outbound is not running"));
        }
        Ok(())
    }
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
    use corral2_request::Body;

    fn req() -> Request {
        Request::builder()
            .caller("c")
            .service("s")
            .procedure("notify")
            .encoding("raw")
            .body(Body::from_bytes(bytes::Bytes::from_static(b"payload")))
            .build()
    }

    #[tokio::test]
    async fn call_oneway_requires_running() {
        let outbound = QueueOutbound::new(Arc::new(InMemoryBackend::new()), "work");
        let err = outbound.call_oneway(req()).await.unwrap_err();
        assert_eq!(err.kind(), corral2_error::Kind::FailedPrecondition);
    }

    #[tokio::test]
    async fn call_oneway_pushes_an_envelope_onto_the_queue() {
        let backend = Arc::new(InMemoryBackend::new());
        let outbound = QueueOutbound::new(backend.clone(), "work");
        outbound.start().await.unwrap();

        outbound.call_oneway(req()).await.unwrap();

        let pushed = backend
            .brpoplpush("work", "processing", Duration::from_millis(20))
            .await
            .unwrap()
            .expect("item was pushed");
        let (span_context, decoded) = envelope::from_bytes(&pushed).unwrap();
        assert_eq!(span_context, None);
        assert_eq!(decoded.procedure, "notify");
    }
}
