#![deny(rust_2018_idioms)]

//! Span injection/extraction hooks.
//!
//! The core only depends on this shape: start a span, tag it with a
//! classified error if the call failed, finish it, and inject/extract its
//! context over an opaque binary carrier. Any real tracer (OpenTracing,
//! OpenTelemetry, a test recorder) plugs in by implementing [`Tracer`] and
//! [`Span`]; nothing here names a concrete backend, matching the non-goal
//! that tracing *backends* are external collaborators.

use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Kind;
use corral2_request::Request;
use std::sync::Arc;
use std::time::SystemTime;

/// The binary span-context carrier: opaque bytes a [`Tracer`] knows how to
/// read back. Transports decide where these bytes live on the wire (an
/// HTTP header, a TChannel frame field, the queue envelope's
/// `spanContext` field) -- this crate only moves the bytes around.
pub type Carrier = Vec<u8>;

/// A single in-flight trace span.
pub trait Span: Send + Sync {
    /// Tags this span with a classified failure. Called by the dispatcher
    /// and outbound chain when a call completes with an error.
    fn set_error(&self, kind: Kind);

    /// Marks the span complete. Idempotent.
    fn finish(&self);
}

/// A tracer capable of starting spans and moving their context on and off
/// the wire.
#[async_trait]
pub trait Tracer: Send + Sync {
    /// Starts a new span. `parent` is `Some` when extracted from an inbound
    /// carrier (this call is a child of some other process's span);
    /// `None` when this call originates the trace.
    async fn start_span(
        &self,
        transport_name: &str,
        operation_name: &str,
        start_time: SystemTime,
        parent: Option<&Carrier>,
    ) -> Box<dyn Span>;

    /// Serializes `span`'s context to the binary carrier format this
    /// tracer round-trips through `start_span`'s `parent` argument.
    fn inject(&self, span: &dyn Span) -> Carrier;
}

/// Starts a fresh (non-child) span for an outbound call.
pub struct CreateSpan<T> {
    pub tracer: Arc<T>,
    pub transport_name: String,
    pub start_time: SystemTime,
}

impl<T: Tracer> CreateSpan<T> {
    pub fn new(tracer: Arc<T>, transport_name: impl Into<String>, start_time: SystemTime) -> Self {
        Self {
            tracer,
            transport_name: transport_name.into(),
            start_time,
        }
    }

    pub async fn do_(&self, ctx: &Ctx, req: &Request) -> (Ctx, Box<dyn Span>) {
        let span = self
            .tracer
            .start_span(&self.transport_name, &req.procedure, self.start_time, None)
            .await;
        (ctx.clone(), span)
    }
}

/// Starts a span as the child of a parent extracted from an inbound
/// request's carrier.
pub struct ExtractSpan<T> {
    pub parent_span_context: Option<Carrier>,
    pub tracer: Arc<T>,
    pub transport_name: String,
    pub start_time: SystemTime,
}

impl<T: Tracer> ExtractSpan<T> {
    pub fn new(
        parent_span_context: Option<Carrier>,
        tracer: Arc<T>,
        transport_name: impl Into<String>,
        start_time: SystemTime,
    ) -> Self {
        Self {
            parent_span_context,
            tracer,
            transport_name: transport_name.into(),
            start_time,
        }
    }

    pub async fn do_(&self, ctx: &Ctx, req: &Request) -> (Ctx, Box<dyn Span>) {
        let span = self
            .tracer
            .start_span(
                &self.transport_name,
                &req.procedure,
                self.start_time,
                self.parent_span_context.as_ref(),
            )
            .await;
        (ctx.clone(), span)
    }
}

/// A tracer that does nothing -- the default when a dispatcher is
/// configured without a tracing hook.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTracer;

pub struct NoopSpan;

impl Span for NoopSpan {
    fn set_error(&self, _kind: Kind) {}
    fn finish(&self) {}
}

#[async_trait]
impl Tracer for NoopTracer {
    async fn start_span(
        &self,
        _transport_name: &str,
        _operation_name: &str,
        _start_time: SystemTime,
        _parent: Option<&Carrier>,
    ) -> Box<dyn Span> {
        Box::new(NoopSpan)
    }

    fn inject(&self, _span: &dyn Span) -> Carrier {
        Vec::new()
    }
}
