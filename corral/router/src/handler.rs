use crate::stream::StreamChannel;
use async_trait::async_trait;
use corral2_ctx::Ctx;
use corral2_error::Error;
use corral2_request::{Request, Response};
use std::sync::Arc;

/// A unary handler: receives the full request, returns the full response
/// (or a classified error) within the ctx deadline.
#[async_trait]
pub trait UnaryHandler: Send + Sync {
    async fn call(&self, ctx: &Ctx, req: Request) -> Result<Response, Error>;
}

/// A oneway handler: invoked after the request body has been fully read
/// and the caller already acknowledged; its return value (if any) is
/// discarded by the framework.
#[async_trait]
pub trait OnewayHandler: Send + Sync {
    async fn call(&self, req: Request);
}

/// A streaming handler: given a bidirectional channel bounded by `ctx`,
/// exchanges messages with the caller until either side closes it.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn call(&self, ctx: &Ctx, channel: StreamChannel);
}

/// The tagged variant a registered [`crate::Procedure`] carries.
#[derive(Clone)]
pub enum HandlerSpec {
    Unary(Arc<dyn UnaryHandler>),
    Oneway(Arc<dyn OnewayHandler>),
    Streaming(Arc<dyn StreamHandler>),
}

impl HandlerSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerSpec::Unary(_) => "unary",
            HandlerSpec::Oneway(_) => "oneway",
            HandlerSpec::Streaming(_) => "streaming",
        }
    }
}

/// A registered procedure: `(service, procedure, encoding)` is its
/// uniqueness key.
#[derive(Clone)]
pub struct Procedure {
    pub name: String,
    pub service: String,
    pub encoding: String,
    pub handler: HandlerSpec,
}

impl Procedure {
    pub fn unary(
        service: impl Into<String>,
        name: impl Into<String>,
        encoding: impl Into<String>,
        handler: impl UnaryHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            encoding: encoding.into(),
            handler: HandlerSpec::Unary(Arc::new(handler)),
        }
    }

    pub fn oneway(
        service: impl Into<String>,
        name: impl Into<String>,
        encoding: impl Into<String>,
        handler: impl OnewayHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            encoding: encoding.into(),
            handler: HandlerSpec::Oneway(Arc::new(handler)),
        }
    }

    pub fn streaming(
        service: impl Into<String>,
        name: impl Into<String>,
        encoding: impl Into<String>,
        handler: impl StreamHandler + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            encoding: encoding.into(),
            handler: HandlerSpec::Streaming(Arc::new(handler)),
        }
    }
}
