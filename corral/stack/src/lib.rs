#![deny(rust_2018_idioms)]

//! Generic middleware-composition vocabulary.
//!
//! The runtime builds connection and request-handling pipelines out of
//! small layers: a `Make<T>` turns a target into a service/connection
//! asynchronously, a `Layer<M>` wraps one `Make`/service in another, and
//! `Stack<M>` is a builder that threads a sequence of layers onto a base
//! `Make`.

use async_trait::async_trait;

/// Asynchronously builds a `Service` (or, in this runtime, a connection,
/// chooser or other resource) from a target value.
#[async_trait]
pub trait Make<T>: Send + Sync {
    type Service;

    async fn make(&self, target: T) -> Self::Service;
}

#[async_trait]
impl<T, S, F> Make<T> for F
where
    F: Fn(T) -> S + Send + Sync,
    T: Send + 'static,
    S: Send,
{
    type Service = S;

    async fn make(&self, target: T) -> Self::Service {
        (self)(target)
    }
}

/// Produces a value of `Self::Service` synchronously from a target -- used
/// for handler construction, where there is no asynchronous setup step.
pub trait NewService<T> {
    type Service;

    fn new_service(&self, target: T) -> Self::Service;
}

impl<T, F, S> NewService<T> for F
where
    F: Fn(T) -> S,
{
    type Service = S;

    fn new_service(&self, target: T) -> Self::Service {
        (self)(target)
    }
}

/// Wraps an inner `Make`/service with additional behavior, producing a new
/// one. Layers compose: `Stack::push` applies them outer-to-inner in the
/// order they're pushed.
pub trait Layer<M> {
    type Service;

    fn layer(&self, inner: M) -> Self::Service;
}

/// A builder that threads a sequence of `Layer`s onto a base `Make`.
#[derive(Clone, Debug)]
pub struct Stack<M>(M);

pub fn stack<M>(inner: M) -> Stack<M> {
    Stack(inner)
}

impl<M> Stack<M> {
    pub fn push<L: Layer<M>>(self, layer: L) -> Stack<L::Service> {
        Stack(layer.layer(self.0))
    }

    pub fn into_inner(self) -> M {
        self.0
    }

    /// Validates (at the type level) that this stack makes `T`-typed
    /// targets, without changing anything -- useful for readability at call
    /// sites that build long chains.
    pub fn makes<T>(self) -> Self
    where
        M: Make<T>,
    {
        self
    }
}

#[async_trait]
impl<T, M> Make<T> for Stack<M>
where
    M: Make<T>,
    T: Send + 'static,
{
    type Service = M::Service;

    async fn make(&self, target: T) -> Self::Service {
        self.0.make(target).await
    }
}
