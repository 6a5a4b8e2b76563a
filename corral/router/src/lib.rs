#![deny(rust_2018_idioms)]

//! The procedure registry and dispatcher.

mod dispatch;
mod handler;
mod registry;
mod stream;

pub use dispatch::Dispatcher;
pub use handler::{HandlerSpec, OnewayHandler, Procedure, StreamHandler, UnaryHandler};
pub use registry::Registry;
pub use stream::{channel_pair, StreamChannel};
