#![deny(rust_2018_idioms)]

//! A queue-backed oneway transport and its binary envelope format:
//! requests travel as `LPush`ed blobs, claimed one at a time off a durable
//! list via `BRPopLPush`, and dispatched as oneway calls once decoded.

mod backend;
mod envelope;
mod inbound;
mod outbound;

pub use backend::{Backend, InMemoryBackend, RedisBackend};
pub use envelope::{from_bytes, to_bytes};
pub use inbound::QueueInbound;
pub use outbound::QueueOutbound;
