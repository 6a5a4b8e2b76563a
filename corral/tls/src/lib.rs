#![deny(rust_2018_idioms)]

//! The inbound TLS connection multiplexer.

mod mux;
mod observer;
mod sniff;
mod stream;

pub use mux::TlsMux;
pub use observer::{Direction, NoopObserver, Observer, TlsEvent, TlsMode, TlsOutcome};
pub use sniff::{looks_like_tls_clienthello, SniffStream};
pub use stream::MuxedStream;
