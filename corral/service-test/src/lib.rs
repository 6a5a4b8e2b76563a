#![deny(rust_2018_idioms)]

//! The YAML-driven multi-process test harness: parse a fixture describing
//! a sequence of commands, spawn each in order (all but the last
//! backgrounded as servers, the last run as the client), and diff every
//! command's captured stdout against its expected output once the client
//! exits.
//!
//! This crate is a *tool* used by integration tests elsewhere in the
//! workspace, not a runtime dependency of the dispatcher or any transport.

mod diff;
mod harness;
mod spec;

pub use harness::{run, CommandOutcome, ExitCode, Report, RunError};
pub use spec::{CommandSpec, Spec};
