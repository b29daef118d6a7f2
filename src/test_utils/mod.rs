//! Shared helpers for unit tests: logger, short-tick configs, an in-process
//! vote exchange and a scripted packet stream.
mod common;
mod local_exchange;
mod wire;

pub use common::*;
pub use local_exchange::*;
pub use wire::*;
