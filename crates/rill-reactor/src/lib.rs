//! Readiness reactor for non-blocking stream sockets.
//!
//! Owns the `mio::Poll`, per-token interest bookkeeping, one-shot timers and
//! the asynchronous detachment protocol. Everything protocol-shaped lives in
//! the `rill` crate; this one only moves readiness around.

mod reactor;
mod timer;

pub use mio::{Events, Interest, Token, event};
pub use reactor::{Reactor, RemoteHandle, WAKER_TOKEN};
pub use timer::{TimerId, TimerQueue};
