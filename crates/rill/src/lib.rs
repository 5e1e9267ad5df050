//! Reactor-driven stream sockets with queued sends and receives, watermark
//! flow control, rate limiting, kernel zero-copy accounting, TX timestamp
//! correlation, TLS upgrade/downgrade and a graceful shutdown/detach
//! sequence.
//!
//! The [`socket::StreamSocket`] is the per-connection runtime; the
//! [`driver::Driver`] owns a `rill-reactor` reactor plus a set of sockets
//! and routes readiness events, timers and completions between them.

pub mod assert;
pub mod driver;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod options;
pub mod queue;
pub mod resolver;
pub mod socket;
pub mod state;
pub mod timestamp;
pub mod tls;
pub mod zerocopy;

mod handle;
mod notify;
mod sys;

pub use bytes::Bytes;
pub use driver::Driver;
pub use endpoint::Endpoint;
pub use error::Error;
pub use event::{
    BindCallback, BindContext, CloseCallback, ConnectCallback, ConnectContext,
    DowngradeEventKind, Manager, QueueEvent, QueueEventKind, ReceiveCallback, ReceiveContext,
    SendCallback, SessionObserver, ShutdownEvent, ShutdownEventKind, UpgradeCallback,
    UpgradeContext,
};
pub use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
pub use handle::StreamHandle;
pub use notify::{Notification, TxTimestamp, TxTimestampKind, ZeroCopyDisposition, ZeroCopyNotice};
pub use options::{
    ConnectOptions, OpToken, ReceiveOptions, SendOptions, ShutdownDirection, ShutdownMode,
    ShutdownOrigin, SocketOptions, UpgradeOptions,
};
pub use resolver::{Resolver, SystemResolver};
pub use socket::{SocketReactor, SocketTag, StreamSocket, Target};
pub use state::OpenState;
pub use tls::{TlsPipeline, UpgradeMode};
