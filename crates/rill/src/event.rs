use std::time::{Duration, SystemTime};

use bytes::Bytes;
use mio::Token;
use rustls_pki_types::CertificateDer;

use crate::{endpoint::Endpoint, error::Error, options::ShutdownOrigin};

/// Events announced for either queue of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueEventKind {
    LowWatermark,
    HighWatermark,
    FlowControlApplied,
    FlowControlRelaxed,
    RateLimitApplied,
    RateLimitRelaxed,
    /// Unsent entries were dropped during teardown.
    Discarded,
}

#[derive(Clone, Copy, Debug)]
pub struct QueueEvent {
    pub kind: QueueEventKind,
    pub size: usize,
    pub low_watermark: usize,
    pub high_watermark: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownEventKind {
    Initiated,
    Send,
    Receive,
    Complete,
}

#[derive(Clone, Copy, Debug)]
pub struct ShutdownEvent {
    pub kind: ShutdownEventKind,
    pub origin: ShutdownOrigin,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DowngradeEventKind {
    Initiated,
    Complete,
}

/// Per-socket observer for queue, shutdown, downgrade and transport-error
/// announcements. All methods default to no-ops so observers implement only
/// what they watch.
pub trait SessionObserver {
    fn on_write_queue_event(&self, _event: QueueEvent) {}
    fn on_read_queue_event(&self, _event: QueueEvent) {}
    fn on_shutdown_event(&self, _event: ShutdownEvent) {}
    fn on_downgrade_event(&self, _kind: DowngradeEventKind) {}
    fn on_transport_error(&self, _error: Error) {}
}

/// Lifecycle observer for the owner of a socket set.
pub trait Manager {
    fn stream_socket_established(&self, _token: Token) {}
    fn stream_socket_closed(&self, _token: Token) {}
}

#[derive(Clone, Debug, Default)]
pub struct ConnectContext {
    pub endpoint: Option<Endpoint>,
    pub name: Option<String>,
    pub source: Option<Endpoint>,
    pub latency: Option<Duration>,
    pub attempts_remaining: usize,
}

#[derive(Clone, Debug, Default)]
pub struct BindContext {
    pub endpoint: Option<Endpoint>,
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ReceiveContext {
    pub endpoint: Option<Endpoint>,
    /// Kernel receive time of the earliest byte, when RX timestamping is on.
    pub timestamp: Option<SystemTime>,
}

#[derive(Clone, Debug, Default)]
pub struct UpgradeContext {
    pub peer_certificate: Option<CertificateDer<'static>>,
}

pub type BindCallback = Box<dyn FnOnce(Result<BindContext, Error>)>;
pub type ConnectCallback = Box<dyn FnOnce(Result<ConnectContext, Error>)>;
pub type UpgradeCallback = Box<dyn FnOnce(Result<UpgradeContext, Error>)>;
pub type SendCallback = Box<dyn FnOnce(Result<(), Error>)>;
pub type ReceiveCallback = Box<dyn FnOnce(Result<(ReceiveContext, Bytes), Error>)>;
pub type CloseCallback = Box<dyn FnOnce()>;
