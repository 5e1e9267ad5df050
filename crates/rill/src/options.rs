use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

/// Caller-supplied correlation token for cancellable operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpToken(pub u64);

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

impl OpToken {
    /// A process-unique token.
    pub fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownDirection {
    Send,
    Receive,
    Both,
}

impl ShutdownDirection {
    pub fn includes_send(self) -> bool {
        matches!(self, Self::Send | Self::Both)
    }

    pub fn includes_receive(self) -> bool {
        matches!(self, Self::Receive | Self::Both)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownMode {
    /// Flush the write queue before shutting down the send half.
    Graceful,
    Immediate,
}

/// Who initiated a shutdown of a half.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownOrigin {
    Source,
    Remote,
}

/// Steady-state socket configuration, applied at open/adopt and carried for
/// reconnect attempts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SocketOptions {
    /// Keep the other half open when one half shuts down.
    pub keep_half_open: bool,
    /// Skip the kernel shutdown handshake on close.
    pub abortive_close: bool,
    pub reuse_address: bool,
    /// Source endpoint bound before connecting, if any.
    pub source: Option<Endpoint>,
    pub send_buffer_size: Option<usize>,
    pub receive_buffer_size: Option<usize>,
    pub send_low_watermark: usize,
    pub send_high_watermark: usize,
    pub receive_low_watermark: usize,
    pub receive_high_watermark: usize,
    /// Drain the write queue until the kernel blocks, instead of one
    /// iteration per writable event.
    pub send_greedily: bool,
    pub receive_greedily: bool,
    /// Payload size at or above which sends request kernel zero-copy.
    /// `None` means never.
    pub zero_copy_threshold: Option<usize>,
    pub timestamp_outgoing_data: Option<bool>,
    pub timestamp_incoming_data: Option<bool>,
    /// Upper bound for a single kernel receive reservation.
    pub max_incoming_transfer_size: usize,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keep_half_open: false,
            abortive_close: false,
            reuse_address: false,
            source: None,
            send_buffer_size: None,
            receive_buffer_size: None,
            send_low_watermark: 0,
            send_high_watermark: 64 * 1024 * 1024,
            receive_low_watermark: 1,
            receive_high_watermark: 64 * 1024 * 1024,
            send_greedily: true,
            receive_greedily: true,
            zero_copy_threshold: None,
            timestamp_outgoing_data: None,
            timestamp_incoming_data: None,
            max_incoming_transfer_size: 64 * 1024,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConnectOptions {
    /// Number of retries after the initial attempt.
    pub retry_count: Option<usize>,
    pub retry_interval: Option<Duration>,
    /// Overall deadline for the whole connect operation.
    pub deadline: Option<Duration>,
    pub token: Option<OpToken>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SendOptions {
    pub deadline: Option<Duration>,
    pub token: Option<OpToken>,
    /// Per-call override of the write queue high watermark.
    pub high_watermark: Option<usize>,
    /// Allow the completion callback to run inline from the calling frame.
    pub recurse: bool,
    /// Per-call zero-copy override; `None` defers to the threshold.
    pub zero_copy: Option<bool>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiveOptions {
    pub min_size: usize,
    pub max_size: usize,
    pub deadline: Option<Duration>,
    pub token: Option<OpToken>,
    pub recurse: bool,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self { min_size: 1, max_size: usize::MAX, deadline: None, token: None, recurse: false }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UpgradeOptions {
    pub deadline: Option<Duration>,
    pub token: Option<OpToken>,
}
