//! Kernel out-of-band notifications drained from the socket error queue.

use std::time::SystemTime;

/// Whether the kernel actually avoided the copy for a zero-copy send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ZeroCopyDisposition {
    /// Pages were pinned and sent in place.
    Avoided,
    /// The kernel fell back to copying; the mechanism is not worth using.
    Copied,
}

/// Completion report for a range of zero-copy sends, inclusive on both ends
/// in the kernel's 32-bit counter space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroCopyNotice {
    pub from: u32,
    pub thru: u32,
    pub disposition: ZeroCopyDisposition,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxTimestampKind {
    /// Handed to the qdisc.
    Scheduled,
    /// Left the host.
    Sent,
    /// Acknowledged by the peer.
    Acknowledged,
}

/// Kernel TX timestamp for the send identified by `id` (the byte counter of
/// the last byte of that send).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxTimestamp {
    pub kind: TxTimestampKind,
    pub id: u32,
    pub time: SystemTime,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification {
    ZeroCopy(ZeroCopyNotice),
    Timestamp(TxTimestamp),
}
