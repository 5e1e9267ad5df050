use std::{
    collections::VecDeque,
    time::{Instant, SystemTime},
};

use bytes::{Bytes, BytesMut};
use rill_reactor::TimerId;

use crate::{
    event::{QueueEvent, QueueEventKind, ReceiveCallback},
    options::OpToken,
};

/// One kernel receive's worth of bytes. The bytes themselves live in the
/// queue's coalesced buffer so reads can cross entry boundaries.
pub struct ReceiveEntry {
    pub length: usize,
    pub arrived: Instant,
    /// Kernel receive time when RX timestamping is enabled.
    pub kernel_time: Option<SystemTime>,
}

/// A pending callback-mode receive, satisfied once `min_size` bytes are
/// buffered.
pub struct ReceiveCallbackEntry {
    pub id: u64,
    pub min_size: usize,
    pub max_size: usize,
    pub timer: Option<TimerId>,
    pub token: Option<OpToken>,
    pub callback: ReceiveCallback,
}

/// Coalesced incoming byte queue plus the FIFO of pending receive callbacks.
///
/// Invariant: the entry lengths always sum to the coalesced buffer length.
///
/// Watermarks are inverted relative to the send queue: the low watermark
/// fires when enough data is buffered (`size >= low`), the high watermark
/// when the buffer is overfull (`size >= high`).
pub struct ReceiveQueue {
    data: BytesMut,
    entries: VecDeque<ReceiveEntry>,
    callbacks: VecDeque<ReceiveCallbackEntry>,
    low_watermark: usize,
    high_watermark: usize,
    low_armed: bool,
    high_armed: bool,
    pending_reserve: usize,
    next_callback_id: u64,
}

impl ReceiveQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            data: BytesMut::new(),
            entries: VecDeque::new(),
            callbacks: VecDeque::new(),
            low_watermark,
            high_watermark,
            low_armed: true,
            high_armed: true,
            pending_reserve: 0,
            next_callback_id: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn total_entry_length(&self) -> usize {
        self.entries.iter().map(|e| e.length).sum()
    }

    pub fn low_watermark(&self) -> usize {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> usize {
        self.high_watermark
    }

    pub fn set_watermarks(&mut self, low: usize, high: usize) {
        self.low_watermark = low;
        self.high_watermark = high;
    }

    #[inline]
    pub fn is_high_watermark_violated(&self) -> bool {
        self.size() >= self.high_watermark
    }

    /// Grow the coalesced buffer by `reserve` bytes for a kernel receive to
    /// fill. Must be paired with [`ReceiveQueue::commit_fill`].
    pub fn fill_buffer(&mut self, reserve: usize) -> &mut [u8] {
        let start = self.data.len();
        self.data.resize(start + reserve, 0);
        self.pending_reserve = reserve;
        &mut self.data[start..]
    }

    /// Shrink the reservation to the bytes actually received and record them
    /// as one entry.
    pub fn commit_fill(&mut self, filled: usize, kernel_time: Option<SystemTime>) {
        let unused = self.pending_reserve - filled;
        self.pending_reserve = 0;
        self.data.truncate(self.data.len() - unused);
        if filled > 0 {
            self.entries.push_back(ReceiveEntry {
                length: filled,
                arrived: Instant::now(),
                kernel_time,
            });
        }
    }

    /// Append already-materialized bytes (e.g. TLS plaintext) as one entry.
    pub fn append_entry(&mut self, bytes: &[u8], kernel_time: Option<SystemTime>) {
        if bytes.is_empty() {
            return;
        }
        self.data.extend_from_slice(bytes);
        self.entries.push_back(ReceiveEntry {
            length: bytes.len(),
            arrived: Instant::now(),
            kernel_time,
        });
    }

    pub fn front_kernel_time(&self) -> Option<SystemTime> {
        self.entries.front().and_then(|e| e.kernel_time)
    }

    /// Consume up to `max_size` buffered bytes, crossing entry boundaries
    /// and partially consuming the tail entry.
    pub fn extract(&mut self, max_size: usize) -> Bytes {
        let mut remaining = max_size;
        let mut dequeued = 0;
        while remaining > 0 {
            let Some(front) = self.entries.front_mut() else {
                break;
            };
            let take = remaining.min(front.length);
            dequeued += take;
            remaining -= take;
            if take == front.length {
                self.entries.pop_front();
            } else {
                front.length -= take;
                break;
            }
        }
        let out = self.data.split_to(dequeued).freeze();
        if self.size() < self.low_watermark {
            self.low_armed = true;
        }
        if self.size() < self.high_watermark {
            self.high_armed = true;
        }
        out
    }

    /// Drain everything, returning the bytes and the earliest entry's
    /// kernel timestamp. Used when buffered plaintext is reinterpreted as
    /// ciphertext during a TLS upgrade.
    pub fn take_all(&mut self) -> (Bytes, Option<SystemTime>) {
        let kernel_time = self.front_kernel_time();
        self.entries.clear();
        let len = self.data.len();
        let bytes = self.data.split_to(len).freeze();
        self.low_armed = true;
        self.high_armed = true;
        (bytes, kernel_time)
    }

    pub fn generate_callback_id(&mut self) -> u64 {
        let id = self.next_callback_id;
        self.next_callback_id += 1;
        id
    }

    pub fn push_callback(&mut self, entry: ReceiveCallbackEntry) {
        self.callbacks.push_back(entry);
    }

    pub fn has_callback(&self) -> bool {
        !self.callbacks.is_empty()
    }

    /// Pop the front callback once its minimum is buffered.
    pub fn pop_ready_callback(&mut self) -> Option<ReceiveCallbackEntry> {
        if self.callbacks.front()?.min_size <= self.size() {
            self.callbacks.pop_front()
        } else {
            None
        }
    }

    pub fn remove_callback_by_id(&mut self, id: u64) -> Option<ReceiveCallbackEntry> {
        let index = self.callbacks.iter().position(|e| e.id == id)?;
        self.callbacks.remove(index)
    }

    pub fn remove_callback_by_token(&mut self, token: OpToken) -> Option<ReceiveCallbackEntry> {
        let index = self.callbacks.iter().position(|e| e.token == Some(token))?;
        self.callbacks.remove(index)
    }

    pub fn drain_callbacks(&mut self) -> Vec<ReceiveCallbackEntry> {
        self.callbacks.drain(..).collect()
    }

    /// One event per upward crossing of the low watermark (data available).
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.size() < self.low_watermark {
            self.low_armed = true;
            return false;
        }
        std::mem::take(&mut self.low_armed)
    }

    /// One event per upward crossing of the high watermark (overfull).
    pub fn authorize_high_watermark_event(&mut self) -> bool {
        if self.size() < self.high_watermark {
            self.high_armed = true;
            return false;
        }
        std::mem::take(&mut self.high_armed)
    }

    pub fn context(&self, kind: QueueEventKind) -> QueueEvent {
        QueueEvent {
            kind,
            size: self.size(),
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}
