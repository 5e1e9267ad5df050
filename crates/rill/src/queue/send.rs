use std::collections::VecDeque;

use bytes::Bytes;
use rill_reactor::TimerId;

use crate::{
    event::{QueueEvent, QueueEventKind, SendCallback},
    options::OpToken,
};

/// One queued outgoing write.
///
/// An empty payload is the graceful-shutdown sentinel: it carries no bytes
/// and shuts the send half down once it reaches the queue front.
///
/// Once the zero-copy flag is set the callback slot is empty: ownership of
/// the callback moved to the zero-copy queue together with the buffer.
pub struct SendEntry {
    pub id: u64,
    pub data: Bytes,
    /// Bytes of `data` already accepted by the kernel.
    pub offset: usize,
    pub callback: Option<SendCallback>,
    pub timer: Option<TimerId>,
    pub token: Option<OpToken>,
    pub zero_copy: bool,
    /// Per-call zero-copy override carried from the send options.
    pub zero_copy_hint: Option<bool>,
}

impl SendEntry {
    pub fn new(id: u64, data: Bytes) -> Self {
        Self {
            id,
            data,
            offset: 0,
            callback: None,
            timer: None,
            token: None,
            zero_copy: false,
            zero_copy_hint: None,
        }
    }

    pub fn sentinel(id: u64) -> Self {
        Self::new(id, Bytes::new())
    }

    pub fn is_sentinel(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// FIFO of outgoing entries with a running byte total and watermark
/// authorization latches.
///
/// A watermark event fires exactly once per crossing: authorization consumes
/// the latch and only a move back across the threshold re-arms it.
pub struct SendQueue {
    entries: VecDeque<SendEntry>,
    size: usize,
    low_watermark: usize,
    high_watermark: usize,
    low_armed: bool,
    high_armed: bool,
    next_id: u64,
}

impl SendQueue {
    pub fn new(low_watermark: usize, high_watermark: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            size: 0,
            low_watermark,
            high_watermark,
            low_armed: false,
            high_armed: true,
            next_id: 0,
        }
    }

    pub fn generate_entry_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn has_entry(&self) -> bool {
        !self.entries.is_empty()
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
        if self.size < self.high_watermark {
            self.high_armed = true;
        }
    }

    pub fn is_high_watermark_violated(&self, threshold: Option<usize>) -> bool {
        self.size >= threshold.unwrap_or(self.high_watermark)
    }

    /// Returns true when the queue went empty -> non-empty.
    pub fn push_entry(&mut self, entry: SendEntry) -> bool {
        let was_empty = self.entries.is_empty();
        self.size += entry.len();
        if self.size > self.low_watermark {
            self.low_armed = true;
        }
        self.entries.push_back(entry);
        was_empty
    }

    pub fn front(&self) -> Option<&SendEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut SendEntry> {
        self.entries.front_mut()
    }

    pub fn pop_entry(&mut self) -> Option<SendEntry> {
        let entry = self.entries.pop_front()?;
        self.size -= entry.len();
        if self.size < self.high_watermark {
            self.high_armed = true;
        }
        Some(entry)
    }

    /// Partial consumption of the front entry.
    pub fn pop_size(&mut self, bytes: usize) {
        if let Some(front) = self.entries.front_mut() {
            let taken = bytes.min(front.len());
            front.offset += taken;
            self.size -= taken;
            if self.size < self.high_watermark {
                self.high_armed = true;
            }
        }
    }

    /// Number of leading entries worth gathering into one scatter-gather
    /// call, bounded by the kernel's buffer and byte budgets. Batching never
    /// applies to fewer than two entries or across a sentinel.
    pub fn batch_front(&self, max_buffers: usize, max_bytes: usize) -> Option<usize> {
        if self.entries.len() < 2 {
            return None;
        }
        let mut count = 0;
        let mut bytes = 0;
        for entry in &self.entries {
            if entry.is_sentinel() || count == max_buffers {
                break;
            }
            if count > 0 && bytes + entry.len() > max_bytes {
                break;
            }
            count += 1;
            bytes += entry.len();
            if bytes >= max_bytes {
                break;
            }
        }
        (count >= 2).then_some(count)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendEntry> {
        self.entries.iter()
    }

    /// Cancel the entry with this id, if it is still untouched by the
    /// kernel. Returns the entry and whether the queue became empty.
    pub fn remove_by_id(&mut self, id: u64) -> Option<(SendEntry, bool)> {
        let index = self
            .entries
            .iter()
            .position(|e| e.id == id && e.offset == 0 && !e.zero_copy && !e.is_sentinel())?;
        let entry = self.entries.remove(index)?;
        self.size -= entry.len();
        if self.size < self.high_watermark {
            self.high_armed = true;
        }
        Some((entry, self.entries.is_empty()))
    }

    pub fn remove_by_token(&mut self, token: OpToken) -> Option<(SendEntry, bool)> {
        let id = self
            .entries
            .iter()
            .find(|e| {
                e.token == Some(token) && e.offset == 0 && !e.zero_copy && !e.is_sentinel()
            })
            .map(|e| e.id)?;
        self.remove_by_id(id)
    }

    /// Drop every entry, reporting whether any unsent bytes were discarded.
    pub fn drain_all(&mut self) -> (Vec<SendEntry>, bool) {
        let discarded = self.size > 0;
        self.size = 0;
        self.high_armed = true;
        (self.entries.drain(..).collect(), discarded)
    }

    /// One event per downward crossing of the low watermark.
    pub fn authorize_low_watermark_event(&mut self) -> bool {
        if self.size > self.low_watermark {
            self.low_armed = true;
            return false;
        }
        std::mem::take(&mut self.low_armed)
    }

    /// One event per upward crossing of the high watermark (or of a per-call
    /// override of it).
    pub fn authorize_high_watermark_event(&mut self, threshold: Option<usize>) -> bool {
        if self.size >= threshold.unwrap_or(self.high_watermark) {
            std::mem::take(&mut self.high_armed)
        } else {
            self.high_armed = true;
            false
        }
    }

    pub fn context(&self, kind: QueueEventKind) -> QueueEvent {
        QueueEvent {
            kind,
            size: self.size,
            low_watermark: self.low_watermark,
            high_watermark: self.high_watermark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(queue: &mut SendQueue, payload: &'static [u8]) -> SendEntry {
        let id = queue.generate_entry_id();
        SendEntry::new(id, Bytes::from_static(payload))
    }

    #[test]
    fn size_tracks_partial_consumption() {
        let mut queue = SendQueue::new(0, 1024);
        let e = entry(&mut queue, b"hello world");
        assert!(queue.push_entry(e));
        assert_eq!(queue.size(), 11);

        queue.pop_size(6);
        assert_eq!(queue.size(), 5);
        assert_eq!(queue.front().unwrap().remaining(), b"world");

        let popped = queue.pop_entry().unwrap();
        assert_eq!(popped.remaining(), b"world");
        assert_eq!(queue.size(), 0);
    }

    #[test]
    fn high_watermark_fires_once_per_crossing() {
        let mut queue = SendQueue::new(0, 8);
        let e = entry(&mut queue, b"0123456789");
        queue.push_entry(e);

        assert!(queue.authorize_high_watermark_event(None));
        assert!(!queue.authorize_high_watermark_event(None));

        // Draining below the watermark re-arms the latch.
        queue.pop_size(5);
        assert!(!queue.authorize_high_watermark_event(None));
        let e = entry(&mut queue, b"abcdef");
        queue.push_entry(e);
        assert!(queue.authorize_high_watermark_event(None));
    }

    #[test]
    fn per_call_override_authorizes_below_the_steady_watermark() {
        let mut queue = SendQueue::new(0, 1024);
        let e = entry(&mut queue, b"0123456789");
        queue.push_entry(e);

        assert!(queue.is_high_watermark_violated(Some(4)));
        assert!(!queue.is_high_watermark_violated(None));
        assert!(queue.authorize_high_watermark_event(Some(4)));
        assert!(!queue.authorize_high_watermark_event(Some(4)));
    }

    #[test]
    fn low_watermark_fires_after_draining() {
        let mut queue = SendQueue::new(0, 1024);
        // Empty queue has not crossed anything yet.
        assert!(!queue.authorize_low_watermark_event());

        let e = entry(&mut queue, b"abc");
        queue.push_entry(e);
        assert!(!queue.authorize_low_watermark_event());

        queue.pop_entry();
        assert!(queue.authorize_low_watermark_event());
        assert!(!queue.authorize_low_watermark_event());
    }

    #[test]
    fn batching_needs_two_whole_entries() {
        let mut queue = SendQueue::new(0, 1024);
        let e = entry(&mut queue, b"aaaa");
        queue.push_entry(e);
        assert_eq!(queue.batch_front(16, 1024), None);

        let e = entry(&mut queue, b"bbbb");
        queue.push_entry(e);
        let e = entry(&mut queue, b"cccc");
        queue.push_entry(e);
        assert_eq!(queue.batch_front(16, 1024), Some(3));
        assert_eq!(queue.batch_front(2, 1024), Some(2));
        assert_eq!(queue.batch_front(16, 8), Some(2));

        // A sentinel fences the batch.
        let id = queue.generate_entry_id();
        queue.push_entry(SendEntry::sentinel(id));
        assert_eq!(queue.batch_front(16, 1024), Some(3));
    }

    #[test]
    fn cancel_by_token_skips_entries_the_kernel_touched() {
        let mut queue = SendQueue::new(0, 1024);
        let token = OpToken::next();

        let mut first = entry(&mut queue, b"first");
        first.token = Some(token);
        queue.push_entry(first);
        queue.pop_size(2);

        // Front entry is partially sent: not cancellable.
        assert!(queue.remove_by_token(token).is_none());

        let mut second = entry(&mut queue, b"second");
        second.token = Some(token);
        queue.push_entry(second);

        let (removed, became_empty) = queue.remove_by_token(token).unwrap();
        assert_eq!(removed.remaining(), b"second");
        assert!(!became_empty);
        assert_eq!(queue.size(), 3);
    }

    #[test]
    fn drain_reports_discarded_bytes() {
        let mut queue = SendQueue::new(0, 1024);
        let (entries, discarded) = queue.drain_all();
        assert!(entries.is_empty());
        assert!(!discarded);

        let e = entry(&mut queue, b"data");
        queue.push_entry(e);
        let (entries, discarded) = queue.drain_all();
        assert_eq!(entries.len(), 1);
        assert!(discarded);
        assert_eq!(queue.size(), 0);
    }
}
