//! Correlates kernel zero-copy completion notifications with the sends that
//! produced them.
//!
//! The kernel identifies each zero-copy `sendmsg` with a 32-bit counter and
//! reports completions as inclusive `(from, thru)` pairs. This module counts
//! in 64 bits, detecting 32-bit wraparound while converting reports into
//! half-open ranges, and holds each send's buffer alive until every counter
//! it produced has completed.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{event::SendCallback, notify::ZeroCopyNotice};

/// Monotonic 64-bit identifier for one zero-copy `sendmsg`.
pub type ZeroCopyCounter = u64;

const U32_MAX: ZeroCopyCounter = u32::MAX as ZeroCopyCounter;

/// Half-open `[min, max)` range of zero-copy counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ZeroCopyRange {
    min: ZeroCopyCounter,
    max: ZeroCopyCounter,
}

impl ZeroCopyRange {
    pub fn new(min: ZeroCopyCounter, max: ZeroCopyCounter) -> Self {
        Self { min, max }
    }

    pub fn min_counter(&self) -> ZeroCopyCounter {
        self.min
    }

    pub fn max_counter(&self) -> ZeroCopyCounter {
        self.max
    }

    pub fn size(&self) -> u64 {
        self.max - self.min
    }

    pub fn is_empty(&self) -> bool {
        self.min == self.max
    }

    /// Overlap of `lhs` and `rhs`, or the empty range when disjoint.
    pub fn intersect(lhs: Self, rhs: Self) -> Self {
        let min = lhs.min.max(rhs.min);
        let max = lhs.max.min(rhs.max);
        if max >= min { Self { min, max } } else { Self::default() }
    }

    /// `lhs` minus `rhs`, as up to two pieces. When the difference is
    /// contiguous the overflow is empty; when only the overflow piece is
    /// populated the pieces are swapped so the primary result is always the
    /// valid one.
    pub fn difference(lhs: Self, rhs: Self) -> (Self, Self) {
        if rhs.min <= lhs.min && rhs.max >= lhs.max {
            return (Self::default(), Self::default());
        }

        let mut result = Self::default();
        let mut overflow = Self::default();

        if lhs.min < rhs.min {
            result = Self { min: lhs.min, max: lhs.max.min(rhs.min) };
        }
        if lhs.max > rhs.max {
            overflow = Self { min: lhs.min.max(rhs.max), max: lhs.max };
        }

        if result.is_empty() {
            (overflow, Self::default())
        } else if overflow.min == result.max {
            (Self { min: result.min, max: overflow.max }, Self::default())
        } else {
            (result, overflow)
        }
    }
}

/// Issues 64-bit counters for new sends and widens the kernel's 32-bit
/// completion reports, tracking the wraparound bias.
#[derive(Debug, Default)]
pub struct ZeroCopyCounterGenerator {
    next: ZeroCopyCounter,
    bias: ZeroCopyCounter,
    generation: u64,
}

impl ZeroCopyCounterGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting from `next` within the given wraparound generation.
    pub fn configure(&mut self, next: ZeroCopyCounter, generation: u64) {
        self.next = next;
        self.bias = generation * U32_MAX;
        self.generation = generation;
    }

    pub fn next(&mut self) -> ZeroCopyCounter {
        let counter = self.next;
        self.next += 1;
        counter
    }

    /// Widen an inclusive 32-bit `(from, thru)` report into a 64-bit
    /// half-open range, advancing the generation when the report wraps.
    pub fn widen(&mut self, notice: &ZeroCopyNotice) -> ZeroCopyRange {
        let from = ZeroCopyCounter::from(notice.from);
        let thru = ZeroCopyCounter::from(notice.thru);
        let offset = self.bias + self.generation;

        if from > thru {
            // Wrapped inside this report: [from ..= u32::MAX] + [0 ..= thru].
            let size = (U32_MAX - from) + thru + 2;
            let min = offset + from;
            self.bias += U32_MAX;
            self.generation += 1;
            ZeroCopyRange::new(min, min + size)
        } else {
            let range = ZeroCopyRange::new(offset + from, offset + thru + 1);
            if thru == U32_MAX {
                self.bias += U32_MAX;
                self.generation += 1;
            }
            range
        }
    }
}

/// One send awaiting zero-copy completion. Owns the payload (kernel pages
/// reference it until completion) and the user callback.
struct ZeroCopyEntry {
    group: u64,
    outstanding: Vec<ZeroCopyRange>,
    framed: bool,
    data: Option<Bytes>,
    callback: Option<SendCallback>,
}

impl ZeroCopyEntry {
    fn complete(&self) -> bool {
        self.framed && self.outstanding.iter().all(ZeroCopyRange::is_empty)
    }

    fn subtract(&mut self, done: ZeroCopyRange) {
        let mut remaining = Vec::with_capacity(self.outstanding.len() + 1);
        for range in self.outstanding.drain(..) {
            if ZeroCopyRange::intersect(range, done).is_empty() {
                remaining.push(range);
                continue;
            }
            let (result, overflow) = ZeroCopyRange::difference(range, done);
            if !result.is_empty() {
                remaining.push(result);
            }
            if !overflow.is_empty() {
                remaining.push(overflow);
            }
        }
        self.outstanding = remaining;
    }
}

/// Queue of sends requested to be zero-copied, completed in FIFO order.
///
/// An entry is done once it is framed (no further kernel calls will extend
/// it) and its outstanding range set is empty.
pub struct ZeroCopyQueue {
    generator: ZeroCopyCounterGenerator,
    wait_list: VecDeque<ZeroCopyEntry>,
    done_list: VecDeque<ZeroCopyEntry>,
}

impl Default for ZeroCopyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ZeroCopyQueue {
    pub fn new() -> Self {
        Self {
            generator: ZeroCopyCounterGenerator::new(),
            wait_list: VecDeque::new(),
            done_list: VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn configure_generator(&mut self, next: ZeroCopyCounter, generation: u64) {
        self.generator.configure(next, generation);
    }

    /// New entry for `group`, consuming one counter.
    pub fn push(
        &mut self,
        group: u64,
        data: Bytes,
        callback: Option<SendCallback>,
    ) -> ZeroCopyCounter {
        let counter = self.generator.next();
        self.wait_list.push_back(ZeroCopyEntry {
            group,
            outstanding: vec![ZeroCopyRange::new(counter, counter + 1)],
            framed: false,
            data: Some(data),
            callback,
        });
        counter
    }

    /// The kernel consumed one more buffer for the latest entry of `group`.
    pub fn push_extend(&mut self, group: u64) -> ZeroCopyCounter {
        let counter = self.generator.next();
        if let Some(entry) = self.wait_list.iter_mut().rev().find(|e| e.group == group) {
            match entry.outstanding.last_mut() {
                Some(last) if last.max_counter() == counter => {
                    *last = ZeroCopyRange::new(last.min_counter(), counter + 1);
                }
                _ => entry.outstanding.push(ZeroCopyRange::new(counter, counter + 1)),
            }
        }
        counter
    }

    /// No further kernel calls will extend the latest entry of `group`.
    pub fn frame(&mut self, group: u64) {
        let mut completed = None;
        if let Some((index, entry)) =
            self.wait_list.iter_mut().enumerate().rev().find(|(_, e)| e.group == group)
        {
            entry.framed = true;
            if entry.complete() {
                completed = Some(index);
            }
        }
        if let Some(index) = completed {
            self.retire(index);
        }
    }

    /// Subtract a completion report from every waiting entry. Invalid or
    /// unknown ranges degrade to no-ops.
    pub fn update(&mut self, notice: &ZeroCopyNotice) {
        let done = self.generator.widen(notice);
        let mut index = 0;
        while index < self.wait_list.len() {
            let entry = &mut self.wait_list[index];
            entry.subtract(done);
            if entry.complete() {
                self.retire(index);
            } else {
                index += 1;
            }
        }
    }

    fn retire(&mut self, index: usize) {
        if let Some(mut entry) = self.wait_list.remove(index) {
            entry.data = None;
            self.done_list.push_back(entry);
        }
    }

    pub fn ready(&self) -> bool {
        !self.done_list.is_empty()
    }

    /// Pop the oldest completed entry's callback slot.
    pub fn pop(&mut self) -> Option<Option<SendCallback>> {
        self.done_list.pop_front().map(|e| e.callback)
    }

    /// Drop everything, returning the callbacks of entries that still have
    /// one so teardown can cancel them.
    pub fn clear(&mut self) -> Vec<SendCallback> {
        let mut callbacks = Vec::new();
        for mut entry in self.wait_list.drain(..).chain(self.done_list.drain(..)) {
            if let Some(cb) = entry.callback.take() {
                callbacks.push(cb);
            }
        }
        callbacks
    }

    pub fn is_empty(&self) -> bool {
        self.wait_list.is_empty() && self.done_list.is_empty()
    }
}
