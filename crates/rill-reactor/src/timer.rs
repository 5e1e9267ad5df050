use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    time::Instant,
};

use mio::Token;

/// Handle to a scheduled timer. Cancelling through the id closes the timer
/// before its deadline is ever delivered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// One-shot timer queue keyed by a monotonic deadline.
///
/// Cancellation leaves a tombstone in the heap; the live set is the `armed`
/// map. Periodic behaviour is the caller rescheduling from its own deadline
/// handler, the same way the poll loop re-fires its repeaters.
pub struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    armed: HashMap<u64, (Token, T)>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self { heap: BinaryHeap::new(), armed: HashMap::new(), next_id: 0 }
    }

    pub fn schedule(&mut self, deadline: Instant, token: Token, tag: T) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(Reverse((deadline, id)));
        self.armed.insert(id, (token, tag));
        TimerId(id)
    }

    /// Returns true if the timer was still armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.armed.remove(&id.0).is_some()
    }

    /// Earliest armed deadline, dropping any cancelled heads on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if self.armed.contains_key(&id) {
                return Some(deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Pops one expired timer, skipping tombstones.
    pub fn pop_expired(&mut self, now: Instant) -> Option<(Token, T)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if !self.armed.contains_key(&id) {
                self.heap.pop();
                continue;
            }
            if deadline > now {
                return None;
            }
            self.heap.pop();
            return self.armed.remove(&id);
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.armed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        q.schedule(now + Duration::from_millis(20), Token(1), "late");
        q.schedule(now + Duration::from_millis(10), Token(2), "early");

        let later = now + Duration::from_millis(30);
        assert_eq!(q.pop_expired(later), Some((Token(2), "early")));
        assert_eq!(q.pop_expired(later), Some((Token(1), "late")));
        assert_eq!(q.pop_expired(later), None);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let id = q.schedule(now, Token(7), ());
        assert!(q.cancel(id));
        assert!(!q.cancel(id));
        assert_eq!(q.pop_expired(now + Duration::from_millis(1)), None);
        assert!(q.next_deadline().is_none());
    }

    #[test]
    fn next_deadline_skips_tombstones() {
        let mut q = TimerQueue::new();
        let now = Instant::now();
        let early = q.schedule(now + Duration::from_millis(1), Token(1), ());
        q.schedule(now + Duration::from_millis(5), Token(2), ());
        q.cancel(early);
        assert_eq!(q.next_deadline(), Some(now + Duration::from_millis(5)));
    }
}
