use std::{
    collections::BTreeMap,
    time::{Duration, SystemTime},
};

use crate::notify::{TxTimestamp, TxTimestampKind};

/// Entries older than this many sends are assumed lost and pruned.
const MAX_PENDING: usize = 1024;

/// Matches kernel TX timestamps back to the wall-clock time the originating
/// send was handed to the kernel.
///
/// Keys are the stream byte counter the kernel uses for `tskey`: the offset
/// of the last byte of each send. One send produces up to three timestamps
/// (scheduled, sent, acknowledged); the key is retired on acknowledgment.
#[derive(Debug, Default)]
pub struct TimestampCorrelator {
    pending: BTreeMap<u32, SystemTime>,
}

impl TimestampCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_before_send(&mut self, id: u32, at: SystemTime) {
        self.pending.insert(id, at);
        while self.pending.len() > MAX_PENDING {
            let oldest = *self.pending.keys().next().unwrap();
            self.pending.remove(&oldest);
        }
    }

    /// Delay between handing the bytes to the kernel and the reported event,
    /// or `None` if the timestamp cannot be correlated.
    pub fn timestamp_received(&mut self, timestamp: &TxTimestamp) -> Option<Duration> {
        let sent_at = match timestamp.kind {
            TxTimestampKind::Acknowledged => self.pending.remove(&timestamp.id)?,
            _ => *self.pending.get(&timestamp.id)?,
        };
        timestamp.time.duration_since(sent_at).ok()
    }

    pub fn reset(&mut self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(kind: TxTimestampKind, id: u32, time: SystemTime) -> TxTimestamp {
        TxTimestamp { kind, id, time }
    }

    #[test]
    fn correlates_all_three_stages() {
        let mut correlator = TimestampCorrelator::new();
        let sent_at = SystemTime::UNIX_EPOCH + Duration::from_secs(100);
        correlator.save_before_send(31, sent_at);

        let sched = ts(TxTimestampKind::Scheduled, 31, sent_at + Duration::from_micros(50));
        assert_eq!(correlator.timestamp_received(&sched), Some(Duration::from_micros(50)));

        let sent = ts(TxTimestampKind::Sent, 31, sent_at + Duration::from_micros(80));
        assert_eq!(correlator.timestamp_received(&sent), Some(Duration::from_micros(80)));

        let acked = ts(TxTimestampKind::Acknowledged, 31, sent_at + Duration::from_millis(2));
        assert_eq!(correlator.timestamp_received(&acked), Some(Duration::from_millis(2)));

        // Acknowledgment retires the key.
        assert_eq!(correlator.timestamp_received(&sent), None);
    }

    #[test]
    fn unknown_ids_do_not_correlate() {
        let mut correlator = TimestampCorrelator::new();
        let stray = ts(TxTimestampKind::Sent, 9, SystemTime::now());
        assert_eq!(correlator.timestamp_received(&stray), None);
    }
}
