use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::sync::Seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// How long a gap may stay open before its range is requested (and re-requested).
    pub gap_timeout: Duration,
    pub ack_interval: Duration,
    /// Acknowledge immediately once this many chunks were delivered unacked.
    pub ack_every: u32,
    /// Out-of-order bytes held before giving up on gap recovery and resyncing.
    pub max_buffered_bytes: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            gap_timeout: Duration::from_millis(500),
            ack_interval: Duration::from_millis(100),
            ack_every: 10,
            max_buffered_bytes: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerAction {
    Ack { ack_seq: Seq },
    /// `end_seq` is exclusive.
    RequestRange { start_seq: Seq, end_seq: Seq },
    /// Local state was discarded; the stream must be replayed from scratch.
    Resync,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct TrackerStep {
    /// Newly contiguous chunks, in order.
    pub delivered: Vec<Bytes>,
    pub actions: Vec<TrackerAction>,
}

/// Reassembles possibly reordered chunks into a contiguous stream and decides
/// when to acknowledge or request missing ranges. Time is passed in; the
/// tracker never sleeps.
#[derive(Debug)]
pub struct SequenceTracker {
    config: TrackerConfig,
    last_contiguous_seq: Seq,
    pending_out_of_order: BTreeMap<Seq, Bytes>,
    pending_bytes: usize,
    last_acked_seq: Seq,
    unacked: u32,
    ack_deadline: Option<Instant>,
    gap_deadline: Option<Instant>,
    range_requests: u32,
}

impl SequenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config: TrackerConfig {
                ack_every: config.ack_every.max(1),
                ..config
            },
            last_contiguous_seq: 0,
            pending_out_of_order: BTreeMap::new(),
            pending_bytes: 0,
            last_acked_seq: 0,
            unacked: 0,
            ack_deadline: None,
            gap_deadline: None,
            range_requests: 0,
        }
    }

    pub fn last_contiguous_seq(&self) -> Seq {
        self.last_contiguous_seq
    }

    pub fn last_acked_seq(&self) -> Seq {
        self.last_acked_seq
    }

    pub fn pending_len(&self) -> usize {
        self.pending_out_of_order.len()
    }

    pub fn highest_buffered_seq(&self) -> Option<Seq> {
        self.pending_out_of_order.keys().next_back().copied()
    }

    pub fn ingest(&mut self, seq: Seq, bytes: Bytes, now: Instant) -> TrackerStep {
        let mut step = TrackerStep::default();
        if seq <= self.last_contiguous_seq {
            trace!(target: "beach_stream::tracker", seq, last = self.last_contiguous_seq, "duplicate chunk");
            return step;
        }

        if seq > self.last_contiguous_seq + 1 {
            if self.pending_out_of_order.contains_key(&seq) {
                return step;
            }
            self.pending_bytes += bytes.len();
            self.pending_out_of_order.insert(seq, bytes);
            if self.pending_bytes > self.config.max_buffered_bytes {
                warn!(
                    target: "beach_stream::tracker",
                    buffered = self.pending_bytes,
                    last = self.last_contiguous_seq,
                    "out-of-order buffer exceeded; resyncing"
                );
                self.reset();
                step.actions.push(TrackerAction::Resync);
                return step;
            }
            if self.gap_deadline.is_none() {
                debug!(target: "beach_stream::tracker", expected = self.last_contiguous_seq + 1, got = seq, "gap opened");
                self.gap_deadline = Some(now + self.config.gap_timeout);
            }
            return step;
        }

        step.delivered.push(bytes);
        self.last_contiguous_seq = seq;
        while let Some(bytes) = self
            .pending_out_of_order
            .remove(&(self.last_contiguous_seq + 1))
        {
            self.pending_bytes -= bytes.len();
            self.last_contiguous_seq += 1;
            step.delivered.push(bytes);
        }
        // Anything at or below the new watermark can never be delivered.
        while let Some(entry) = self.pending_out_of_order.first_entry() {
            if *entry.key() > self.last_contiguous_seq {
                break;
            }
            self.pending_bytes -= entry.remove().len();
        }

        if self.pending_out_of_order.is_empty() {
            if self.gap_deadline.take().is_some() {
                trace!(target: "beach_stream::tracker", last = self.last_contiguous_seq, "gap closed");
            }
            self.range_requests = 0;
        } else {
            self.gap_deadline = Some(now + self.config.gap_timeout);
        }

        self.unacked = self
            .unacked
            .saturating_add(step.delivered.len() as u32);
        if self.unacked >= self.config.ack_every {
            step.actions.push(self.ack());
        } else if self.ack_deadline.is_none() {
            self.ack_deadline = Some(now + self.config.ack_interval);
        }
        step
    }

    /// Fire any timers that are due at `now`.
    pub fn poll(&mut self, now: Instant) -> Vec<TrackerAction> {
        let mut actions = Vec::new();
        if self.ack_deadline.is_some_and(|deadline| now >= deadline) {
            self.ack_deadline = None;
            if self.last_contiguous_seq > self.last_acked_seq {
                actions.push(self.ack());
            }
        }
        if self.gap_deadline.is_some_and(|deadline| now >= deadline) {
            if let Some(highest) = self.highest_buffered_seq() {
                let start_seq = self.last_contiguous_seq + 1;
                self.range_requests += 1;
                debug!(
                    target: "beach_stream::tracker",
                    start_seq,
                    end_seq = highest,
                    attempt = self.range_requests,
                    "requesting missing range"
                );
                actions.push(TrackerAction::RequestRange {
                    start_seq,
                    end_seq: highest,
                });
                self.gap_deadline = Some(now + self.config.gap_timeout);
            } else {
                self.gap_deadline = None;
            }
        }
        actions
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.ack_deadline, self.gap_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn cancel_timers(&mut self) {
        self.ack_deadline = None;
        self.gap_deadline = None;
    }

    /// Discard everything, as if nothing had ever been received.
    pub fn reset(&mut self) {
        self.reset_to(0);
    }

    /// Adopt `seq` as the contiguous watermark, e.g. after a snapshot that
    /// covered everything through it. The server already counts it as acked.
    pub fn reset_to(&mut self, seq: Seq) {
        self.last_contiguous_seq = seq;
        self.last_acked_seq = seq;
        self.pending_out_of_order.clear();
        self.pending_bytes = 0;
        self.unacked = 0;
        self.range_requests = 0;
        self.cancel_timers();
    }

    fn ack(&mut self) -> TrackerAction {
        self.last_acked_seq = self.last_contiguous_seq;
        self.unacked = 0;
        self.ack_deadline = None;
        TrackerAction::Ack {
            ack_seq: self.last_contiguous_seq,
        }
    }
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};

    fn chunk(seq: Seq) -> Bytes {
        Bytes::from(format!("<{seq}>"))
    }

    fn concat(delivered: &[Bytes]) -> Vec<u8> {
        delivered.iter().flat_map(|b| b.iter().copied()).collect()
    }

    #[test_timeout::timeout]
    fn gap_is_recovered_through_range_request() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::default();
        let mut output = Vec::new();
        for seq in [1, 2, 4, 5] {
            output.extend(tracker.ingest(seq, chunk(seq), start).delivered);
        }
        assert_eq!(tracker.last_contiguous_seq(), 2);
        assert_eq!(tracker.pending_len(), 2);

        assert!(
            !tracker
                .poll(start + Duration::from_millis(499))
                .iter()
                .any(|a| matches!(a, TrackerAction::RequestRange { .. }))
        );
        let actions = tracker.poll(start + Duration::from_millis(500));
        assert!(actions.contains(&TrackerAction::RequestRange {
            start_seq: 3,
            end_seq: 5,
        }));

        // The reply replays 3 and 4; 4 is already buffered.
        let later = start + Duration::from_millis(520);
        output.extend(tracker.ingest(3, chunk(3), later).delivered);
        output.extend(tracker.ingest(4, chunk(4), later).delivered);
        let expected: Vec<u8> = (1..=5).flat_map(|seq| chunk(seq).to_vec()).collect();
        assert_eq!(concat(&output), expected);
        assert_eq!(tracker.pending_len(), 0);
        // Gap timer is gone; only the ack batch for 3..=5 remains.
        assert_eq!(tracker.next_deadline(), Some(later + Duration::from_millis(100)));
    }

    #[test_timeout::timeout]
    fn unresolved_range_is_requested_again() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::default();
        tracker.ingest(2, chunk(2), start);
        let first = tracker.poll(start + Duration::from_millis(500));
        let second = tracker.poll(start + Duration::from_millis(1000));
        let request = TrackerAction::RequestRange {
            start_seq: 1,
            end_seq: 2,
        };
        assert!(first.contains(&request));
        assert!(second.contains(&request));
    }

    #[test_timeout::timeout]
    fn redelivery_is_idempotent() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::default();
        for seq in 1..=3 {
            tracker.ingest(seq, chunk(seq), now);
        }
        let before = (tracker.last_contiguous_seq(), tracker.pending_len());
        for seq in [1, 2, 3, 2] {
            assert_eq!(tracker.ingest(seq, chunk(seq), now), TrackerStep::default());
        }
        assert_eq!((tracker.last_contiguous_seq(), tracker.pending_len()), before);

        tracker.ingest(6, chunk(6), now);
        assert_eq!(tracker.ingest(6, chunk(6), now), TrackerStep::default());
        assert_eq!(tracker.pending_len(), 1);
    }

    #[test_timeout::timeout]
    fn shuffled_delivery_reassembles_in_order() {
        let now = Instant::now();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut order: Vec<Seq> = (1..=200).collect();
        order.shuffle(&mut rng);
        let mut tracker = SequenceTracker::default();
        let mut output = Vec::new();
        for seq in order {
            output.extend(tracker.ingest(seq, chunk(seq), now).delivered);
        }
        let expected: Vec<u8> = (1..=200).flat_map(|seq| chunk(seq).to_vec()).collect();
        assert_eq!(concat(&output), expected);
        assert_eq!(tracker.last_contiguous_seq(), 200);
    }

    #[test_timeout::timeout]
    fn acks_are_batched_by_count_or_timer() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::default();
        let mut acks = Vec::new();
        for seq in 1..=10 {
            acks.extend(tracker.ingest(seq, chunk(seq), start).actions);
        }
        assert_eq!(acks, vec![TrackerAction::Ack { ack_seq: 10 }]);

        for seq in 11..=13 {
            assert!(tracker.ingest(seq, chunk(seq), start).actions.is_empty());
        }
        assert_eq!(tracker.next_deadline(), Some(start + Duration::from_millis(100)));
        assert!(tracker.poll(start + Duration::from_millis(50)).is_empty());
        assert_eq!(
            tracker.poll(start + Duration::from_millis(100)),
            vec![TrackerAction::Ack { ack_seq: 13 }]
        );
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test_timeout::timeout]
    fn overflowing_reorder_buffer_requests_resync() {
        let now = Instant::now();
        let mut tracker = SequenceTracker::new(TrackerConfig {
            max_buffered_bytes: 8,
            ..TrackerConfig::default()
        });
        tracker.ingest(1, chunk(1), now);
        tracker.ingest(3, Bytes::from_static(b"12345"), now);
        let step = tracker.ingest(4, Bytes::from_static(b"67890"), now);
        assert_eq!(step.actions, vec![TrackerAction::Resync]);
        assert_eq!(tracker.last_contiguous_seq(), 0);
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test_timeout::timeout]
    fn cancelled_timers_do_not_fire() {
        let start = Instant::now();
        let mut tracker = SequenceTracker::default();
        tracker.ingest(1, chunk(1), start);
        tracker.ingest(3, chunk(3), start);
        tracker.cancel_timers();
        assert_eq!(tracker.next_deadline(), None);
        assert!(tracker.poll(start + Duration::from_secs(5)).is_empty());
    }
}
