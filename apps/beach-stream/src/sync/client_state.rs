use std::time::Instant;

use super::Seq;

/// Chunks a client may have in flight before live sends are withheld.
pub const DEFAULT_PENDING_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPhase {
    /// Connected but no `SyncRequest` yet; the replay position is unknown.
    AwaitingSync,
    Live,
    /// Withheld chunks were evicted before they could be sent. Live delivery
    /// stays off until the client asks for a fresh sync.
    AwaitingResync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckOutcome {
    pub advanced: bool,
    /// The client acknowledged beyond what was sent; the value was clamped.
    pub clamped: bool,
}

/// Server-side view of one connection's position in the stream.
///
/// Invariant: `ack_seq <= sent_seq`, so `pending_count() == sent_seq - ack_seq`.
#[derive(Debug, Clone)]
pub struct ClientStreamState {
    ack_seq: Seq,
    sent_seq: Seq,
    last_ack_time: Option<Instant>,
    pending_limit: u32,
    phase: DeliveryPhase,
}

impl ClientStreamState {
    pub fn new(pending_limit: u32) -> Self {
        Self {
            ack_seq: 0,
            sent_seq: 0,
            last_ack_time: None,
            pending_limit: pending_limit.max(1),
            phase: DeliveryPhase::AwaitingSync,
        }
    }

    pub fn ack_seq(&self) -> Seq {
        self.ack_seq
    }

    pub fn sent_seq(&self) -> Seq {
        self.sent_seq
    }

    pub fn last_ack_time(&self) -> Option<Instant> {
        self.last_ack_time
    }

    pub fn phase(&self) -> DeliveryPhase {
        self.phase
    }

    pub fn is_live(&self) -> bool {
        self.phase == DeliveryPhase::Live
    }

    pub fn pending_limit(&self) -> u32 {
        self.pending_limit
    }

    pub fn pending_count(&self) -> u32 {
        u32::try_from(self.sent_seq - self.ack_seq).unwrap_or(u32::MAX)
    }

    /// Remaining sends before the window closes.
    pub fn window(&self) -> u32 {
        self.pending_limit.saturating_sub(self.pending_count())
    }

    pub fn is_saturated(&self) -> bool {
        self.window() == 0
    }

    pub fn record_sent(&mut self, seq: Seq) {
        self.sent_seq = self.sent_seq.max(seq);
    }

    /// Monotonic ack update; never moves backwards and never passes `sent_seq`.
    pub fn record_ack(&mut self, ack: Seq, now: Instant) -> AckOutcome {
        self.last_ack_time = Some(now);
        let clamped = ack > self.sent_seq;
        let ack = ack.min(self.sent_seq);
        let advanced = ack > self.ack_seq;
        if advanced {
            self.ack_seq = ack;
        }
        AckOutcome { advanced, clamped }
    }

    /// Start live delivery after a sync reply covering everything through `sent_seq`.
    pub fn begin_live(&mut self, acked: Seq, sent_seq: Seq) {
        self.sent_seq = sent_seq;
        self.ack_seq = acked.min(sent_seq);
        self.phase = DeliveryPhase::Live;
    }

    pub fn mark_awaiting_resync(&mut self) {
        self.phase = DeliveryPhase::AwaitingResync;
    }
}

impl Default for ClientStreamState {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_LIMIT)
    }
}
