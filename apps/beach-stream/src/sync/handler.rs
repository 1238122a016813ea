use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::client_state::{ClientStreamState, DEFAULT_PENDING_LIMIT};
use super::dimensions::{
    ConfirmedDimensions, DimensionDecision, DimensionValidator, Dimensions,
};
use super::ring_buffer::{Chunk, RingBuffer};
use super::Seq;
use crate::metrics;
use crate::protocol::{ClientFrame, HostFrame};
use crate::telemetry::{self, PerfGuard};

pub const DEFAULT_MAX_BATCH_BYTES: usize = 64 * 1024;
pub const DEFAULT_MAX_BATCH_CHUNKS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerConfig {
    pub pending_limit: u32,
    pub max_batch_bytes: usize,
    pub max_batch_chunks: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            pending_limit: DEFAULT_PENDING_LIMIT,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            max_batch_chunks: DEFAULT_MAX_BATCH_CHUNKS,
        }
    }
}

/// Frames to send back plus any geometry the session should apply.
#[derive(Debug, Default, PartialEq)]
pub struct Reply {
    pub frames: Vec<HostFrame>,
    pub resize: Option<ConfirmedDimensions>,
}

impl Reply {
    fn frames(frames: Vec<HostFrame>) -> Self {
        Self {
            frames,
            resize: None,
        }
    }
}

/// Per-connection protocol driver. Owns its `ClientStreamState` exclusively;
/// the ring buffer is only read, never mutated, from here.
pub struct StreamProtocolHandler {
    id: ConnectionId,
    ring: Arc<RwLock<RingBuffer>>,
    state: ClientStreamState,
    validator: DimensionValidator,
    confirmed: Option<ConfirmedDimensions>,
    config: HandlerConfig,
    throttled: bool,
}

impl StreamProtocolHandler {
    pub fn new(
        id: ConnectionId,
        ring: Arc<RwLock<RingBuffer>>,
        validator: DimensionValidator,
        config: HandlerConfig,
    ) -> Self {
        Self {
            id,
            ring,
            state: ClientStreamState::new(config.pending_limit),
            validator,
            confirmed: None,
            config: HandlerConfig {
                pending_limit: config.pending_limit.max(1),
                max_batch_bytes: config.max_batch_bytes.max(1),
                max_batch_chunks: config.max_batch_chunks.max(1),
            },
            throttled: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> &ClientStreamState {
        &self.state
    }

    pub fn confirmed_dimensions(&self) -> Option<&ConfirmedDimensions> {
        self.confirmed.as_ref()
    }

    pub fn on_client_frame(&mut self, frame: ClientFrame, now: Instant) -> Reply {
        match frame {
            ClientFrame::SyncRequest {
                last_seq,
                cols,
                rows,
            } => Reply::frames(self.on_sync_request(last_seq, cols, rows)),
            ClientFrame::Ack { ack_seq } => Reply::frames(self.on_ack(ack_seq, now)),
            ClientFrame::RangeRequest { start_seq, end_seq } => {
                Reply::frames(self.on_range_request(start_seq, end_seq))
            }
            ClientFrame::NegotiateDimensions {
                cols,
                rows,
                confidence,
                source,
            } => self.on_negotiate(Dimensions {
                cols,
                rows,
                confidence,
                source,
            }),
            ClientFrame::Heartbeat {
                nonce,
                timestamp_ms,
            } => Reply::frames(vec![HostFrame::HeartbeatAck {
                nonce,
                timestamp_ms,
            }]),
            ClientFrame::Unknown => {
                metrics::PROTOCOL_NOISE
                    .with_label_values(&["unknown_frame"])
                    .inc();
                debug!(target: "beach_stream::handler", connection = %self.id, "ignoring unknown client frame");
                Reply::default()
            }
        }
    }

    /// Offer a freshly pushed chunk. Returns the frames this connection should
    /// send now, which may include earlier chunks withheld by backpressure.
    pub fn on_chunk_available(&mut self, chunk: &Chunk) -> Vec<HostFrame> {
        if !self.state.is_live() || chunk.seq <= self.state.sent_seq() {
            return Vec::new();
        }
        if chunk.seq == self.state.sent_seq() + 1 && !self.state.is_saturated() {
            self.state.record_sent(chunk.seq);
            self.note_window();
            return vec![chunk_frame(chunk)];
        }
        self.flush_live()
    }

    /// Re-read anything this connection missed from the ring, e.g. after its
    /// broadcast receiver lagged.
    pub fn catch_up(&mut self) -> Vec<HostFrame> {
        self.flush_live()
    }

    pub fn on_sync_request(&mut self, last_seq: Seq, cols: u16, rows: u16) -> Vec<HostFrame> {
        let _perf = PerfGuard::new("sync_request");
        let ring = self.ring.read();
        let start_seq = ring.start_seq();
        let next_seq = ring.next_seq();
        let (cols, rows) = self
            .confirmed
            .as_ref()
            .map(|dims| (dims.cols, dims.rows))
            .unwrap_or((cols, rows));

        // A `last_seq` at the top of the range can only come from a confused
        // client; it takes the snapshot path like any client ahead of us.
        let first = last_seq.checked_add(1);
        if first.is_none() {
            metrics::PROTOCOL_NOISE
                .with_label_values(&["sync_seq_overflow"])
                .inc();
        }
        let replay = match first {
            Some(first) if first >= start_seq && last_seq < next_seq => ring
                .get_range(first, next_seq)
                .ok()
                .map(|chunks| (first, chunks)),
            _ => None,
        };

        let mut frames = Vec::new();
        let acked = match replay {
            Some((first, chunks)) => {
                frames.push(HostFrame::SyncResponse {
                    buffer_start_seq: start_seq,
                    buffer_end_seq: next_seq,
                    cols,
                    rows,
                    full_buffer: None,
                    requires_resync: false,
                });
                debug!(
                    target: "beach_stream::handler",
                    connection = %self.id,
                    last_seq,
                    chunks = chunks.len(),
                    "serving sync from retained range"
                );
                frames.extend(self.batch_frames(first, chunks));
                last_seq
            }
            None => {
                let snapshot = ring.get_snapshot();
                metrics::RESYNCS.with_label_values(&["snapshot"]).inc();
                info!(
                    target: "beach_stream::handler",
                    connection = %self.id,
                    last_seq,
                    start_seq,
                    next_seq,
                    bytes = snapshot.bytes.len(),
                    "client outside retained window; sending snapshot"
                );
                telemetry::record_bytes("sync_snapshot_bytes", snapshot.bytes.len());
                frames.push(HostFrame::SyncResponse {
                    buffer_start_seq: snapshot.start_seq,
                    buffer_end_seq: snapshot.end_seq,
                    cols,
                    rows,
                    full_buffer: Some(snapshot.bytes),
                    requires_resync: true,
                });
                // The snapshot supersedes per-chunk acks for everything it covers.
                next_seq - 1
            }
        };
        drop(ring);

        self.state.begin_live(acked, next_seq - 1);
        self.throttled = false;
        self.note_window();
        frames
    }

    pub fn on_range_request(&mut self, start: Seq, end: Seq) -> Vec<HostFrame> {
        let _perf = PerfGuard::new("range_request");
        let ring = self.ring.read();
        let start_seq = ring.start_seq();
        if start < start_seq {
            drop(ring);
            metrics::RANGE_REQUESTS.with_label_values(&["evicted"]).inc();
            metrics::RESYNCS.with_label_values(&["range_evicted"]).inc();
            info!(
                target: "beach_stream::handler",
                connection = %self.id,
                start,
                end,
                start_seq,
                "requested range already evicted"
            );
            return vec![HostFrame::BufferOverflow {
                new_start_seq: start_seq,
                requires_resync: true,
            }];
        }
        if end <= start {
            drop(ring);
            metrics::PROTOCOL_NOISE
                .with_label_values(&["empty_range"])
                .inc();
            debug!(target: "beach_stream::handler", connection = %self.id, start, end, "empty range request");
            return self.batch_frames(start, Vec::new());
        }
        let chunks = match ring.get_range(start, end) {
            Ok(chunks) => chunks,
            Err(unavailable) => {
                drop(ring);
                return vec![HostFrame::BufferOverflow {
                    new_start_seq: unavailable.start_seq,
                    requires_resync: true,
                }];
            }
        };
        drop(ring);
        metrics::RANGE_REQUESTS.with_label_values(&["served"]).inc();
        trace!(
            target: "beach_stream::handler",
            connection = %self.id,
            start,
            end,
            served = chunks.len(),
            "range request"
        );
        self.batch_frames(start, chunks)
    }

    pub fn on_ack(&mut self, ack_seq: Seq, now: Instant) -> Vec<HostFrame> {
        let outcome = self.state.record_ack(ack_seq, now);
        if outcome.clamped {
            metrics::PROTOCOL_NOISE
                .with_label_values(&["ack_ahead"])
                .inc();
            debug!(
                target: "beach_stream::handler",
                connection = %self.id,
                ack_seq,
                sent_seq = self.state.sent_seq(),
                "ack beyond sent sequence clamped"
            );
        }
        if !outcome.advanced {
            return Vec::new();
        }
        self.flush_live()
    }

    pub fn on_negotiate(&mut self, proposed: Dimensions) -> Reply {
        match self.validator.validate(&proposed) {
            DimensionDecision::Confirmed(confirmed) => {
                metrics::DIMENSION_DECISIONS
                    .with_label_values(&[if confirmed.adjusted {
                        "adjusted"
                    } else {
                        "confirmed"
                    }])
                    .inc();
                debug!(
                    target: "beach_stream::handler",
                    connection = %self.id,
                    cols = confirmed.cols,
                    rows = confirmed.rows,
                    adjusted = confirmed.adjusted,
                    "dimensions confirmed"
                );
                self.confirmed = Some(confirmed.clone());
                Reply {
                    frames: vec![HostFrame::DimensionsConfirmed {
                        cols: confirmed.cols,
                        rows: confirmed.rows,
                        adjusted: confirmed.adjusted,
                        reason: confirmed.reason.clone(),
                    }],
                    resize: Some(confirmed),
                }
            }
            DimensionDecision::Rejected(rejection) => {
                metrics::DIMENSION_DECISIONS
                    .with_label_values(&["rejected"])
                    .inc();
                warn!(
                    target: "beach_stream::handler",
                    connection = %self.id,
                    cols = proposed.cols,
                    rows = proposed.rows,
                    reason = %rejection.reason,
                    "dimensions rejected"
                );
                Reply::frames(vec![HostFrame::DimensionsRejected {
                    reason: rejection.reason.to_string(),
                    suggested_cols: rejection.suggested_cols,
                    suggested_rows: rejection.suggested_rows,
                }])
            }
        }
    }

    // Sends `sent_seq + 1 ..` up to the open window, straight from the ring.
    fn flush_live(&mut self) -> Vec<HostFrame> {
        if !self.state.is_live() {
            return Vec::new();
        }
        let window = u64::from(self.state.window());
        let ring = self.ring.read();
        let start = self.state.sent_seq() + 1;
        if start >= ring.next_seq() {
            return Vec::new();
        }
        if window == 0 {
            drop(ring);
            self.note_window();
            return Vec::new();
        }
        let end = ring.next_seq().min(start + window);
        match ring.get_range(start, end) {
            Ok(chunks) => {
                drop(ring);
                let mut frames = Vec::with_capacity(chunks.len());
                for chunk in &chunks {
                    self.state.record_sent(chunk.seq);
                    frames.push(chunk_frame(chunk));
                }
                self.note_window();
                frames
            }
            Err(unavailable) => {
                drop(ring);
                self.state.mark_awaiting_resync();
                self.throttled = false;
                metrics::RESYNCS.with_label_values(&["live_evicted"]).inc();
                info!(
                    target: "beach_stream::handler",
                    connection = %self.id,
                    sent_seq = self.state.sent_seq(),
                    start_seq = unavailable.start_seq,
                    "withheld chunks evicted; live delivery paused until resync"
                );
                vec![HostFrame::BufferOverflow {
                    new_start_seq: unavailable.start_seq,
                    requires_resync: true,
                }]
            }
        }
    }

    fn note_window(&mut self) {
        let pending = self.state.pending_count();
        telemetry::record_gauge("connection_pending", u64::from(pending));
        let saturated = self.state.is_saturated();
        if saturated && !self.throttled {
            metrics::BACKPRESSURE_STALLS.inc();
            debug!(
                target: "beach_stream::handler",
                connection = %self.id,
                pending,
                limit = self.state.pending_limit(),
                "pending window full; withholding live chunks"
            );
        } else if !saturated && self.throttled {
            trace!(target: "beach_stream::handler", connection = %self.id, pending, "backpressure lifted");
        }
        self.throttled = saturated;
    }

    fn batch_frames(&self, start_seq: Seq, chunks: Vec<Chunk>) -> Vec<HostFrame> {
        split_batches(
            start_seq,
            chunks,
            self.config.max_batch_bytes,
            self.config.max_batch_chunks,
            MAX_BATCHED_CHUNK_LEN,
        )
    }
}

/// Largest chunk a batch length table can describe.
const MAX_BATCHED_CHUNK_LEN: usize = u32::MAX as usize;

/// Packs `chunks` into batches bounded by bytes and count; the last frame is
/// always a complete `ChunkBatch`. Chunks longer than `max_entry_len` are sent
/// as standalone `Chunk` frames between batches.
fn split_batches(
    start_seq: Seq,
    chunks: Vec<Chunk>,
    max_bytes: usize,
    max_chunks: usize,
    max_entry_len: usize,
) -> Vec<HostFrame> {
    let max_chunks = max_chunks.clamp(1, u32::MAX as usize);
    let mut frames = Vec::new();
    let mut batch = BatchBuilder::starting_at(start_seq);
    for chunk in chunks {
        let len = match u32::try_from(chunk.len()) {
            Ok(len) if chunk.len() <= max_entry_len => len,
            _ => {
                if !batch.is_empty() {
                    frames.push(batch.finish(false));
                }
                frames.push(chunk_frame(&chunk));
                batch = BatchBuilder::starting_at(chunk.seq.saturating_add(1));
                continue;
            }
        };
        let full = batch.lens.len() >= max_chunks
            || (!batch.is_empty() && batch.bytes.len() + chunk.len() > max_bytes);
        if full {
            frames.push(batch.finish(false));
        }
        batch.add(&chunk, len);
    }
    frames.push(batch.finish(true));
    frames
}

struct BatchBuilder {
    start_seq: Seq,
    bytes: BytesMut,
    lens: Vec<u32>,
}

impl BatchBuilder {
    fn starting_at(start_seq: Seq) -> Self {
        Self {
            start_seq,
            bytes: BytesMut::new(),
            lens: Vec::new(),
        }
    }

    fn is_empty(&self) -> bool {
        self.lens.is_empty()
    }

    fn add(&mut self, chunk: &Chunk, len: u32) {
        if self.lens.is_empty() {
            self.start_seq = chunk.seq;
        }
        self.lens.push(len);
        self.bytes.extend_from_slice(&chunk.bytes);
    }

    // Batch sizes are capped at `u32::MAX` entries by `split_batches`.
    fn finish(&mut self, is_complete: bool) -> HostFrame {
        let lens = std::mem::take(&mut self.lens);
        let chunk_count = u32::try_from(lens.len()).unwrap_or(u32::MAX);
        let frame = HostFrame::ChunkBatch {
            start_seq: self.start_seq,
            bytes: self.bytes.split().freeze(),
            chunk_count,
            chunk_lens: lens,
            is_complete,
        };
        self.start_seq = self.start_seq.saturating_add(u64::from(chunk_count));
        frame
    }
}

fn chunk_frame(chunk: &Chunk) -> HostFrame {
    HostFrame::Chunk {
        seq: chunk.seq,
        bytes: chunk.bytes.clone(),
        timestamp: chunk.timestamp_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::client_state::DeliveryPhase;
    use crate::sync::dimensions::DimensionLimits;

    fn ring(max_bytes: usize) -> Arc<RwLock<RingBuffer>> {
        Arc::new(RwLock::new(RingBuffer::new(max_bytes)))
    }

    fn handler(ring: &Arc<RwLock<RingBuffer>>, pending_limit: u32) -> StreamProtocolHandler {
        StreamProtocolHandler::new(
            ConnectionId(1),
            Arc::clone(ring),
            DimensionValidator::new(DimensionLimits::default()),
            HandlerConfig {
                pending_limit,
                ..HandlerConfig::default()
            },
        )
    }

    fn push(ring: &Arc<RwLock<RingBuffer>>, bytes: &'static [u8]) -> Chunk {
        let mut ring = ring.write();
        let outcome = ring.push(bytes);
        ring.get_range(outcome.seq, outcome.seq + 1).unwrap().remove(0)
    }

    fn chunk_seqs(frames: &[HostFrame]) -> Vec<Seq> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                HostFrame::Chunk { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn no_live_chunks_before_sync() {
        let ring = ring(1024);
        let mut handler = handler(&ring, 10);
        let chunk = push(&ring, b"early");
        assert!(handler.on_chunk_available(&chunk).is_empty());
        assert_eq!(handler.state().phase(), DeliveryPhase::AwaitingSync);
    }

    #[test_timeout::timeout]
    fn sync_replays_missing_range_then_goes_live() {
        let ring = ring(1024);
        for bytes in [&b"a"[..], b"bb", b"ccc"] {
            ring.write().push(bytes);
        }
        let mut handler = handler(&ring, 10);
        let frames = handler.on_sync_request(1, 80, 24);
        assert_eq!(
            frames[0],
            HostFrame::SyncResponse {
                buffer_start_seq: 1,
                buffer_end_seq: 4,
                cols: 80,
                rows: 24,
                full_buffer: None,
                requires_resync: false,
            }
        );
        let HostFrame::ChunkBatch {
            start_seq,
            bytes,
            chunk_lens,
            is_complete,
            ..
        } = &frames[1]
        else {
            panic!("expected batch, got {:?}", frames[1]);
        };
        assert_eq!(*start_seq, 2);
        assert_eq!(&bytes[..], b"bbccc");
        assert_eq!(chunk_lens, &vec![2, 3]);
        assert!(*is_complete);
        assert_eq!(handler.state().sent_seq(), 3);
        assert_eq!(handler.state().ack_seq(), 1);

        let next = push(&ring, b"dddd");
        assert_eq!(chunk_seqs(&handler.on_chunk_available(&next)), vec![4]);
    }

    #[test_timeout::timeout]
    fn caught_up_client_gets_one_empty_complete_batch() {
        let ring = ring(1024);
        ring.write().push(&b"x"[..]);
        let mut handler = handler(&ring, 10);
        let frames = handler.on_sync_request(1, 80, 24);
        assert_eq!(frames.len(), 2);
        assert!(matches!(
            frames[1],
            HostFrame::ChunkBatch {
                chunk_count: 0,
                is_complete: true,
                ..
            }
        ));
    }

    #[test_timeout::timeout]
    fn evicted_sync_falls_back_to_snapshot() {
        let ring = ring(10);
        for bytes in [&b"11111"[..], b"22222", b"33333"] {
            ring.write().push(bytes);
        }
        let mut handler = handler(&ring, 10);
        let frames = handler.on_sync_request(0, 80, 24);
        assert_eq!(frames.len(), 1);
        let HostFrame::SyncResponse {
            buffer_start_seq,
            buffer_end_seq,
            full_buffer,
            requires_resync,
            ..
        } = &frames[0]
        else {
            panic!("expected sync response");
        };
        assert_eq!((*buffer_start_seq, *buffer_end_seq), (2, 4));
        assert_eq!(full_buffer.as_deref(), Some(&b"2222233333"[..]));
        assert!(*requires_resync);
        assert_eq!(handler.state().pending_count(), 0);
    }

    #[test_timeout::timeout]
    fn batches_respect_byte_and_count_limits() {
        let ring = ring(1 << 20);
        for _ in 0..5 {
            ring.write().push(vec![7u8; 40]);
        }
        let mut handler = StreamProtocolHandler::new(
            ConnectionId(9),
            Arc::clone(&ring),
            DimensionValidator::default(),
            HandlerConfig {
                pending_limit: 100,
                max_batch_bytes: 100,
                max_batch_chunks: 64,
            },
        );
        let frames = handler.on_range_request(1, 6);
        let counts: Vec<(u32, bool)> = frames
            .iter()
            .map(|frame| match frame {
                HostFrame::ChunkBatch {
                    chunk_count,
                    is_complete,
                    ..
                } => (*chunk_count, *is_complete),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(counts, vec![(2, false), (2, false), (1, true)]);
    }

    #[test_timeout::timeout]
    fn range_before_window_overflows() {
        let ring = ring(4);
        for bytes in [&b"aa"[..], b"bb", b"cc"] {
            ring.write().push(bytes);
        }
        let mut handler = handler(&ring, 10);
        assert_eq!(
            handler.on_range_request(1, 3),
            vec![HostFrame::BufferOverflow {
                new_start_seq: 2,
                requires_resync: true,
            }]
        );
    }

    #[test_timeout::timeout]
    fn backpressure_withholds_until_ack_and_spares_other_clients() {
        let ring = ring(1 << 20);
        let mut slow = handler(&ring, 3);
        let mut fast = handler(&ring, 3);
        slow.on_sync_request(0, 80, 24);
        fast.on_sync_request(0, 80, 24);

        let mut slow_seen = Vec::new();
        for i in 0..6u8 {
            let chunk = {
                let mut ring = ring.write();
                let seq = ring.push(vec![i]).seq;
                ring.get_range(seq, seq + 1).unwrap().remove(0)
            };
            slow_seen.extend(chunk_seqs(&slow.on_chunk_available(&chunk)));
            let fast_frames = fast.on_chunk_available(&chunk);
            assert_eq!(chunk_seqs(&fast_frames), vec![chunk.seq]);
            fast.on_ack(chunk.seq, Instant::now());
        }
        assert_eq!(slow_seen, vec![1, 2, 3]);
        assert_eq!(slow.state().pending_count(), 3);

        let released = slow.on_ack(2, Instant::now());
        assert_eq!(chunk_seqs(&released), vec![4, 5]);
        assert!(slow.state().is_saturated());
        let released = slow.on_ack(5, Instant::now());
        assert_eq!(chunk_seqs(&released), vec![6]);
    }

    #[test_timeout::timeout]
    fn withheld_chunks_evicted_signal_overflow() {
        let ring = ring(4);
        let mut handler = handler(&ring, 1);
        handler.on_sync_request(0, 80, 24);
        let first = push(&ring, b"aa");
        assert_eq!(chunk_seqs(&handler.on_chunk_available(&first)), vec![1]);
        for bytes in [&b"bb"[..], b"cc", b"dd"] {
            let chunk = push(&ring, bytes);
            assert!(handler.on_chunk_available(&chunk).is_empty());
        }
        let frames = handler.on_ack(1, Instant::now());
        assert_eq!(
            frames,
            vec![HostFrame::BufferOverflow {
                new_start_seq: 3,
                requires_resync: true,
            }]
        );
        assert_eq!(handler.state().phase(), DeliveryPhase::AwaitingResync);

        let frames = handler.on_sync_request(1, 80, 24);
        assert!(matches!(
            frames[0],
            HostFrame::SyncResponse {
                requires_resync: true,
                ..
            }
        ));
        assert!(handler.state().is_live());
    }

    #[test_timeout::timeout]
    fn negotiation_confirms_and_requests_resize() {
        let ring = ring(16);
        let mut handler = handler(&ring, 10);
        let reply = handler.on_client_frame(
            ClientFrame::NegotiateDimensions {
                cols: 80,
                rows: 24,
                confidence: crate::sync::Confidence::High,
                source: crate::sync::DimensionSource::Measured,
            },
            Instant::now(),
        );
        assert_eq!(
            reply.resize.as_ref().map(|d| (d.cols, d.rows)),
            Some((80, 24))
        );
        let reply = handler.on_client_frame(
            ClientFrame::NegotiateDimensions {
                cols: 10,
                rows: 500,
                confidence: crate::sync::Confidence::Low,
                source: crate::sync::DimensionSource::Estimated,
            },
            Instant::now(),
        );
        assert!(reply.resize.is_none());
        assert!(matches!(
            reply.frames[0],
            HostFrame::DimensionsRejected { .. }
        ));
        assert_eq!(
            handler.confirmed_dimensions().map(|d| (d.cols, d.rows)),
            Some((80, 24))
        );
    }

    #[test_timeout::timeout]
    fn heartbeat_is_echoed_and_noise_ignored() {
        let ring = ring(16);
        let mut handler = handler(&ring, 10);
        let reply = handler.on_client_frame(
            ClientFrame::Heartbeat {
                nonce: 77,
                timestamp_ms: 123,
            },
            Instant::now(),
        );
        assert_eq!(
            reply.frames,
            vec![HostFrame::HeartbeatAck {
                nonce: 77,
                timestamp_ms: 123,
            }]
        );
        assert_eq!(
            handler.on_client_frame(ClientFrame::Unknown, Instant::now()),
            Reply::default()
        );
    }

    #[test_timeout::timeout]
    fn sync_from_top_of_seq_space_gets_snapshot() {
        let ring = ring(1024);
        for bytes in [&b"ab"[..], b"cd"] {
            ring.write().push(bytes);
        }
        let mut handler = handler(&ring, 10);
        let reply = handler.on_client_frame(
            ClientFrame::SyncRequest {
                last_seq: u64::MAX,
                cols: 80,
                rows: 24,
            },
            Instant::now(),
        );
        assert_eq!(reply.frames.len(), 1);
        let HostFrame::SyncResponse {
            full_buffer,
            requires_resync,
            buffer_end_seq,
            ..
        } = &reply.frames[0]
        else {
            panic!("expected sync response, got {:?}", reply.frames[0]);
        };
        assert!(*requires_resync);
        assert_eq!(full_buffer.as_deref(), Some(&b"abcd"[..]));
        assert_eq!(*buffer_end_seq, 3);
        assert!(handler.state().is_live());
        assert_eq!(handler.state().sent_seq(), 2);
    }

    #[test_timeout::timeout]
    fn chunks_too_long_for_a_length_table_travel_alone() {
        let ring = ring(1 << 20);
        let chunks: Vec<Chunk> = [&b"a"[..], b"0123456789", b"bc", b"0123456789"]
            .into_iter()
            .map(|bytes| push(&ring, bytes))
            .collect();
        let frames = split_batches(1, chunks, 1024, 64, 4);
        let shape: Vec<(&str, Seq, usize)> = frames
            .iter()
            .map(|frame| match frame {
                HostFrame::ChunkBatch {
                    start_seq,
                    chunk_lens,
                    ..
                } => ("batch", *start_seq, chunk_lens.len()),
                HostFrame::Chunk { seq, .. } => ("chunk", *seq, 1),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            shape,
            vec![
                ("batch", 1, 1),
                ("chunk", 2, 1),
                ("batch", 3, 1),
                ("chunk", 4, 1),
                ("batch", 5, 0),
            ]
        );
        assert!(matches!(
            frames.last(),
            Some(HostFrame::ChunkBatch {
                is_complete: true,
                ..
            })
        ));
    }
}
