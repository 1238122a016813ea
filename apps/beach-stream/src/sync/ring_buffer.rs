use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::Seq;

/// Default retention budget for a stream (500 KB).
pub const DEFAULT_MAX_BYTES: usize = 500_000;

/// First sequence number handed out by a fresh buffer. `0` is reserved for
/// "nothing received yet" on the client side.
pub const FIRST_SEQ: Seq = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub seq: Seq,
    pub bytes: Bytes,
    /// Milliseconds since the Unix epoch at which the producer wrote the chunk.
    pub timestamp_ms: u64,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// The requested range begins before the oldest retained chunk. Callers must
/// fall back to a full resync; a partial answer is never produced.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("range starting at seq {requested} was evicted (oldest retained seq {start_seq})")]
pub struct RangeUnavailable {
    pub requested: Seq,
    pub start_seq: Seq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushOutcome {
    pub seq: Seq,
    pub evicted: usize,
}

/// Concatenation of every retained chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub start_seq: Seq,
    /// Exclusive upper bound; equals the buffer's `next_seq`.
    pub end_seq: Seq,
    pub bytes: Bytes,
}

/// Byte-budgeted store of sequenced chunks. Single writer; readers take
/// ranges or snapshots, which clone `Bytes` handles rather than payloads.
#[derive(Debug)]
pub struct RingBuffer {
    chunks: VecDeque<Chunk>,
    start_seq: Seq,
    next_seq: Seq,
    total_bytes: usize,
    max_bytes: usize,
}

impl RingBuffer {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            start_seq: FIRST_SEQ,
            next_seq: FIRST_SEQ,
            total_bytes: 0,
            max_bytes: max_bytes.max(1),
        }
    }

    pub fn push(&mut self, bytes: impl Into<Bytes>) -> PushOutcome {
        self.push_at(bytes, now_ms())
    }

    pub fn push_at(&mut self, bytes: impl Into<Bytes>, timestamp_ms: u64) -> PushOutcome {
        let bytes = bytes.into();
        let seq = self.next_seq;
        self.next_seq += 1;
        self.total_bytes += bytes.len();
        self.chunks.push_back(Chunk {
            seq,
            bytes,
            timestamp_ms,
        });
        let evicted = self.evict_over_budget();
        PushOutcome { seq, evicted }
    }

    // The newest chunk is always kept, even when it alone exceeds the budget.
    fn evict_over_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_bytes > self.max_bytes && self.chunks.len() > 1 {
            let Some(oldest) = self.chunks.pop_front() else {
                break;
            };
            self.total_bytes -= oldest.len();
            evicted += 1;
        }
        self.start_seq = self
            .chunks
            .front()
            .map(|chunk| chunk.seq)
            .unwrap_or(self.next_seq);
        evicted
    }

    /// Chunks with `seq` in `[start, end)`, clipped to what has been produced.
    pub fn get_range(&self, start: Seq, end: Seq) -> Result<Vec<Chunk>, RangeUnavailable> {
        if start < self.start_seq {
            return Err(RangeUnavailable {
                requested: start,
                start_seq: self.start_seq,
            });
        }
        let end = end.min(self.next_seq);
        if start >= end {
            return Ok(Vec::new());
        }
        let offset = (start - self.start_seq) as usize;
        let count = (end - start) as usize;
        Ok(self
            .chunks
            .range(offset..offset + count)
            .cloned()
            .collect())
    }

    pub fn get_snapshot(&self) -> Snapshot {
        let mut buf = BytesMut::with_capacity(self.total_bytes);
        for chunk in &self.chunks {
            buf.extend_from_slice(&chunk.bytes);
        }
        Snapshot {
            start_seq: self.start_seq,
            end_seq: self.next_seq,
            bytes: buf.freeze(),
        }
    }

    pub fn latest(&self) -> Option<&Chunk> {
        self.chunks.back()
    }

    pub fn start_seq(&self) -> Seq {
        self.start_seq
    }

    pub fn next_seq(&self) -> Seq {
        self.next_seq
    }

    /// Highest sequence produced so far, `0` before the first push.
    pub fn last_seq(&self) -> Seq {
        self.next_seq - 1
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BYTES)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
