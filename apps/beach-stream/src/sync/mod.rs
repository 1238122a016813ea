//! Server-side stream state: the sequenced ring buffer, per-connection flow
//! control, geometry validation and the protocol handler tying them together.

pub mod client_state;
pub mod dimensions;
pub mod handler;
pub mod ring_buffer;

/// Monotonic chunk sequence number. `0` never names a chunk.
pub type Seq = u64;

pub use client_state::{AckOutcome, ClientStreamState, DEFAULT_PENDING_LIMIT, DeliveryPhase};
pub use dimensions::{
    Confidence, ConfirmedDimensions, DimensionDecision, DimensionLimits, DimensionRejection,
    DimensionSource, DimensionValidator, Dimensions, RejectReason,
};
pub use handler::{ConnectionId, HandlerConfig, Reply, StreamProtocolHandler};
pub use ring_buffer::{
    Chunk, DEFAULT_MAX_BYTES, FIRST_SEQ, PushOutcome, RangeUnavailable, RingBuffer, Snapshot,
};
