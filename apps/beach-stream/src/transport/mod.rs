use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod memory;
pub mod websocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransportId(pub u64);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_transport_id() -> TransportId {
    TransportId(NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Memory,
    WebSocket,
}

/// One framed message as it crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(text) => text.len(),
            Payload::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport channel closed")]
    ChannelClosed,
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("transport runtime error: {0}")]
    Runtime(String),
}

/// Ordered, message-framed, bidirectional link. Implementations must keep
/// `recv` cancellation safe: dropping the future may not lose a message.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;
    fn id(&self) -> TransportId;

    async fn send(&self, payload: Payload) -> Result<(), TransportError>;
    async fn recv(&self) -> Result<Payload, TransportError>;

    /// Stop both directions. The peer observes `ChannelClosed`.
    async fn close(&self);
}
