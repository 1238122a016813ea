use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sync::{Confidence, DimensionSource, Seq};
use crate::transport::Payload;

pub mod wire;

pub use wire::{WireError, binary_protocol_enabled};

pub const PROTOCOL_VERSION: u8 = 1;

/// Server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostFrame {
    Chunk {
        seq: Seq,
        bytes: Bytes,
        timestamp: u64,
    },
    /// Contiguous run of chunks starting at `start_seq`. `chunk_lens` splits
    /// `bytes` back into the individual chunks.
    ChunkBatch {
        start_seq: Seq,
        bytes: Bytes,
        chunk_count: u32,
        chunk_lens: Vec<u32>,
        is_complete: bool,
    },
    SyncResponse {
        buffer_start_seq: Seq,
        /// Exclusive.
        buffer_end_seq: Seq,
        cols: u16,
        rows: u16,
        full_buffer: Option<Bytes>,
        requires_resync: bool,
    },
    BufferOverflow {
        new_start_seq: Seq,
        requires_resync: bool,
    },
    DimensionsConfirmed {
        cols: u16,
        rows: u16,
        adjusted: bool,
        reason: Option<String>,
    },
    DimensionsRejected {
        reason: String,
        suggested_cols: u16,
        suggested_rows: u16,
    },
    HeartbeatAck {
        nonce: u64,
        timestamp_ms: u64,
    },
    #[serde(other)]
    Unknown,
}

/// Client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SyncRequest {
        last_seq: Seq,
        cols: u16,
        rows: u16,
    },
    Ack {
        ack_seq: Seq,
    },
    RangeRequest {
        start_seq: Seq,
        end_seq: Seq,
    },
    NegotiateDimensions {
        cols: u16,
        rows: u16,
        confidence: Confidence,
        source: DimensionSource,
    },
    Heartbeat {
        nonce: u64,
        timestamp_ms: u64,
    },
    #[serde(other)]
    Unknown,
}

impl HostFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            HostFrame::Chunk { .. } => "chunk",
            HostFrame::ChunkBatch { .. } => "chunk_batch",
            HostFrame::SyncResponse { .. } => "sync_response",
            HostFrame::BufferOverflow { .. } => "buffer_overflow",
            HostFrame::DimensionsConfirmed { .. } => "dimensions_confirmed",
            HostFrame::DimensionsRejected { .. } => "dimensions_rejected",
            HostFrame::HeartbeatAck { .. } => "heartbeat_ack",
            HostFrame::Unknown => "unknown",
        }
    }
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::SyncRequest { .. } => "sync_request",
            ClientFrame::Ack { .. } => "ack",
            ClientFrame::RangeRequest { .. } => "range_request",
            ClientFrame::NegotiateDimensions { .. } => "negotiate_dimensions",
            ClientFrame::Heartbeat { .. } => "heartbeat",
            ClientFrame::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Json,
    Binary,
}

impl Encoding {
    pub fn from_env() -> Self {
        Self::from_flag(binary_protocol_enabled())
    }

    pub fn from_flag(binary: bool) -> Self {
        if binary {
            Encoding::Binary
        } else {
            Encoding::Json
        }
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("json frame error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame error: {0}")]
    Wire(#[from] WireError),
}

pub fn encode_host_frame(frame: &HostFrame, encoding: Encoding) -> Result<Payload, FrameError> {
    match encoding {
        Encoding::Json => Ok(Payload::Text(serde_json::to_string(frame)?)),
        Encoding::Binary => Ok(Payload::Binary(Bytes::from(
            wire::encode_host_frame_binary(frame)?,
        ))),
    }
}

/// Text payloads are JSON, binary payloads use the wire codec.
pub fn decode_host_frame(payload: &Payload) -> Result<HostFrame, FrameError> {
    match payload {
        Payload::Text(text) => Ok(serde_json::from_str(text)?),
        Payload::Binary(bytes) => Ok(wire::decode_host_frame_binary(bytes)?),
    }
}

pub fn encode_client_frame(frame: &ClientFrame, encoding: Encoding) -> Result<Payload, FrameError> {
    match encoding {
        Encoding::Json => Ok(Payload::Text(serde_json::to_string(frame)?)),
        Encoding::Binary => Ok(Payload::Binary(Bytes::from(
            wire::encode_client_frame_binary(frame),
        ))),
    }
}

pub fn decode_client_frame(payload: &Payload) -> Result<ClientFrame, FrameError> {
    match payload {
        Payload::Text(text) => Ok(serde_json::from_str(text)?),
        Payload::Binary(bytes) => Ok(wire::decode_client_frame_binary(bytes)?),
    }
}
