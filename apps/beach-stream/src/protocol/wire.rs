use bytes::Bytes;

use super::{ClientFrame, HostFrame, PROTOCOL_VERSION};
use crate::sync::{Confidence, DimensionSource};

const VERSION_BITS: u8 = 3;
const VERSION_MASK: u8 = 0b1110_0000;
const TYPE_MASK: u8 = 0b0001_1111;

const HOST_KIND_CHUNK: u8 = 0;
const HOST_KIND_CHUNK_BATCH: u8 = 1;
const HOST_KIND_SYNC_RESPONSE: u8 = 2;
const HOST_KIND_BUFFER_OVERFLOW: u8 = 3;
const HOST_KIND_DIMENSIONS_CONFIRMED: u8 = 4;
const HOST_KIND_DIMENSIONS_REJECTED: u8 = 5;
const HOST_KIND_HEARTBEAT_ACK: u8 = 6;
const HOST_KIND_UNKNOWN: u8 = TYPE_MASK;

const CLIENT_KIND_SYNC_REQUEST: u8 = 0;
const CLIENT_KIND_ACK: u8 = 1;
const CLIENT_KIND_RANGE_REQUEST: u8 = 2;
const CLIENT_KIND_NEGOTIATE_DIMENSIONS: u8 = 3;
const CLIENT_KIND_HEARTBEAT: u8 = 4;
const CLIENT_KIND_UNKNOWN: u8 = TYPE_MASK;

const ENV_BINARY_PROTOCOL: &str = "BEACH_PROTO_BINARY";

/// Returns `true` when frames should be sent with the binary codec instead of JSON.
pub fn binary_protocol_enabled() -> bool {
    std::env::var(ENV_BINARY_PROTOCOL)
        .map(|value| parse_flag(&value))
        .unwrap_or(false)
}

pub(crate) fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum WireError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("varint overflow")]
    VarIntOverflow,
    #[error("invalid data: {0}")]
    InvalidData(&'static str),
}

pub fn encode_host_frame_binary(frame: &HostFrame) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::with_capacity(32);
    match frame {
        HostFrame::Chunk {
            seq,
            bytes,
            timestamp,
        } => {
            buf.reserve(bytes.len());
            write_header(&mut buf, HOST_KIND_CHUNK);
            write_var_u64(&mut buf, *seq);
            write_var_u64(&mut buf, *timestamp);
            write_bytes(&mut buf, bytes);
        }
        HostFrame::ChunkBatch {
            start_seq,
            bytes,
            chunk_count,
            chunk_lens,
            is_complete,
        } => {
            buf.reserve(bytes.len() + chunk_lens.len() * 2);
            write_header(&mut buf, HOST_KIND_CHUNK_BATCH);
            write_var_u64(&mut buf, *start_seq);
            write_var_u32(&mut buf, *chunk_count);
            let table = u32::try_from(chunk_lens.len())
                .map_err(|_| WireError::InvalidData("chunk length table too long"))?;
            write_var_u32(&mut buf, table);
            for len in chunk_lens {
                write_var_u32(&mut buf, *len);
            }
            buf.push(*is_complete as u8);
            write_bytes(&mut buf, bytes);
        }
        HostFrame::SyncResponse {
            buffer_start_seq,
            buffer_end_seq,
            cols,
            rows,
            full_buffer,
            requires_resync,
        } => {
            write_header(&mut buf, HOST_KIND_SYNC_RESPONSE);
            write_var_u64(&mut buf, *buffer_start_seq);
            write_var_u64(&mut buf, *buffer_end_seq);
            write_var_u32(&mut buf, u32::from(*cols));
            write_var_u32(&mut buf, u32::from(*rows));
            buf.push(*requires_resync as u8);
            buf.push(full_buffer.is_some() as u8);
            if let Some(snapshot) = full_buffer {
                write_bytes(&mut buf, snapshot);
            }
        }
        HostFrame::BufferOverflow {
            new_start_seq,
            requires_resync,
        } => {
            write_header(&mut buf, HOST_KIND_BUFFER_OVERFLOW);
            write_var_u64(&mut buf, *new_start_seq);
            buf.push(*requires_resync as u8);
        }
        HostFrame::DimensionsConfirmed {
            cols,
            rows,
            adjusted,
            reason,
        } => {
            write_header(&mut buf, HOST_KIND_DIMENSIONS_CONFIRMED);
            write_var_u32(&mut buf, u32::from(*cols));
            write_var_u32(&mut buf, u32::from(*rows));
            buf.push(*adjusted as u8);
            buf.push(reason.is_some() as u8);
            if let Some(reason) = reason {
                write_string(&mut buf, reason);
            }
        }
        HostFrame::DimensionsRejected {
            reason,
            suggested_cols,
            suggested_rows,
        } => {
            write_header(&mut buf, HOST_KIND_DIMENSIONS_REJECTED);
            write_string(&mut buf, reason);
            write_var_u32(&mut buf, u32::from(*suggested_cols));
            write_var_u32(&mut buf, u32::from(*suggested_rows));
        }
        HostFrame::HeartbeatAck {
            nonce,
            timestamp_ms,
        } => {
            write_header(&mut buf, HOST_KIND_HEARTBEAT_ACK);
            write_var_u64(&mut buf, *nonce);
            write_var_u64(&mut buf, *timestamp_ms);
        }
        HostFrame::Unknown => write_header(&mut buf, HOST_KIND_UNKNOWN),
    }
    Ok(buf)
}

pub fn decode_host_frame_binary(bytes: &[u8]) -> Result<HostFrame, WireError> {
    let mut cursor = Cursor::new(bytes);
    let (kind, _) = read_header(&mut cursor)?;
    let frame = match kind {
        HOST_KIND_CHUNK => {
            let seq = cursor.read_var_u64()?;
            let timestamp = cursor.read_var_u64()?;
            let bytes = cursor.read_len_prefixed()?;
            HostFrame::Chunk {
                seq,
                bytes: Bytes::copy_from_slice(bytes),
                timestamp,
            }
        }
        HOST_KIND_CHUNK_BATCH => {
            let start_seq = cursor.read_var_u64()?;
            let chunk_count = cursor.read_var_u32()?;
            let lens = cursor.read_var_u32()? as usize;
            if lens > cursor.remaining() {
                return Err(WireError::InvalidData("chunk length table too long"));
            }
            let mut chunk_lens = Vec::with_capacity(lens);
            for _ in 0..lens {
                chunk_lens.push(cursor.read_var_u32()?);
            }
            let is_complete = cursor.read_bool()?;
            let bytes = cursor.read_len_prefixed()?;
            HostFrame::ChunkBatch {
                start_seq,
                bytes: Bytes::copy_from_slice(bytes),
                chunk_count,
                chunk_lens,
                is_complete,
            }
        }
        HOST_KIND_SYNC_RESPONSE => {
            let buffer_start_seq = cursor.read_var_u64()?;
            let buffer_end_seq = cursor.read_var_u64()?;
            let cols = cursor.read_var_u16()?;
            let rows = cursor.read_var_u16()?;
            let requires_resync = cursor.read_bool()?;
            let full_buffer = if cursor.read_bool()? {
                Some(Bytes::copy_from_slice(cursor.read_len_prefixed()?))
            } else {
                None
            };
            HostFrame::SyncResponse {
                buffer_start_seq,
                buffer_end_seq,
                cols,
                rows,
                full_buffer,
                requires_resync,
            }
        }
        HOST_KIND_BUFFER_OVERFLOW => {
            let new_start_seq = cursor.read_var_u64()?;
            let requires_resync = cursor.read_bool()?;
            HostFrame::BufferOverflow {
                new_start_seq,
                requires_resync,
            }
        }
        HOST_KIND_DIMENSIONS_CONFIRMED => {
            let cols = cursor.read_var_u16()?;
            let rows = cursor.read_var_u16()?;
            let adjusted = cursor.read_bool()?;
            let reason = if cursor.read_bool()? {
                Some(cursor.read_string()?)
            } else {
                None
            };
            HostFrame::DimensionsConfirmed {
                cols,
                rows,
                adjusted,
                reason,
            }
        }
        HOST_KIND_DIMENSIONS_REJECTED => {
            let reason = cursor.read_string()?;
            let suggested_cols = cursor.read_var_u16()?;
            let suggested_rows = cursor.read_var_u16()?;
            HostFrame::DimensionsRejected {
                reason,
                suggested_cols,
                suggested_rows,
            }
        }
        HOST_KIND_HEARTBEAT_ACK => {
            let nonce = cursor.read_var_u64()?;
            let timestamp_ms = cursor.read_var_u64()?;
            HostFrame::HeartbeatAck {
                nonce,
                timestamp_ms,
            }
        }
        HOST_KIND_UNKNOWN => HostFrame::Unknown,
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(frame)
}

pub fn encode_client_frame_binary(frame: &ClientFrame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    match frame {
        ClientFrame::SyncRequest {
            last_seq,
            cols,
            rows,
        } => {
            write_header(&mut buf, CLIENT_KIND_SYNC_REQUEST);
            write_var_u64(&mut buf, *last_seq);
            write_var_u32(&mut buf, u32::from(*cols));
            write_var_u32(&mut buf, u32::from(*rows));
        }
        ClientFrame::Ack { ack_seq } => {
            write_header(&mut buf, CLIENT_KIND_ACK);
            write_var_u64(&mut buf, *ack_seq);
        }
        ClientFrame::RangeRequest { start_seq, end_seq } => {
            write_header(&mut buf, CLIENT_KIND_RANGE_REQUEST);
            write_var_u64(&mut buf, *start_seq);
            write_var_u64(&mut buf, *end_seq);
        }
        ClientFrame::NegotiateDimensions {
            cols,
            rows,
            confidence,
            source,
        } => {
            write_header(&mut buf, CLIENT_KIND_NEGOTIATE_DIMENSIONS);
            write_var_u32(&mut buf, u32::from(*cols));
            write_var_u32(&mut buf, u32::from(*rows));
            buf.push(confidence_to_u8(*confidence));
            buf.push(source_to_u8(*source));
        }
        ClientFrame::Heartbeat {
            nonce,
            timestamp_ms,
        } => {
            write_header(&mut buf, CLIENT_KIND_HEARTBEAT);
            write_var_u64(&mut buf, *nonce);
            write_var_u64(&mut buf, *timestamp_ms);
        }
        ClientFrame::Unknown => write_header(&mut buf, CLIENT_KIND_UNKNOWN),
    }
    buf
}

pub fn decode_client_frame_binary(bytes: &[u8]) -> Result<ClientFrame, WireError> {
    let mut cursor = Cursor::new(bytes);
    let (kind, _) = read_header(&mut cursor)?;
    let frame = match kind {
        CLIENT_KIND_SYNC_REQUEST => {
            let last_seq = cursor.read_var_u64()?;
            let cols = cursor.read_var_u16()?;
            let rows = cursor.read_var_u16()?;
            ClientFrame::SyncRequest {
                last_seq,
                cols,
                rows,
            }
        }
        CLIENT_KIND_ACK => ClientFrame::Ack {
            ack_seq: cursor.read_var_u64()?,
        },
        CLIENT_KIND_RANGE_REQUEST => {
            let start_seq = cursor.read_var_u64()?;
            let end_seq = cursor.read_var_u64()?;
            ClientFrame::RangeRequest { start_seq, end_seq }
        }
        CLIENT_KIND_NEGOTIATE_DIMENSIONS => {
            let cols = cursor.read_var_u16()?;
            let rows = cursor.read_var_u16()?;
            let confidence = confidence_from_u8(cursor.read_u8()?)?;
            let source = source_from_u8(cursor.read_u8()?)?;
            ClientFrame::NegotiateDimensions {
                cols,
                rows,
                confidence,
                source,
            }
        }
        CLIENT_KIND_HEARTBEAT => {
            let nonce = cursor.read_var_u64()?;
            let timestamp_ms = cursor.read_var_u64()?;
            ClientFrame::Heartbeat {
                nonce,
                timestamp_ms,
            }
        }
        // Newer peers may append fields to frames we do not know.
        CLIENT_KIND_UNKNOWN => return Ok(ClientFrame::Unknown),
        other => return Err(WireError::UnknownFrameType(other)),
    };
    cursor.finish()?;
    Ok(frame)
}

fn confidence_to_u8(confidence: Confidence) -> u8 {
    match confidence {
        Confidence::High => 0,
        Confidence::Medium => 1,
        Confidence::Low => 2,
    }
}

fn confidence_from_u8(value: u8) -> Result<Confidence, WireError> {
    match value {
        0 => Ok(Confidence::High),
        1 => Ok(Confidence::Medium),
        2 => Ok(Confidence::Low),
        _ => Err(WireError::InvalidData("invalid confidence")),
    }
}

fn source_to_u8(source: DimensionSource) -> u8 {
    match source {
        DimensionSource::Measured => 0,
        DimensionSource::Estimated => 1,
        DimensionSource::Restored => 2,
        DimensionSource::Default => 3,
    }
}

fn source_from_u8(value: u8) -> Result<DimensionSource, WireError> {
    match value {
        0 => Ok(DimensionSource::Measured),
        1 => Ok(DimensionSource::Estimated),
        2 => Ok(DimensionSource::Restored),
        3 => Ok(DimensionSource::Default),
        _ => Err(WireError::InvalidData("invalid dimension source")),
    }
}

fn write_header(buf: &mut Vec<u8>, kind: u8) {
    let version = PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1);
    buf.push((version << 5) | (kind & TYPE_MASK));
}

fn read_header(cursor: &mut Cursor<'_>) -> Result<(u8, u8), WireError> {
    let byte = cursor.read_u8()?;
    let version = (byte & VERSION_MASK) >> 5;
    let kind = byte & TYPE_MASK;
    if version != (PROTOCOL_VERSION & ((1 << VERSION_BITS) - 1)) {
        return Err(WireError::InvalidVersion(version));
    }
    Ok((kind, version))
}

fn write_var_u32(buf: &mut Vec<u8>, value: u32) {
    write_var_u64(buf, value as u64);
}

fn write_var_u64(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_var_u64(buf, bytes.len() as u64);
    buf.extend_from_slice(bytes);
}

fn write_string(buf: &mut Vec<u8>, value: &str) {
    write_bytes(buf, value.as_bytes());
}

#[derive(Clone, Copy)]
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let Some(value) = self.bytes.get(self.pos).copied() else {
            return Err(WireError::UnexpectedEof);
        };
        self.pos += 1;
        Ok(value)
    }

    fn read_var_u64(&mut self) -> Result<u64, WireError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        while shift < 64 {
            let byte = self.read_u8()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(WireError::VarIntOverflow)
    }

    fn read_var_u32(&mut self) -> Result<u32, WireError> {
        let value = self.read_var_u64()?;
        u32::try_from(value).map_err(|_| WireError::InvalidData("u32 overflow"))
    }

    fn read_var_u16(&mut self) -> Result<u16, WireError> {
        let value = self.read_var_u64()?;
        u16::try_from(value).map_err(|_| WireError::InvalidData("u16 overflow"))
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(WireError::InvalidData("invalid boolean")),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if len > self.remaining() {
            return Err(WireError::UnexpectedEof);
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_len_prefixed(&mut self) -> Result<&'a [u8], WireError> {
        let len = usize::try_from(self.read_var_u64()?)
            .map_err(|_| WireError::InvalidData("length overflow"))?;
        self.read_bytes(len)
    }

    fn read_string(&mut self) -> Result<String, WireError> {
        let raw = self.read_len_prefixed()?;
        std::str::from_utf8(raw)
            .map(str::to_owned)
            .map_err(|_| WireError::InvalidData("invalid utf-8"))
    }

    fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    fn finish(&self) -> Result<(), WireError> {
        if self.remaining() != 0 {
            return Err(WireError::InvalidData("trailing bytes"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn chunk_batch_keeps_length_table() {
        let frame = HostFrame::ChunkBatch {
            start_seq: 300,
            bytes: Bytes::from_static(b"abcdef"),
            chunk_count: 3,
            chunk_lens: vec![1, 2, 3],
            is_complete: false,
        };
        let encoded = encode_host_frame_binary(&frame).expect("encode");
        assert_eq!(encoded[0] >> 5, PROTOCOL_VERSION);
        assert_eq!(decode_host_frame_binary(&encoded).unwrap(), frame);
    }

    #[test_timeout::timeout]
    fn sync_response_with_and_without_snapshot() {
        for full_buffer in [None, Some(Bytes::from_static(b"\x1b[2Jhello"))] {
            let frame = HostFrame::SyncResponse {
                buffer_start_seq: 2,
                buffer_end_seq: 7,
                cols: 132,
                rows: 43,
                requires_resync: full_buffer.is_some(),
                full_buffer,
            };
            let encoded = encode_host_frame_binary(&frame).expect("encode");
            assert_eq!(decode_host_frame_binary(&encoded).unwrap(), frame);
        }
    }

    #[test_timeout::timeout]
    fn client_frames_survive_binary_codec() {
        let frames = [
            ClientFrame::SyncRequest {
                last_seq: u64::MAX >> 1,
                cols: 80,
                rows: 24,
            },
            ClientFrame::Ack { ack_seq: 129 },
            ClientFrame::RangeRequest {
                start_seq: 3,
                end_seq: 6,
            },
            ClientFrame::NegotiateDimensions {
                cols: 100,
                rows: 30,
                confidence: Confidence::Low,
                source: DimensionSource::Restored,
            },
            ClientFrame::Heartbeat {
                nonce: 9,
                timestamp_ms: 1_700_000_000_000,
            },
        ];
        for frame in frames {
            let encoded = encode_client_frame_binary(&frame);
            assert_eq!(decode_client_frame_binary(&encoded).unwrap(), frame);
        }
    }

    #[test_timeout::timeout]
    fn malformed_input_is_rejected() {
        assert_eq!(
            decode_host_frame_binary(&[]),
            Err(WireError::UnexpectedEof)
        );
        assert_eq!(
            decode_host_frame_binary(&[0b0100_0000]),
            Err(WireError::InvalidVersion(2))
        );
        let mut chunk = encode_host_frame_binary(&HostFrame::Chunk {
            seq: 1,
            bytes: Bytes::from_static(b"xyz"),
            timestamp: 5,
        })
        .expect("encode");
        chunk.truncate(chunk.len() - 1);
        assert_eq!(
            decode_host_frame_binary(&chunk),
            Err(WireError::UnexpectedEof)
        );
        let mut ack = encode_client_frame_binary(&ClientFrame::Ack { ack_seq: 1 });
        ack.push(0);
        assert_eq!(
            decode_client_frame_binary(&ack),
            Err(WireError::InvalidData("trailing bytes"))
        );
    }

    #[test_timeout::timeout]
    fn env_toggle_respects_flag() {
        assert!(parse_flag("true"));
        assert!(parse_flag("YES"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
