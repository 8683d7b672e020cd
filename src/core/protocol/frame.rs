//! Chunk codec: binary frame encoding/decoding.
//!
//! Every message on the channel is exactly one frame:
//!
//!   [1 byte: kind] [16 bytes: transfer_id] [kind-specific body]
//!
//! Kinds:
//!   0x01 = Metadata (body: u64 byte_length, u16 name_len, name, u16 mime_len, mime)
//!   0x02 = Data     (body: u32 seq, raw payload up to the end of the message)
//!   0x03 = Control  (body: 1 byte: 0x01 complete, 0x02 abort, 0x03 ack)
//!
//! Integers are big-endian, strings UTF-8. The kind, the transfer id and the
//! Data sequence number sit at fixed offsets, so a frame can be routed from
//! its first [`DATA_HEADER_LEN`] bytes without looking at the body.
//! Message boundaries come from the channel; frames carry no length prefix.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::core::config::{MAX_FILE_NAME_LEN, MAX_MIME_LEN};
use crate::core::error::EngineError;

// ── Constants ────────────────────────────────────────────────────────────────

pub const FRAME_METADATA: u8 = 0x01;
pub const FRAME_DATA: u8 = 0x02;
pub const FRAME_CONTROL: u8 = 0x03;

const CONTROL_COMPLETE: u8 = 0x01;
const CONTROL_ABORT: u8 = 0x02;
const CONTROL_ACK: u8 = 0x03;

pub const TRANSFER_ID_LEN: usize = 16;
/// kind + transfer id.
pub const HEADER_LEN: usize = 1 + TRANSFER_ID_LEN;
/// kind + transfer id + sequence number.
pub const DATA_HEADER_LEN: usize = HEADER_LEN + 4;

/// Identifies one file transfer on both peers. Assigned by the sender.
pub type TransferId = Uuid;

// ── Frame types ──────────────────────────────────────────────────────────────

/// Announces a file before any of its data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub byte_length: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Sender has emitted every Data frame.
    Complete,
    /// Either side gives up on the transfer. Never acknowledged.
    Abort,
    /// Receiver verified and assembled the file.
    Ack,
}

impl ControlKind {
    fn to_byte(self) -> u8 {
        match self {
            ControlKind::Complete => CONTROL_COMPLETE,
            ControlKind::Abort => CONTROL_ABORT,
            ControlKind::Ack => CONTROL_ACK,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            CONTROL_COMPLETE => Some(ControlKind::Complete),
            CONTROL_ABORT => Some(ControlKind::Abort),
            CONTROL_ACK => Some(ControlKind::Ack),
            _ => None,
        }
    }
}

/// One protocol unit exchanged over the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Metadata(FileMetadata),
    Data {
        transfer_id: TransferId,
        seq: u32,
        payload: Bytes,
    },
    Control {
        transfer_id: TransferId,
        kind: ControlKind,
    },
}

impl Frame {
    pub fn transfer_id(&self) -> TransferId {
        match self {
            Frame::Metadata(meta) => meta.transfer_id,
            Frame::Data { transfer_id, .. } | Frame::Control { transfer_id, .. } => *transfer_id,
        }
    }

    pub fn control(transfer_id: TransferId, kind: ControlKind) -> Self {
        Frame::Control { transfer_id, kind }
    }

    /// Encoded size in bytes.
    pub fn wire_len(&self) -> usize {
        match self {
            Frame::Metadata(meta) => {
                HEADER_LEN
                    + 8
                    + 2
                    + truncated(&meta.file_name, MAX_FILE_NAME_LEN).len()
                    + 2
                    + truncated(&meta.mime_type, MAX_MIME_LEN).len()
            }
            Frame::Data { payload, .. } => DATA_HEADER_LEN + payload.len(),
            Frame::Control { .. } => HEADER_LEN + 1,
        }
    }
}

/// Fixed-position header fields, readable without decoding the body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: u8,
    pub transfer_id: TransferId,
    /// Present for Data frames only.
    pub seq: Option<u32>,
}

impl FrameHeader {
    /// Parse the routing header of an encoded frame.
    pub fn parse(data: &[u8]) -> Result<Self, EngineError> {
        if data.len() < HEADER_LEN {
            return Err(EngineError::MalformedFrame(format!(
                "frame too short: {} bytes",
                data.len()
            )));
        }
        let kind = data[0];
        let transfer_id = Uuid::from_slice(&data[1..HEADER_LEN])
            .map_err(|e| EngineError::MalformedFrame(format!("bad transfer id: {e}")))?;

        let seq = match kind {
            FRAME_METADATA | FRAME_CONTROL => None,
            FRAME_DATA => {
                if data.len() < DATA_HEADER_LEN {
                    return Err(EngineError::MalformedFrame(
                        "data frame truncated before sequence number".into(),
                    ));
                }
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[HEADER_LEN..DATA_HEADER_LEN]);
                Some(u32::from_be_bytes(raw))
            }
            other => {
                return Err(EngineError::MalformedFrame(format!(
                    "unknown frame kind 0x{other:02x}"
                )))
            }
        };

        Ok(Self {
            kind,
            transfer_id,
            seq,
        })
    }
}

/// Transfer id of a message that may not decode as a whole frame.
pub fn peek_transfer_id(data: &[u8]) -> Option<TransferId> {
    data.get(1..HEADER_LEN)
        .and_then(|raw| Uuid::from_slice(raw).ok())
}

// ── Encoding ─────────────────────────────────────────────────────────────────

/// Encode a frame into a single channel message.
///
/// File names and MIME types longer than their caps are cut at a UTF-8
/// character boundary.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::with_capacity(frame.wire_len());
    match frame {
        Frame::Metadata(meta) => {
            buf.put_u8(FRAME_METADATA);
            buf.extend_from_slice(meta.transfer_id.as_bytes());
            buf.put_u64(meta.byte_length);
            put_str(&mut buf, truncated(&meta.file_name, MAX_FILE_NAME_LEN));
            put_str(&mut buf, truncated(&meta.mime_type, MAX_MIME_LEN));
        }
        Frame::Data {
            transfer_id,
            seq,
            payload,
        } => {
            buf.put_u8(FRAME_DATA);
            buf.extend_from_slice(transfer_id.as_bytes());
            buf.put_u32(*seq);
            buf.extend_from_slice(payload);
        }
        Frame::Control { transfer_id, kind } => {
            buf.put_u8(FRAME_CONTROL);
            buf.extend_from_slice(transfer_id.as_bytes());
            buf.put_u8(kind.to_byte());
        }
    }
    buf.freeze()
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

fn truncated(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Decoding ─────────────────────────────────────────────────────────────────

/// Decode one channel message. Data payloads share the input buffer.
pub fn decode(mut data: Bytes) -> Result<Frame, EngineError> {
    let header = FrameHeader::parse(&data)?;
    let transfer_id = header.transfer_id;
    data.advance(HEADER_LEN);

    match header.kind {
        FRAME_DATA => {
            let seq = data.get_u32();
            Ok(Frame::Data {
                transfer_id,
                seq,
                payload: data,
            })
        }
        FRAME_CONTROL => {
            if data.len() != 1 {
                return Err(EngineError::MalformedFrame(format!(
                    "control body must be 1 byte, got {}",
                    data.len()
                )));
            }
            let raw = data.get_u8();
            let kind = ControlKind::from_byte(raw).ok_or_else(|| {
                EngineError::MalformedFrame(format!("unknown control kind 0x{raw:02x}"))
            })?;
            Ok(Frame::Control { transfer_id, kind })
        }
        // FrameHeader::parse rejects every other kind.
        _ => {
            let byte_length = take_u64(&mut data, "byte_length")?;
            let file_name = take_str(&mut data, "file_name")?;
            let mime_type = take_str(&mut data, "mime_type")?;
            if data.has_remaining() {
                return Err(EngineError::MalformedFrame(format!(
                    "{} trailing bytes after metadata",
                    data.remaining()
                )));
            }
            Ok(Frame::Metadata(FileMetadata {
                transfer_id,
                file_name,
                byte_length,
                mime_type,
            }))
        }
    }
}

fn take_u64(body: &mut Bytes, field: &str) -> Result<u64, EngineError> {
    if body.remaining() < 8 {
        return Err(EngineError::MalformedFrame(format!("metadata truncated at {field}")));
    }
    Ok(body.get_u64())
}

fn take_str(body: &mut Bytes, field: &str) -> Result<String, EngineError> {
    if body.remaining() < 2 {
        return Err(EngineError::MalformedFrame(format!(
            "metadata truncated at {field} length"
        )));
    }
    let len = body.get_u16() as usize;
    if body.remaining() < len {
        return Err(EngineError::MalformedFrame(format!("metadata truncated in {field}")));
    }
    let raw = body.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| EngineError::MalformedFrame(format!("{field} is not valid UTF-8")))
}

// ── Tests ────────────────────────────────────────────────────────────────────
