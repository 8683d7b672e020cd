//! Centralized configuration for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format constants (frame kind bytes, header
//! widths) stay in the codec module.

use crate::core::error::EngineError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (48 KB).
///
/// Sized to fit within the 64 KB SCTP receive buffer used by webrtc-rs and
/// by browsers that do not advertise a larger `max-message-size`, with room
/// for the 21-byte Data frame header.
pub const CHUNK_SIZE: usize = 48 * 1024;

/// Largest chunk size a configuration may request. Anything above this would
/// not survive the default SCTP message limit once framed.
pub const MAX_CHUNK_SIZE: usize = 60 * 1024;

/// Sender read-ahead buffer: max chunks prefetched from the byte source and
/// queued for framing. Keeps the channel busy while the next chunk is read.
pub const SENDER_READ_AHEAD_CHUNKS: usize = 8;

/// Upper bound on the reassembly buffer allocated up front when a Metadata
/// frame arrives. Larger files grow the buffer as data arrives, so a peer
/// announcing a huge `byte_length` cannot force a huge allocation.
pub const MAX_REASSEMBLY_PREALLOC: usize = 64 * 1024 * 1024;

/// Progress reported before a transfer reaches `Done`. Exactly 1.0 is
/// reserved for completed transfers.
pub const MAX_PENDING_PROGRESS: f64 = 0.999;

/// Maximum encoded length of a file name in a Metadata frame (bytes).
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Maximum encoded length of a MIME type in a Metadata frame (bytes).
pub const MAX_MIME_LEN: usize = 127;

/// MIME type used when the stager does not know better.
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

// ── Flow control ─────────────────────────────────────────────────────────────

/// High water mark for the channel's outbound buffer (bytes).
/// When `buffered_amount` reaches this value, data frames are held back
/// until the buffer drains to the low water mark.
pub const DC_BUFFERED_AMOUNT_HIGH: usize = 4 * 1024 * 1024; // 4 MB

/// Low water mark for the channel's outbound buffer (bytes).
pub const DC_BUFFERED_AMOUNT_LOW: usize = 1024 * 1024; // 1 MB

/// How often a suspended sender re-checks the outbound buffer.
pub const FLOW_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ── Connection / Network ─────────────────────────────────────────────────────

/// Bound on the whole handshake (descriptor fetch + transport dial).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a sender waits for `Control{ack}` after `Control{complete}`.
pub const COMPLETION_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Explicit SCTP max message size advertised in the SDP (1 MiB).
/// Using a concrete value instead of Unbounded (0) because some WebRTC
/// implementations interpret 0 as "use default 64 KB".
pub const SCTP_MAX_MESSAGE_SIZE: u32 = 1024 * 1024;

/// Timeout waiting for the data channel to open.
pub const DATA_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for ICE candidate gathering.
pub const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(15);

/// Label of the single transfer data channel.
pub const DATA_CHANNEL_LABEL: &str = "dropwire";

// ── Runtime configuration ────────────────────────────────────────────────────

/// Tunables for one engine instance.
///
/// Every field has a default matching the constants above, so a TOML file
/// only needs to list the values it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum payload of one Data frame.
    pub chunk_size: usize,
    /// Outbound buffer level at which senders are suspended.
    pub high_water_mark: usize,
    /// Outbound buffer level at which suspended senders resume.
    pub low_water_mark: usize,
    pub handshake_timeout_ms: u64,
    pub completion_timeout_ms: u64,
    pub flow_poll_interval_ms: u64,
    pub read_ahead_chunks: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_mark: DC_BUFFERED_AMOUNT_HIGH,
            low_water_mark: DC_BUFFERED_AMOUNT_LOW,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT.as_millis() as u64,
            completion_timeout_ms: COMPLETION_ACK_TIMEOUT.as_millis() as u64,
            flow_poll_interval_ms: FLOW_POLL_INTERVAL.as_millis() as u64,
            read_ahead_chunks: SENDER_READ_AHEAD_CHUNKS,
        }
    }
}

impl EngineConfig {
    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(EngineError::Config(format!(
                "chunk_size must be in 1..={MAX_CHUNK_SIZE}, got {}",
                self.chunk_size
            )));
        }
        if self.low_water_mark >= self.high_water_mark {
            return Err(EngineError::Config(format!(
                "low_water_mark ({}) must be below high_water_mark ({})",
                self.low_water_mark, self.high_water_mark
            )));
        }
        if self.read_ahead_chunks == 0 {
            return Err(EngineError::Config("read_ahead_chunks must be at least 1".into()));
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn flow_poll_interval(&self) -> Duration {
        Duration::from_millis(self.flow_poll_interval_ms.max(1))
    }
}
