//! Receiving half of a transfer: in-order reassembly with strict checks.

use super::ProgressTracker;
use crate::core::config::MAX_REASSEMBLY_PREALLOC;
use crate::core::error::EngineError;
use crate::core::protocol::{FileMetadata, TransferId};
use crate::core::queue::ReceivedFile;
use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    AwaitingMetadata,
    Receiving,
    Verifying,
    Done,
    Failed,
}

pub struct ReceiverSession {
    transfer_id: TransferId,
    state: ReceiverState,
    metadata: Option<FileMetadata>,
    buffer: BytesMut,
    next_seq: u32,
    progress: ProgressTracker,
}

impl ReceiverSession {
    pub fn new(transfer_id: TransferId) -> Self {
        Self {
            transfer_id,
            state: ReceiverState::AwaitingMetadata,
            metadata: None,
            buffer: BytesMut::new(),
            next_seq: 0,
            progress: ProgressTracker::default(),
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.progress.value()
    }

    /// Bytes reassembled so far.
    pub fn received_len(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn expect(&self, state: ReceiverState, what: &str) -> Result<(), EngineError> {
        if self.state == state {
            Ok(())
        } else {
            Err(EngineError::UnexpectedFrame(format!(
                "{what} while {:?}",
                self.state
            )))
        }
    }

    pub fn on_metadata(&mut self, meta: FileMetadata) -> Result<(), EngineError> {
        if let Err(e) = self.expect(ReceiverState::AwaitingMetadata, "metadata") {
            return Err(self.fail(e));
        }
        if meta.transfer_id != self.transfer_id {
            return Err(self.fail(EngineError::UnexpectedFrame(format!(
                "metadata for {} routed to {}",
                meta.transfer_id, self.transfer_id
            ))));
        }
        // A peer may announce anything; only pre-allocate up to the cap.
        let prealloc = usize::try_from(meta.byte_length)
            .unwrap_or(usize::MAX)
            .min(MAX_REASSEMBLY_PREALLOC);
        self.buffer = BytesMut::with_capacity(prealloc);
        info!(
            event = "file_recv_start",
            transfer_id = %self.transfer_id,
            file_name = %meta.file_name,
            bytes = meta.byte_length,
            "Receiving file"
        );
        self.metadata = Some(meta);
        self.next_seq = 0;
        self.state = ReceiverState::Receiving;
        Ok(())
    }

    /// Append one chunk. Returns the updated progress.
    ///
    /// Nothing is appended when the chunk is rejected.
    pub fn on_data(&mut self, seq: u32, payload: Bytes) -> Result<f64, EngineError> {
        if let Err(e) = self.expect(ReceiverState::Receiving, "data") {
            return Err(self.fail(e));
        }
        if seq != self.next_seq {
            let expected = self.next_seq;
            return Err(self.fail(EngineError::SequenceViolation { expected, got: seq }));
        }
        let announced = self.announced_len();
        let after = self.buffer.len() as u64 + payload.len() as u64;
        if after > announced {
            return Err(self.fail(EngineError::LengthMismatch {
                expected: announced,
                actual: after,
            }));
        }

        self.buffer.extend_from_slice(&payload);
        self.next_seq = self.next_seq.wrapping_add(1);
        let progress = self.progress.update(after, announced);
        debug!(event = "chunk_received", transfer_id = %self.transfer_id, seq, bytes = payload.len());
        Ok(progress)
    }

    /// Verify the accumulated length and hand out the assembled file.
    pub fn on_complete(&mut self) -> Result<ReceivedFile, EngineError> {
        if let Err(e) = self.expect(ReceiverState::Receiving, "completion") {
            return Err(self.fail(e));
        }
        self.state = ReceiverState::Verifying;
        let announced = self.announced_len();
        let actual = self.buffer.len() as u64;
        if actual != announced {
            return Err(self.fail(EngineError::LengthMismatch {
                expected: announced,
                actual,
            }));
        }

        let meta = match self.metadata.take() {
            Some(meta) => meta,
            None => {
                return Err(self.fail(EngineError::InvalidState(
                    "receiving without metadata".into(),
                )))
            }
        };
        self.state = ReceiverState::Done;
        self.progress.finish();
        info!(
            event = "file_recv_complete",
            transfer_id = %self.transfer_id,
            file_name = %meta.file_name,
            bytes = actual,
            "File received"
        );
        Ok(ReceivedFile {
            transfer_id: self.transfer_id,
            file_name: meta.file_name,
            mime_type: meta.mime_type,
            data: self.buffer.split().freeze(),
        })
    }

    /// Move to `Failed` and release the reassembly buffer. Returns `err` for
    /// convenient propagation.
    pub fn fail(&mut self, err: EngineError) -> EngineError {
        if self.state != ReceiverState::Failed {
            warn!(
                event = "file_recv_failed",
                transfer_id = %self.transfer_id,
                received = self.buffer.len(),
                error = %err,
                "Receive failed"
            );
        }
        self.state = ReceiverState::Failed;
        self.buffer = BytesMut::new();
        err
    }

    fn announced_len(&self) -> u64 {
        self.metadata.as_ref().map_or(0, |m| m.byte_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn receiving(len: u64) -> ReceiverSession {
        let id = Uuid::new_v4();
        let mut r = ReceiverSession::new(id);
        r.on_metadata(FileMetadata {
            transfer_id: id,
            file_name: "notes.txt".into(),
            byte_length: len,
            mime_type: "text/plain".into(),
        })
        .unwrap();
        r
    }

    #[test]
    fn assembles_in_order() {
        let mut r = receiving(10);
        assert_eq!(r.on_data(0, Bytes::from_static(b"hello")).unwrap(), 0.5);
        let p = r.on_data(1, Bytes::from_static(b"world")).unwrap();
        assert!(p < 1.0 && p > 0.99);

        let file = r.on_complete().unwrap();
        assert_eq!(file.data, Bytes::from_static(b"helloworld"));
        assert_eq!(file.file_name, "notes.txt");
        assert_eq!(r.state(), ReceiverState::Done);
        assert_eq!(r.progress(), 1.0);
    }

    #[test]
    fn gap_fails_without_appending() {
        let mut r = receiving(10);
        r.on_data(0, Bytes::from_static(b"abc")).unwrap();
        assert_eq!(
            r.on_data(2, Bytes::from_static(b"def")),
            Err(EngineError::SequenceViolation { expected: 1, got: 2 })
        );
        assert_eq!(r.state(), ReceiverState::Failed);
        assert_eq!(r.received_len(), 0);
        assert!(r.on_data(1, Bytes::from_static(b"def")).is_err());
    }

    #[test]
    fn duplicate_sequence_is_a_violation() {
        let mut r = receiving(10);
        r.on_data(0, Bytes::from_static(b"abc")).unwrap();
        assert!(matches!(
            r.on_data(0, Bytes::from_static(b"abc")),
            Err(EngineError::SequenceViolation { expected: 1, got: 0 })
        ));
    }

    #[test]
    fn overflow_fails_immediately() {
        let mut r = receiving(4);
        assert_eq!(
            r.on_data(0, Bytes::from_static(b"12345")),
            Err(EngineError::LengthMismatch { expected: 4, actual: 5 })
        );
        assert_eq!(r.state(), ReceiverState::Failed);
    }

    #[test]
    fn short_file_fails_verification() {
        let mut r = receiving(10);
        r.on_data(0, Bytes::from_static(b"12345")).unwrap();
        assert_eq!(
            r.on_complete(),
            Err(EngineError::LengthMismatch { expected: 10, actual: 5 })
        );
        assert_eq!(r.state(), ReceiverState::Failed);
    }

    #[test]
    fn zero_length_file() {
        let mut r = receiving(0);
        assert_eq!(r.progress(), 0.0);
        let file = r.on_complete().unwrap();
        assert!(file.data.is_empty());
        assert_eq!(r.progress(), 1.0);
    }

    #[test]
    fn data_before_metadata_is_rejected() {
        let mut r = ReceiverSession::new(Uuid::new_v4());
        assert!(matches!(
            r.on_data(0, Bytes::from_static(b"x")),
            Err(EngineError::UnexpectedFrame(_))
        ));
    }

    #[test]
    fn huge_announcement_does_not_preallocate() {
        let r = receiving(u64::MAX);
        assert!(r.buffer.capacity() <= MAX_REASSEMBLY_PREALLOC);
    }
}
