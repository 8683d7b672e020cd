//! Transfer bookkeeping: staged outbound files, active and completed
//! transfers, and files received but not yet collected.
//!
//! The queue only records outcomes. Sessions decide them; the engine
//! reports them here.

use crate::core::error::EngineError;
use crate::core::pipeline::StagedFile;
use crate::core::protocol::{FileMetadata, TransferId};
use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Queued,
    Transferring,
    Done,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Done | TransferStatus::Failed)
    }
}

/// Read model of one transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileTransfer {
    pub id: TransferId,
    pub file_name: String,
    pub byte_length: u64,
    pub mime_type: String,
    pub direction: Direction,
    pub status: TransferStatus,
    /// In `[0, 1]`; exactly 1.0 only when `Done`.
    pub progress: f64,
    pub error: Option<String>,
}

/// A fully received and verified file, waiting to be collected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub mime_type: String,
    pub data: Bytes,
}

#[derive(Default)]
pub struct TransferQueue {
    /// Outbound files in selection order, with their byte sources.
    staged: Vec<(FileTransfer, StagedFile)>,
    active: Vec<FileTransfer>,
    completed: Vec<FileTransfer>,
    received: Vec<ReceivedFile>,
}

impl TransferQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a file for sending. Nothing is transmitted.
    pub fn stage(&mut self, file: StagedFile) -> FileTransfer {
        let transfer = FileTransfer {
            id: Uuid::new_v4(),
            file_name: file.file_name.clone(),
            byte_length: file.byte_length(),
            mime_type: file.mime_type.clone(),
            direction: Direction::Send,
            status: TransferStatus::Queued,
            progress: 0.0,
            error: None,
        };
        self.staged.push((transfer.clone(), file));
        transfer
    }

    /// Move one staged file to the active set.
    pub fn take_queued(&mut self, id: TransferId) -> Result<(FileTransfer, StagedFile), EngineError> {
        let pos = self
            .staged
            .iter()
            .position(|(t, _)| t.id == id)
            .ok_or(EngineError::UnknownTransfer(id))?;
        let (transfer, file) = self.staged.remove(pos);
        Ok((self.activate(transfer), file))
    }

    /// Move every staged file to the active set, in selection order.
    pub fn take_all_queued(&mut self) -> Vec<(FileTransfer, StagedFile)> {
        let staged = std::mem::take(&mut self.staged);
        staged
            .into_iter()
            .map(|(transfer, file)| (self.activate(transfer), file))
            .collect()
    }

    fn activate(&mut self, mut transfer: FileTransfer) -> FileTransfer {
        transfer.status = TransferStatus::Transferring;
        self.active.push(transfer.clone());
        transfer
    }

    /// Drop a file that was staged but never started. It is recorded as
    /// failed so the user sees what happened to it.
    pub fn unstage(&mut self, id: TransferId, reason: &EngineError) -> Option<FileTransfer> {
        let pos = self.staged.iter().position(|(t, _)| t.id == id)?;
        let (mut transfer, _file) = self.staged.remove(pos);
        transfer.status = TransferStatus::Failed;
        transfer.error = Some(reason.to_string());
        self.completed.push(transfer.clone());
        Some(transfer)
    }

    /// Create the receive-side entry for an announced file.
    pub fn open_inbound(&mut self, meta: &FileMetadata) -> FileTransfer {
        self.activate(FileTransfer {
            id: meta.transfer_id,
            file_name: meta.file_name.clone(),
            byte_length: meta.byte_length,
            mime_type: meta.mime_type.clone(),
            direction: Direction::Receive,
            status: TransferStatus::Queued,
            progress: 0.0,
            error: None,
        })
    }

    /// Record progress. Never moves backwards.
    pub fn update_progress(&mut self, id: TransferId, progress: f64) -> Option<FileTransfer> {
        let transfer = self.active.iter_mut().find(|t| t.id == id)?;
        if progress > transfer.progress {
            transfer.progress = progress;
        }
        Some(transfer.clone())
    }

    /// Move an active transfer to the completed list. The first outcome
    /// wins; later calls for the same id return `None`.
    pub fn finish(&mut self, id: TransferId, outcome: &Result<(), EngineError>) -> Option<FileTransfer> {
        let pos = self.active.iter().position(|t| t.id == id)?;
        let mut transfer = self.active.remove(pos);
        match outcome {
            Ok(()) => {
                transfer.status = TransferStatus::Done;
                transfer.progress = 1.0;
            }
            Err(e) => {
                transfer.status = TransferStatus::Failed;
                transfer.error = Some(e.to_string());
            }
        }
        self.completed.push(transfer.clone());
        Some(transfer)
    }

    pub fn push_received(&mut self, file: ReceivedFile) {
        self.received.push(file);
    }

    /// Hand over every received file collected so far.
    pub fn take_received(&mut self) -> Vec<ReceivedFile> {
        std::mem::take(&mut self.received)
    }

    pub fn is_completed(&self, id: TransferId) -> bool {
        self.completed.iter().any(|t| t.id == id)
    }

    pub fn get(&self, id: TransferId) -> Option<FileTransfer> {
        self.snapshot().into_iter().find(|t| t.id == id)
    }

    /// Staged, then active, then completed transfers.
    pub fn snapshot(&self) -> Vec<FileTransfer> {
        self.staged
            .iter()
            .map(|(t, _)| t.clone())
            .chain(self.active.iter().cloned())
            .chain(self.completed.iter().cloned())
            .collect()
    }

    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn staged(name: &str, len: usize) -> StagedFile {
        StagedFile::from_bytes(name, None, vec![0u8; len])
    }

    #[test]
    fn stage_keeps_selection_order() {
        let mut q = TransferQueue::new();
        let a = q.stage(staged("a.txt", 1));
        let b = q.stage(staged("b.txt", 2));
        assert_eq!(a.status, TransferStatus::Queued);
        assert_eq!(b.byte_length, 2);
        assert_eq!(b.mime_type, "application/octet-stream");

        let taken = q.take_all_queued();
        let names: Vec<_> = taken.iter().map(|(t, _)| t.file_name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert!(taken.iter().all(|(t, _)| t.status == TransferStatus::Transferring));
        assert_eq!(q.staged_count(), 0);
        assert_eq!(q.active_count(), 2);
    }

    #[test]
    fn take_unknown_is_rejected() {
        let mut q = TransferQueue::new();
        let id = Uuid::new_v4();
        assert!(matches!(q.take_queued(id), Err(EngineError::UnknownTransfer(x)) if x == id));
    }

    #[test]
    fn progress_is_monotone_and_first_outcome_wins() {
        let mut q = TransferQueue::new();
        let t = q.stage(staged("f", 10));
        q.take_queued(t.id).unwrap();

        assert_eq!(q.update_progress(t.id, 0.5).unwrap().progress, 0.5);
        assert_eq!(q.update_progress(t.id, 0.3).unwrap().progress, 0.5);

        let done = q.finish(t.id, &Ok(())).unwrap();
        assert_eq!(done.status, TransferStatus::Done);
        assert_eq!(done.progress, 1.0);
        assert!(q.finish(t.id, &Err(EngineError::CompletionTimeout)).is_none());
        assert!(q.update_progress(t.id, 0.7).is_none());
        assert_eq!(q.get(t.id).unwrap().status, TransferStatus::Done);
        assert!(q.is_completed(t.id));
    }

    #[test]
    fn failures_keep_their_cause() {
        let mut q = TransferQueue::new();
        let meta = FileMetadata {
            transfer_id: Uuid::new_v4(),
            file_name: "in.bin".into(),
            byte_length: 4,
            mime_type: "application/octet-stream".into(),
        };
        let t = q.open_inbound(&meta);
        assert_eq!(t.direction, Direction::Receive);
        assert_eq!(t.status, TransferStatus::Transferring);

        let failed = q
            .finish(meta.transfer_id, &Err(EngineError::SequenceViolation { expected: 1, got: 2 }))
            .unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert!(failed.error.unwrap().contains("expected 1"));
        assert!(failed.progress < 1.0);
    }

    #[test]
    fn unstage_records_failure() {
        let mut q = TransferQueue::new();
        let t = q.stage(staged("x", 3));
        let removed = q.unstage(t.id, &EngineError::Aborted("cancelled".into())).unwrap();
        assert_eq!(removed.status, TransferStatus::Failed);
        assert_eq!(q.staged_count(), 0);
        assert!(q.unstage(t.id, &EngineError::Aborted("again".into())).is_none());
    }

    #[test]
    fn received_files_are_taken_once() {
        let mut q = TransferQueue::new();
        q.push_received(ReceivedFile {
            transfer_id: Uuid::new_v4(),
            file_name: "r".into(),
            mime_type: "text/plain".into(),
            data: Bytes::from_static(b"hello"),
        });
        assert_eq!(q.take_received().len(), 1);
        assert!(q.take_received().is_empty());
    }
}
