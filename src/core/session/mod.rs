//! Per-file transfer sessions.
//!
//! A session is either the sending or the receiving half of one transfer.
//! The receiver is a synchronous state machine fed by the engine's frame
//! router; the sender runs as its own task and is steered through
//! [`SenderSignal`]s.

pub mod receiver;
pub mod sender;

pub use receiver::ReceiverSession;
pub use sender::{SenderSession, SenderSignal};

use crate::core::config::MAX_PENDING_PROGRESS;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Engine-side view of a sender running in its own task.
pub struct SenderHandle {
    pub signals: mpsc::UnboundedSender<SenderSignal>,
    pub task: Option<JoinHandle<()>>,
}

/// A live session, tagged by role.
pub enum TransferSession {
    Sender(SenderHandle),
    Receiver(ReceiverSession),
}

impl TransferSession {
    pub fn role(&self) -> Role {
        match self {
            TransferSession::Sender(_) => Role::Sender,
            TransferSession::Receiver(_) => Role::Receiver,
        }
    }
}

/// Progress of one transfer: non-decreasing, below 1.0 until finished.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressTracker {
    value: f64,
}

impl ProgressTracker {
    /// Record `done` of `total` bytes and return the new progress.
    /// A zero-length transfer stays at 0.0 until [`Self::finish`].
    pub fn update(&mut self, done: u64, total: u64) -> f64 {
        if total > 0 {
            let ratio = (done as f64 / total as f64).min(MAX_PENDING_PROGRESS);
            if ratio > self.value {
                self.value = ratio;
            }
        }
        self.value
    }

    pub fn finish(&mut self) -> f64 {
        self.value = 1.0;
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}
