//! Sending half of a transfer.
//!
//! ```text
//! Staged → AwaitingChannel → Announcing → Streaming → AwaitingCompletionAck → Done
//!                         ╲_________________________________________________╱
//!                                          Failed
//! ```
//!
//! Every frame goes through the [`FlowController`]. The session listens for
//! [`SenderSignal`]s from the engine while it streams, so a cancel or a peer
//! abort interrupts it between frames.

use super::ProgressTracker;
use crate::core::config::EngineConfig;
use crate::core::error::EngineError;
use crate::core::flow::FlowController;
use crate::core::pipeline::{spawn_reader, ByteSource, StagedFile};
use crate::core::protocol::{ControlKind, FileMetadata, Frame, TransferId};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Staged,
    AwaitingChannel,
    Announcing,
    Streaming,
    AwaitingCompletionAck,
    Done,
    Failed,
}

/// Events the engine routes to a running sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SenderSignal {
    /// The receiver verified the file.
    Ack,
    /// The receiver gave up on the transfer.
    PeerAbort,
    /// The local user cancelled.
    Cancel,
    /// The engine saw the peer break protocol for this transfer.
    Fail(EngineError),
}

pub struct SenderSession {
    metadata: FileMetadata,
    source: Option<Box<dyn ByteSource>>,
    state: SenderState,
    chunk_size: usize,
    read_ahead: usize,
    completion_timeout: Duration,
    progress: ProgressTracker,
    /// The peer already knows the transfer is dead; do not send an abort.
    peer_aborted: bool,
    acked: bool,
}

impl SenderSession {
    pub fn new(transfer_id: TransferId, file: StagedFile, config: &EngineConfig) -> Self {
        let metadata = FileMetadata {
            transfer_id,
            byte_length: file.byte_length(),
            file_name: file.file_name,
            mime_type: file.mime_type,
        };
        Self {
            metadata,
            source: Some(file.source),
            state: SenderState::Staged,
            chunk_size: config.chunk_size,
            read_ahead: config.read_ahead_chunks,
            completion_timeout: config.completion_timeout(),
            progress: ProgressTracker::default(),
            peer_aborted: false,
            acked: false,
        }
    }

    pub fn transfer_id(&self) -> TransferId {
        self.metadata.transfer_id
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// Drive the transfer to `Done` or `Failed`.
    ///
    /// `on_progress` is called after every Data frame handed to the channel
    /// and once with 1.0 on success.
    pub async fn run<F>(
        &mut self,
        flow: &FlowController,
        signals: &mut mpsc::UnboundedReceiver<SenderSignal>,
        mut on_progress: F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(f64) + Send,
    {
        let started = Instant::now();
        let result = self.drive(flow, signals, &mut on_progress).await;
        let id = self.transfer_id();

        match &result {
            Ok(()) => {
                self.state = SenderState::Done;
                on_progress(self.progress.finish());
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    event = "file_send_complete",
                    transfer_id = %id,
                    bytes = self.metadata.byte_length,
                    elapsed_s = elapsed,
                    "File sent and acknowledged"
                );
            }
            Err(e) => {
                self.state = SenderState::Failed;
                warn!(event = "file_send_failed", transfer_id = %id, error = %e, "Send failed");
                let channel_gone = matches!(
                    e,
                    EngineError::ChannelRevoked | EngineError::Transport(_)
                );
                if !self.peer_aborted && !channel_gone {
                    // Best effort: the peer releases its buffer on receipt.
                    let _ = flow.send(&Frame::control(id, ControlKind::Abort)).await;
                }
            }
        }
        result
    }

    async fn drive<F>(
        &mut self,
        flow: &FlowController,
        signals: &mut mpsc::UnboundedReceiver<SenderSignal>,
        on_progress: &mut F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(f64) + Send,
    {
        let id = self.transfer_id();

        self.state = SenderState::AwaitingChannel;
        if flow.is_revoked() {
            return Err(EngineError::ChannelRevoked);
        }

        self.state = SenderState::Announcing;
        info!(
            event = "file_send_start",
            transfer_id = %id,
            file_name = %self.metadata.file_name,
            bytes = self.metadata.byte_length,
            "Sending file"
        );
        let announce = Frame::Metadata(self.metadata.clone());
        self.interruptible(flow, signals, flow.send(&announce)).await?;

        self.state = SenderState::Streaming;
        let source = self
            .source
            .take()
            .ok_or_else(|| EngineError::InvalidState("sender already ran".into()))?;
        let (mut chunks, reader) = spawn_reader(source, self.chunk_size, self.read_ahead);
        let streamed = self.stream(flow, signals, &mut chunks, on_progress).await;
        reader.abort();
        streamed?;

        // A fast peer may ack before the write of Complete returns.
        self.state = SenderState::AwaitingCompletionAck;
        self.interruptible(flow, signals, flow.send(&Frame::control(id, ControlKind::Complete)))
            .await?;
        if self.acked {
            return Ok(());
        }

        let waited = tokio::time::timeout(
            self.completion_timeout,
            self.interruptible(flow, signals, std::future::pending::<Result<(), EngineError>>()),
        )
        .await;
        match waited {
            Ok(result) => result,
            Err(_) => Err(EngineError::CompletionTimeout),
        }
    }

    async fn stream<F>(
        &mut self,
        flow: &FlowController,
        signals: &mut mpsc::UnboundedReceiver<SenderSignal>,
        chunks: &mut mpsc::Receiver<std::io::Result<bytes::Bytes>>,
        on_progress: &mut F,
    ) -> Result<(), EngineError>
    where
        F: FnMut(f64) + Send,
    {
        let id = self.transfer_id();
        let announced = self.metadata.byte_length;
        let mut sent: u64 = 0;
        let mut seq: u32 = 0;

        loop {
            let next = self
                .interruptible(flow, signals, async { Ok(chunks.recv().await) })
                .await?;
            let mut payload = match next {
                None => break,
                Some(Err(e)) => return Err(EngineError::Source(e.to_string())),
                Some(Ok(payload)) => payload,
            };

            if sent + payload.len() as u64 > announced {
                return Err(EngineError::LengthMismatch {
                    expected: announced,
                    actual: sent + payload.len() as u64,
                });
            }

            // A source may hand back more than it was asked for.
            while !payload.is_empty() {
                let slice = payload.split_to(self.chunk_size.min(payload.len()));
                sent += slice.len() as u64;
                let frame = Frame::Data {
                    transfer_id: id,
                    seq,
                    payload: slice,
                };
                self.interruptible(flow, signals, flow.send(&frame)).await?;
                seq = seq.wrapping_add(1);
                on_progress(self.progress.update(sent, announced));
            }
        }

        if sent != announced {
            return Err(EngineError::LengthMismatch {
                expected: announced,
                actual: sent,
            });
        }
        Ok(())
    }

    /// Run `fut` unless a signal or a revoked channel ends the transfer first.
    /// An `Ack` ends the wait successfully, but only once `Complete` is on
    /// its way.
    async fn interruptible<T, Fut>(
        &mut self,
        flow: &FlowController,
        signals: &mut mpsc::UnboundedReceiver<SenderSignal>,
        fut: Fut,
    ) -> Result<T, EngineError>
    where
        Fut: Future<Output = Result<T, EngineError>>,
        T: Default,
    {
        tokio::select! {
            biased;
            signal = signals.recv() => {
                match signal {
                    Some(SenderSignal::Ack) if self.state == SenderState::AwaitingCompletionAck => {
                        self.acked = true;
                        Ok(T::default())
                    }
                    Some(SenderSignal::Ack) => Err(EngineError::UnexpectedFrame(
                        "ack before completion".into(),
                    )),
                    Some(SenderSignal::PeerAbort) => {
                        self.peer_aborted = true;
                        Err(EngineError::Aborted("aborted by peer".into()))
                    }
                    Some(SenderSignal::Cancel) => {
                        Err(EngineError::Aborted("cancelled locally".into()))
                    }
                    Some(SenderSignal::Fail(e)) => Err(e),
                    None => Err(EngineError::Aborted("session dropped".into())),
                }
            }
            _ = flow.revoked() => Err(EngineError::ChannelRevoked),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::channel::lend;
    use crate::core::connection::loopback::LoopbackChannel;
    use crate::core::protocol::decode;
    use bytes::Bytes;

    fn config() -> EngineConfig {
        EngineConfig {
            chunk_size: 4,
            completion_timeout_ms: 100,
            flow_poll_interval_ms: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_metadata_data_complete_then_waits_for_ack() {
        let ((chan, _a), (_peer, mut b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan);
        let flow = FlowController::new(handle, &config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let id = TransferId::new_v4();
        let file = StagedFile::from_bytes("ten.bin", None, b"0123456789".to_vec());
        let mut session = SenderSession::new(id, file, &config());

        let mut seen = Vec::new();
        let run = session.run(&flow, &mut rx, |p| seen.push(p));
        let peer = async {
            let mut frames = Vec::new();
            loop {
                let frame = decode(b.incoming.recv().await.unwrap()).unwrap();
                let done = matches!(frame, Frame::Control { kind: ControlKind::Complete, .. });
                frames.push(frame);
                if done {
                    tx.send(SenderSignal::Ack).unwrap();
                    return frames;
                }
            }
        };
        let (result, frames) = tokio::join!(run, peer);
        result.unwrap();

        assert!(matches!(&frames[0], Frame::Metadata(m) if m.byte_length == 10));
        let seqs: Vec<u32> = frames
            .iter()
            .filter_map(|f| match f {
                Frame::Data { seq, payload, .. } => {
                    assert!(payload.len() <= 4);
                    Some(*seq)
                }
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(seen.last(), Some(&1.0));
        assert!(seen[..seen.len() - 1].iter().all(|p| *p < 1.0));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(session.state(), SenderState::Done);
    }

    #[tokio::test]
    async fn missing_ack_times_out() {
        let ((chan, _a), (_peer, _b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan.clone());
        let flow = FlowController::new(handle, &config());
        let (_tx, mut rx) = mpsc::unbounded_channel();

        let file = StagedFile::from_bytes("x", None, b"abc".to_vec());
        let mut session = SenderSession::new(TransferId::new_v4(), file, &config());
        assert_eq!(
            session.run(&flow, &mut rx, |_| {}).await,
            Err(EngineError::CompletionTimeout)
        );
        assert_eq!(session.state(), SenderState::Failed);
        // metadata, data, complete, abort
        assert_eq!(chan.frames_sent(), 4);
    }

    struct Liar {
        announced: u64,
        data: Option<Bytes>,
    }

    #[async_trait::async_trait]
    impl ByteSource for Liar {
        fn byte_length(&self) -> u64 {
            self.announced
        }

        async fn read_chunk(&mut self, _max: usize) -> std::io::Result<Option<Bytes>> {
            Ok(self.data.take())
        }
    }

    #[tokio::test]
    async fn short_and_long_sources_fail_with_length_mismatch() {
        for (announced, actual) in [(10u64, 3usize), (2, 3)] {
            let ((chan, _a), (_peer, mut b)) = LoopbackChannel::pair("b", "a");
            let (handle, _revoker) = lend(chan);
            let flow = FlowController::new(handle, &config());
            let (_tx, mut rx) = mpsc::unbounded_channel();

            let file = StagedFile::new(
                "liar",
                None,
                Box::new(Liar {
                    announced,
                    data: Some(Bytes::from(vec![1u8; actual])),
                }),
            );
            let mut session = SenderSession::new(TransferId::new_v4(), file, &config());
            let result = session.run(&flow, &mut rx, |_| {}).await;
            assert!(matches!(result, Err(EngineError::LengthMismatch { .. })), "{result:?}");

            let mut last = None;
            while let Ok(Some(raw)) =
                tokio::time::timeout(Duration::from_millis(50), b.incoming.recv()).await
            {
                last = Some(decode(raw).unwrap());
            }
            assert!(matches!(
                last,
                Some(Frame::Control { kind: ControlKind::Abort, .. })
            ));
        }
    }

    #[tokio::test]
    async fn oversized_source_chunks_are_split_to_chunk_size() {
        let ((chan, _a), (_peer, mut b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan);
        let flow = FlowController::new(handle, &config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let data: Vec<u8> = (0..100u8).collect();
        let file = StagedFile::new(
            "greedy",
            None,
            Box::new(Liar {
                announced: 100,
                data: Some(Bytes::from(data.clone())),
            }),
        );
        let mut session = SenderSession::new(TransferId::new_v4(), file, &config());

        let run = session.run(&flow, &mut rx, |_| {});
        let peer = async {
            let mut data_frames = Vec::new();
            loop {
                match decode(b.incoming.recv().await.unwrap()).unwrap() {
                    Frame::Data { seq, payload, .. } => data_frames.push((seq, payload)),
                    Frame::Control { kind: ControlKind::Complete, .. } => {
                        tx.send(SenderSignal::Ack).unwrap();
                        return data_frames;
                    }
                    _ => {}
                }
            }
        };
        let (result, data_frames) = tokio::join!(run, peer);
        result.unwrap();

        assert_eq!(data_frames.len(), 25);
        assert!(data_frames.iter().all(|(_, p)| p.len() <= 4));
        let seqs: Vec<u32> = data_frames.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, (0..25).collect::<Vec<u32>>());
        let joined: Vec<u8> = data_frames.iter().flat_map(|(_, p)| p.to_vec()).collect();
        assert_eq!(joined, data);
    }

    #[tokio::test]
    async fn peer_abort_is_not_answered() {
        let ((chan, _a), (_peer, _b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan.clone());
        let flow = FlowController::new(handle, &config());
        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(SenderSignal::PeerAbort).unwrap();

        let file = StagedFile::from_bytes("x", None, vec![0u8; 64]);
        let mut session = SenderSession::new(TransferId::new_v4(), file, &config());
        assert!(matches!(
            session.run(&flow, &mut rx, |_| {}).await,
            Err(EngineError::Aborted(_))
        ));
        assert_eq!(chan.frames_sent(), 0);
    }
}
