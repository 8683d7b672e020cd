//! TransferEngine: the single coordinator between the user surface, the
//! connection and the per-file sessions.
//!
//! Commands (`connect_to`, `stage`, `start_all`, `cancel`, ...) come from the
//! caller; frames come from the channel's reader task. The engine routes each
//! frame to its session by transfer id, records outcomes in the
//! [`TransferQueue`], and publishes read-model snapshots as [`EngineEvent`]s.
//!
//! Outbound files run concurrently, one task each. Their writes are
//! serialized by the [`FlowController`], so frames of different files may
//! interleave on the wire while each file stays in order.

use crate::core::config::{EngineConfig, MAX_PENDING_PROGRESS};
use crate::core::connection::{
    ConnectionManager, Established, PeerConnectionState, Signaling, Transport,
};
use crate::core::error::EngineError;
use crate::core::flow::{FlowController, WireStats};
use crate::core::pipeline::StagedFile;
use crate::core::protocol::{decode, peek_transfer_id, ControlKind, Frame, TransferId};
use crate::core::queue::{FileTransfer, ReceivedFile, TransferQueue};
use crate::core::session::{
    ReceiverSession, Role, SenderHandle, SenderSession, SenderSignal, TransferSession,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

// ── Events ───────────────────────────────────────────────────────────────────

/// Notifications for observers that prefer pushing over polling.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Connection(PeerConnectionState),
    Transfer(FileTransfer),
    FileReceived {
        transfer_id: TransferId,
        file_name: String,
        byte_length: u64,
    },
    ProtocolViolation {
        transfer_id: Option<TransferId>,
        error: EngineError,
    },
}

fn notify(events: &Option<mpsc::UnboundedSender<EngineEvent>>, event: EngineEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct ActiveLink {
    flow: Arc<FlowController>,
    reader: JoinHandle<()>,
}

struct Inner {
    config: EngineConfig,
    manager: ConnectionManager,
    queue: Mutex<TransferQueue>,
    sessions: Mutex<HashMap<TransferId, TransferSession>>,
    link: Mutex<Option<ActiveLink>>,
    events: Option<mpsc::UnboundedSender<EngineEvent>>,
}

/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct TransferEngine {
    inner: Arc<Inner>,
}

impl TransferEngine {
    pub fn new(
        config: EngineConfig,
        signaling: Arc<dyn Signaling>,
        transport: Arc<dyn Transport>,
        events: Option<mpsc::UnboundedSender<EngineEvent>>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let manager = ConnectionManager::new(signaling, transport, config.handshake_timeout());
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                manager,
                queue: Mutex::new(TransferQueue::new()),
                sessions: Mutex::new(HashMap::new()),
                link: Mutex::new(None),
                events,
            }),
        })
    }

    // ── Connection commands ──────────────────────────────────────────────────

    /// Assign and publish the local id. The returned state carries the
    /// share token for the peer.
    pub async fn begin_negotiation(
        &self,
        local_id: Option<&str>,
    ) -> Result<PeerConnectionState, EngineError> {
        let result = self.inner.manager.begin_negotiation(local_id).await;
        self.inner.emit_connection();
        result.map(|_| self.inner.manager.snapshot())
    }

    pub async fn connect_to(&self, remote_id: &str) -> Result<(), EngineError> {
        let result = self.inner.manager.connect_to(remote_id).await;
        self.inner.emit_connection();
        self.inner.install(result?);
        Ok(())
    }

    /// Wait for the peer to connect to the descriptor published by
    /// [`Self::begin_negotiation`].
    pub async fn accept(&self) -> Result<(), EngineError> {
        let result = self.inner.manager.accept().await;
        self.inner.emit_connection();
        self.inner.install(result?);
        Ok(())
    }

    /// Close the connection. Every active transfer fails. Idempotent.
    pub async fn disconnect(&self) {
        let senders = self.inner.take_sender_tasks();
        self.inner.manager.disconnect().await;
        if let Some(link) = lock(&self.inner.link).take() {
            link.reader.abort();
        }
        for task in senders {
            let _ = task.await;
        }
        self.inner.fail_receivers(EngineError::ChannelRevoked);
        self.inner.emit_connection();
    }

    pub fn acknowledge_error(&self) {
        self.inner.manager.acknowledge_error();
        self.inner.emit_connection();
    }

    pub fn connection_state(&self) -> PeerConnectionState {
        self.inner.manager.snapshot()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<PeerConnectionState> {
        self.inner.manager.subscribe()
    }

    // ── Transfer commands ────────────────────────────────────────────────────

    /// Record a file for sending. Nothing is transmitted until started.
    pub fn stage(&self, file: StagedFile) -> FileTransfer {
        let transfer = lock(&self.inner.queue).stage(file);
        debug!(event = "file_staged", transfer_id = %transfer.id, file_name = %transfer.file_name);
        notify(&self.inner.events, EngineEvent::Transfer(transfer.clone()));
        transfer
    }

    /// Start every staged file.
    pub fn start_all(&self) -> Result<Vec<FileTransfer>, EngineError> {
        let flow = self.inner.live_flow()?;
        let items = lock(&self.inner.queue).take_all_queued();
        Ok(items
            .into_iter()
            .map(|(transfer, file)| self.inner.spawn_sender(&flow, transfer, file))
            .collect())
    }

    pub fn start(&self, id: TransferId) -> Result<FileTransfer, EngineError> {
        let flow = self.inner.live_flow()?;
        let (transfer, file) = lock(&self.inner.queue).take_queued(id)?;
        Ok(self.inner.spawn_sender(&flow, transfer, file))
    }

    /// Abort one transfer, staged or active. The peer is told with a
    /// best-effort abort.
    pub async fn cancel(&self, id: TransferId) -> Result<(), EngineError> {
        let reason = EngineError::Aborted("cancelled locally".into());
        if let Some(transfer) = lock(&self.inner.queue).unstage(id, &reason) {
            notify(&self.inner.events, EngineEvent::Transfer(transfer));
            return Ok(());
        }

        enum Target {
            Sender(mpsc::UnboundedSender<SenderSignal>, Option<JoinHandle<()>>),
            Receiver(ReceiverSession),
        }
        let target = {
            let mut sessions = lock(&self.inner.sessions);
            match sessions.get_mut(&id) {
                Some(TransferSession::Sender(handle)) => {
                    Target::Sender(handle.signals.clone(), handle.task.take())
                }
                Some(TransferSession::Receiver(_)) => match sessions.remove(&id) {
                    Some(TransferSession::Receiver(receiver)) => Target::Receiver(receiver),
                    _ => return Err(EngineError::UnknownTransfer(id)),
                },
                None => return Err(EngineError::UnknownTransfer(id)),
            }
        };

        info!(event = "transfer_cancel", transfer_id = %id);
        match target {
            Target::Sender(signals, task) => {
                // The sender sends the abort and records its own failure.
                let _ = signals.send(SenderSignal::Cancel);
                if let Some(task) = task {
                    let _ = task.await;
                }
            }
            Target::Receiver(mut receiver) => {
                let err = receiver.fail(reason);
                self.inner.finish(id, Err(err));
                if let Ok(flow) = self.inner.live_flow() {
                    let _ = flow.send(&Frame::control(id, ControlKind::Abort)).await;
                }
            }
        }
        Ok(())
    }

    // ── Read models ──────────────────────────────────────────────────────────

    pub fn transfers(&self) -> Vec<FileTransfer> {
        lock(&self.inner.queue).snapshot()
    }

    pub fn transfer(&self, id: TransferId) -> Option<FileTransfer> {
        lock(&self.inner.queue).get(id)
    }

    /// Collect files received since the last call.
    pub fn take_received(&self) -> Vec<ReceivedFile> {
        lock(&self.inner.queue).take_received()
    }

    /// Wire counters of the current connection, if any.
    pub fn wire_stats(&self) -> Option<WireStats> {
        lock(&self.inner.link).as_ref().map(|link| link.flow.stats())
    }
}

// ── Internals ────────────────────────────────────────────────────────────────

impl Inner {
    fn emit_connection(&self) {
        notify(&self.events, EngineEvent::Connection(self.manager.snapshot()));
    }

    fn emit_violation(&self, transfer_id: Option<TransferId>, error: &EngineError) {
        warn!(
            event = "protocol_violation",
            transfer_id = ?transfer_id,
            error = %error,
            "Peer broke protocol"
        );
        notify(
            &self.events,
            EngineEvent::ProtocolViolation {
                transfer_id,
                error: error.clone(),
            },
        );
    }

    fn install(self: &Arc<Self>, established: Established) {
        debug!(event = "link_installed", remote_id = %established.remote_id);
        let flow = Arc::new(FlowController::new(established.handle, &self.config));
        let reader = tokio::spawn(read_loop(self.clone(), flow.clone(), established.incoming));
        if let Some(old) = lock(&self.link).replace(ActiveLink { flow, reader }) {
            old.reader.abort();
        }
    }

    fn live_flow(&self) -> Result<Arc<FlowController>, EngineError> {
        if !self.manager.snapshot().is_connected {
            return Err(EngineError::NotConnected);
        }
        lock(&self.link)
            .as_ref()
            .filter(|link| !link.flow.is_revoked())
            .map(|link| link.flow.clone())
            .ok_or(EngineError::NotConnected)
    }

    fn spawn_sender(
        self: &Arc<Self>,
        flow: &Arc<FlowController>,
        transfer: FileTransfer,
        file: StagedFile,
    ) -> FileTransfer {
        let id = transfer.id;
        let (signals, mut rx) = mpsc::unbounded_channel();
        // Registered before the task starts so an early ack finds it.
        lock(&self.sessions).insert(
            id,
            TransferSession::Sender(SenderHandle {
                signals,
                task: None,
            }),
        );
        notify(&self.events, EngineEvent::Transfer(transfer.clone()));

        let mut session = SenderSession::new(id, file, &self.config);
        let inner = self.clone();
        let flow = flow.clone();
        let task = tokio::spawn(async move {
            let progress = inner.clone();
            let result = session
                .run(&flow, &mut rx, move |p| progress.on_progress(id, p))
                .await;
            debug!(event = "sender_task_end", transfer_id = %id, state = ?session.state());
            inner.finish(id, result);
            lock(&inner.sessions).remove(&id);
        });

        if let Some(TransferSession::Sender(handle)) = lock(&self.sessions).get_mut(&id) {
            handle.task = Some(task);
        }
        transfer
    }

    fn on_progress(&self, id: TransferId, progress: f64) {
        // Exactly 1.0 is written by `finish` together with `Done`.
        let progress = progress.min(MAX_PENDING_PROGRESS);
        if let Some(transfer) = lock(&self.queue).update_progress(id, progress) {
            notify(&self.events, EngineEvent::Transfer(transfer));
        }
    }

    fn finish(&self, id: TransferId, outcome: Result<(), EngineError>) {
        if let Some(transfer) = lock(&self.queue).finish(id, &outcome) {
            notify(&self.events, EngineEvent::Transfer(transfer));
        }
    }

    fn take_sender_tasks(&self) -> Vec<JoinHandle<()>> {
        lock(&self.sessions)
            .values_mut()
            .filter_map(|session| match session {
                TransferSession::Sender(handle) => handle.task.take(),
                TransferSession::Receiver(_) => None,
            })
            .collect()
    }

    fn fail_receivers(&self, err: EngineError) {
        let receivers: Vec<(TransferId, TransferSession)> = {
            let mut sessions = lock(&self.sessions);
            let ids: Vec<TransferId> = sessions
                .iter()
                .filter(|(_, s)| s.role() == Role::Receiver)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };
        for (id, session) in receivers {
            if let TransferSession::Receiver(mut receiver) = session {
                debug!(
                    event = "receiver_interrupted",
                    transfer_id = %id,
                    state = ?receiver.state(),
                    received = receiver.received_len(),
                    progress = receiver.progress()
                );
                let err = receiver.fail(err.clone());
                self.finish(id, Err(err));
            }
        }
    }

    async fn link_lost(&self) {
        self.manager.link_lost("connection to peer lost").await;
        self.emit_connection();
        // Senders notice the revoked handle and fail on their own.
        self.fail_receivers(EngineError::Transport("connection to peer lost".into()));
    }

    // ── Frame routing ────────────────────────────────────────────────────────

    /// Route one inbound message. Returns the frames to send back.
    fn dispatch(&self, raw: Bytes) -> Vec<Frame> {
        let frame = match decode(raw.clone()) {
            Ok(frame) => frame,
            Err(e) => return self.on_malformed(&raw, e),
        };
        let id = frame.transfer_id();
        match frame {
            Frame::Metadata(meta) => {
                let existing = lock(&self.sessions).remove(&id);
                if let Some(existing) = existing {
                    let err = EngineError::UnexpectedFrame("duplicate metadata".into());
                    return self.fail_session(id, existing, err);
                }
                if lock(&self.queue).is_completed(id) {
                    let err = EngineError::UnexpectedFrame("metadata for a finished transfer".into());
                    self.emit_violation(Some(id), &err);
                    return vec![Frame::control(id, ControlKind::Abort)];
                }

                let mut receiver = ReceiverSession::new(id);
                if let Err(e) = receiver.on_metadata(meta.clone()) {
                    self.emit_violation(Some(id), &e);
                    return vec![Frame::control(id, ControlKind::Abort)];
                }
                lock(&self.sessions).insert(id, TransferSession::Receiver(receiver));
                let transfer = lock(&self.queue).open_inbound(&meta);
                notify(&self.events, EngineEvent::Transfer(transfer));
                Vec::new()
            }
            Frame::Data { seq, payload, .. } => {
                let routed = {
                    let mut sessions = lock(&self.sessions);
                    match sessions.get_mut(&id) {
                        Some(TransferSession::Receiver(receiver)) => {
                            Routed::Receiver(receiver.on_data(seq, payload))
                        }
                        Some(TransferSession::Sender(handle)) => Routed::Sender(handle.signals.clone()),
                        None => Routed::Unknown,
                    }
                };
                match routed {
                    Routed::Receiver(Ok(progress)) => {
                        self.on_progress(id, progress);
                        Vec::new()
                    }
                    Routed::Receiver(Err(e)) => {
                        lock(&self.sessions).remove(&id);
                        self.receiver_failed(id, e)
                    }
                    Routed::Sender(signals) => {
                        let err = EngineError::UnexpectedFrame("data on an outbound transfer".into());
                        self.emit_violation(Some(id), &err);
                        let _ = signals.send(SenderSignal::Fail(err));
                        Vec::new()
                    }
                    Routed::Unknown => self.unknown_transfer(id, "data"),
                }
            }
            Frame::Control { kind, .. } => self.on_control(id, kind),
        }
    }

    fn on_control(&self, id: TransferId, kind: ControlKind) -> Vec<Frame> {
        let mut sessions = lock(&self.sessions);
        match (sessions.get_mut(&id), kind) {
            (Some(TransferSession::Sender(handle)), kind) => {
                let signal = match kind {
                    ControlKind::Ack => SenderSignal::Ack,
                    ControlKind::Abort => SenderSignal::PeerAbort,
                    ControlKind::Complete => {
                        let err =
                            EngineError::UnexpectedFrame("complete on an outbound transfer".into());
                        self.emit_violation(Some(id), &err);
                        SenderSignal::Fail(err)
                    }
                };
                let _ = handle.signals.send(signal);
                Vec::new()
            }
            (Some(TransferSession::Receiver(receiver)), ControlKind::Complete) => {
                let outcome = receiver.on_complete();
                sessions.remove(&id);
                drop(sessions);
                match outcome {
                    Ok(file) => {
                        let byte_length = file.data.len() as u64;
                        let file_name = file.file_name.clone();
                        {
                            let mut queue = lock(&self.queue);
                            queue.push_received(file);
                        }
                        self.finish(id, Ok(()));
                        notify(
                            &self.events,
                            EngineEvent::FileReceived {
                                transfer_id: id,
                                file_name,
                                byte_length,
                            },
                        );
                        vec![Frame::control(id, ControlKind::Ack)]
                    }
                    Err(e) => self.receiver_failed(id, e),
                }
            }
            (Some(TransferSession::Receiver(_)), ControlKind::Abort) => {
                let session = sessions.remove(&id);
                drop(sessions);
                if let Some(TransferSession::Receiver(mut receiver)) = session {
                    let err = receiver.fail(EngineError::Aborted("aborted by peer".into()));
                    self.finish(id, Err(err));
                }
                Vec::new()
            }
            (Some(TransferSession::Receiver(_)), ControlKind::Ack) => {
                let session = sessions.remove(&id);
                drop(sessions);
                match session {
                    Some(session) => self.fail_session(
                        id,
                        session,
                        EngineError::UnexpectedFrame("ack on an inbound transfer".into()),
                    ),
                    None => Vec::new(),
                }
            }
            // Aborts are never answered.
            (None, ControlKind::Abort) => Vec::new(),
            (None, kind) => {
                drop(sessions);
                self.unknown_transfer(id, if kind == ControlKind::Ack { "ack" } else { "complete" })
            }
        }
    }

    /// Fail a session removed from the map because of a protocol violation.
    fn fail_session(&self, id: TransferId, session: TransferSession, err: EngineError) -> Vec<Frame> {
        match session {
            TransferSession::Receiver(mut receiver) => {
                let err = receiver.fail(err);
                self.receiver_failed(id, err)
            }
            TransferSession::Sender(handle) => {
                self.emit_violation(Some(id), &err);
                let _ = handle.signals.send(SenderSignal::Fail(err));
                // The sender task removes its own entry when it ends.
                lock(&self.sessions).insert(id, TransferSession::Sender(handle));
                Vec::new()
            }
        }
    }

    fn receiver_failed(&self, id: TransferId, err: EngineError) -> Vec<Frame> {
        if err.is_protocol_violation() {
            self.emit_violation(Some(id), &err);
        }
        self.finish(id, Err(err));
        vec![Frame::control(id, ControlKind::Abort)]
    }

    fn unknown_transfer(&self, id: TransferId, what: &str) -> Vec<Frame> {
        // Late frames of a transfer that already ended are expected.
        if lock(&self.queue).is_completed(id) {
            debug!(event = "late_frame_dropped", transfer_id = %id, kind = what);
            return Vec::new();
        }
        self.emit_violation(Some(id), &EngineError::UnknownTransfer(id));
        vec![Frame::control(id, ControlKind::Abort)]
    }

    fn on_malformed(&self, raw: &[u8], err: EngineError) -> Vec<Frame> {
        let id = peek_transfer_id(raw);
        let session = id.and_then(|id| lock(&self.sessions).remove(&id).map(|s| (id, s)));
        match session {
            Some((id, session)) => self.fail_session(id, session, err),
            None => {
                self.emit_violation(id, &err);
                Vec::new()
            }
        }
    }
}

enum Routed {
    Receiver(Result<f64, EngineError>),
    Sender(mpsc::UnboundedSender<SenderSignal>),
    Unknown,
}

/// Read inbound messages until the handle is revoked or the link drops.
async fn read_loop(
    inner: Arc<Inner>,
    flow: Arc<FlowController>,
    mut incoming: mpsc::UnboundedReceiver<Bytes>,
) {
    loop {
        tokio::select! {
            biased;
            _ = flow.revoked() => break,
            message = incoming.recv() => match message {
                Some(raw) => {
                    for reply in inner.dispatch(raw) {
                        if let Err(e) = flow.send(&reply).await {
                            debug!(event = "reply_failed", transfer_id = %reply.transfer_id(), error = %e);
                        }
                    }
                }
                None => {
                    warn!(event = "link_lost", "Channel closed by peer or transport");
                    inner.link_lost().await;
                    break;
                }
            }
        }
    }
}
