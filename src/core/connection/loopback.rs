//! In-process signaling and transport.
//!
//! A [`LoopbackNetwork`] is a shared registry that any number of
//! [`LoopbackEndpoint`]s publish into and dial through. Channels between
//! endpoints are a pair of in-memory queues drained by a pump task, which
//! gives them a real `buffered_amount` and lets a test hold delivery to
//! build backpressure on purpose.
//!
//! The engine's own test suite and local demos run on this transport.

use super::channel::{Channel, Link};
use super::signaling::{Signaling, Transport};
use crate::core::error::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

type Pending = (Arc<LoopbackChannel>, Link);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── Network ──────────────────────────────────────────────────────────────────

struct Registration {
    descriptor: Bytes,
    accept_tx: mpsc::UnboundedSender<Pending>,
}

#[derive(Default)]
struct NetworkState {
    peers: HashMap<String, Registration>,
    signaling_down: bool,
    reject_reason: Option<String>,
    stall_dials: bool,
    dials: usize,
}

/// Shared registry standing in for both the signaling server and the
/// network between peers.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self) -> Arc<LoopbackEndpoint> {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Arc::new(LoopbackEndpoint {
            network: self.clone(),
            self_id: Mutex::new(None),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            channels: Mutex::new(Vec::new()),
        })
    }

    /// While unavailable, every signaling call fails with
    /// [`EngineError::SignalingUnavailable`].
    pub fn set_signaling_available(&self, available: bool) {
        lock(&self.state).signaling_down = !available;
    }

    /// Make every dial fail with [`EngineError::HandshakeFailed`].
    pub fn reject_dials(&self, reason: Option<&str>) {
        lock(&self.state).reject_reason = reason.map(str::to_owned);
    }

    /// Make every dial hang until it is cancelled from outside.
    pub fn stall_dials(&self, stall: bool) {
        lock(&self.state).stall_dials = stall;
    }

    /// Dials attempted so far, successful or not.
    pub fn dial_count(&self) -> usize {
        lock(&self.state).dials
    }
}

// ── Endpoint ─────────────────────────────────────────────────────────────────

/// One peer's view of a [`LoopbackNetwork`]. Implements both
/// [`Signaling`] and [`Transport`].
pub struct LoopbackEndpoint {
    network: LoopbackNetwork,
    self_id: Mutex<Option<String>>,
    accept_tx: mpsc::UnboundedSender<Pending>,
    accept_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Pending>>,
    channels: Mutex<Vec<Arc<LoopbackChannel>>>,
}

impl LoopbackEndpoint {
    /// Local end of the most recently established channel.
    pub fn last_channel(&self) -> Option<Arc<LoopbackChannel>> {
        lock(&self.channels).last().cloned()
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    fn record(&self, channel: Arc<LoopbackChannel>) {
        lock(&self.channels).push(channel);
    }

    fn check_signaling(&self) -> Result<(), EngineError> {
        if lock(&self.network.state).signaling_down {
            Err(EngineError::SignalingUnavailable(
                "loopback signaling is offline".into(),
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Signaling for LoopbackEndpoint {
    async fn publish_local_descriptor(
        &self,
        self_id: &str,
        descriptor: Bytes,
    ) -> Result<String, EngineError> {
        self.check_signaling()?;
        let mut state = lock(&self.network.state);
        // Only the endpoint that registered an id may publish under it again.
        if let Some(existing) = state.peers.get(self_id) {
            if !existing.accept_tx.same_channel(&self.accept_tx) {
                return Err(EngineError::InvalidState(format!(
                    "id {self_id} is already registered"
                )));
            }
        }
        state.peers.insert(
            self_id.to_owned(),
            Registration {
                descriptor,
                accept_tx: self.accept_tx.clone(),
            },
        );
        Ok(format!("loopback://{self_id}"))
    }

    async fn fetch_remote_descriptor(&self, remote_id: &str) -> Result<Bytes, EngineError> {
        self.check_signaling()?;
        lock(&self.network.state)
            .peers
            .get(remote_id)
            .map(|reg| reg.descriptor.clone())
            .ok_or_else(|| EngineError::PeerNotFound(remote_id.to_owned()))
    }
}

#[async_trait]
impl Transport for LoopbackEndpoint {
    async fn prepare(&self, self_id: &str) -> Result<Bytes, EngineError> {
        *lock(&self.self_id) = Some(self_id.to_owned());
        Ok(Bytes::from(format!("loopback-descriptor:{self_id}")))
    }

    async fn dial(&self, remote_id: &str, descriptor: Bytes) -> Result<Link, EngineError> {
        let (stall, accept_tx) = {
            let mut state = lock(&self.network.state);
            state.dials += 1;
            if let Some(reason) = &state.reject_reason {
                return Err(EngineError::HandshakeFailed(reason.clone()));
            }
            let reg = state
                .peers
                .get(remote_id)
                .ok_or_else(|| EngineError::PeerNotFound(remote_id.to_owned()))?;
            if reg.descriptor != descriptor {
                return Err(EngineError::HandshakeFailed(
                    "descriptor does not match the published one".into(),
                ));
            }
            (state.stall_dials, reg.accept_tx.clone())
        };

        if stall {
            std::future::pending::<()>().await;
        }

        let local_id = lock(&self.self_id)
            .clone()
            .unwrap_or_else(|| format!("anonymous-{}", Uuid::new_v4().simple()));
        let ((local, local_link), remote) = LoopbackChannel::pair(remote_id, &local_id);

        accept_tx
            .send(remote)
            .map_err(|_| EngineError::PeerNotFound(remote_id.to_owned()))?;
        self.record(local);
        debug!(event = "loopback_dial", remote_id, local_id = %local_id);
        Ok(local_link)
    }

    async fn accept(&self) -> Result<Link, EngineError> {
        let mut rx = self.accept_rx.lock().await;
        match rx.recv().await {
            Some((channel, link)) => {
                self.record(channel);
                debug!(event = "loopback_accept", remote_id = %link.remote_id);
                Ok(link)
            }
            None => Err(EngineError::Transport("loopback network dropped".into())),
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// One end of an in-memory channel.
pub struct LoopbackChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    buffered: Arc<AtomicUsize>,
    held: watch::Sender<bool>,
    frames_sent: AtomicU64,
    closed: AtomicBool,
}

impl LoopbackChannel {
    /// Build a connected pair. The first link's `remote_id` is `a_remote`,
    /// the second's is `b_remote`. Must be called inside a tokio runtime.
    pub fn pair(a_remote: &str, b_remote: &str) -> (Pending, Pending) {
        let (a_in_tx, a_in_rx) = mpsc::unbounded_channel();
        let (b_in_tx, b_in_rx) = mpsc::unbounded_channel();

        // a.send -> b.incoming, b.send -> a.incoming
        let a = Self::spawn_end(b_in_tx);
        let b = Self::spawn_end(a_in_tx);

        let a_link = Link {
            remote_id: a_remote.to_owned(),
            channel: a.clone(),
            incoming: a_in_rx,
        };
        let b_link = Link {
            remote_id: b_remote.to_owned(),
            channel: b.clone(),
            incoming: b_in_rx,
        };
        ((a, a_link), (b, b_link))
    }

    fn spawn_end(deliver: mpsc::UnboundedSender<Bytes>) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let buffered = Arc::new(AtomicUsize::new(0));
        let (held_tx, held_rx) = watch::channel(false);
        tokio::spawn(pump(queue_rx, deliver, buffered.clone(), held_rx));
        Arc::new(Self {
            outbound: Mutex::new(Some(queue_tx)),
            buffered,
            held: held_tx,
            frames_sent: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    /// Stop delivering: sent messages pile up in the local buffer.
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::SeqCst)
    }

    pub fn buffered(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn pump(
    mut queue: mpsc::UnboundedReceiver<Bytes>,
    deliver: mpsc::UnboundedSender<Bytes>,
    buffered: Arc<AtomicUsize>,
    mut held: watch::Receiver<bool>,
) {
    while let Some(message) = queue.recv().await {
        // A dropped channel end counts as released.
        let _ = held.wait_for(|h| !*h).await;
        buffered.fetch_sub(message.len(), Ordering::SeqCst);
        if deliver.send(message).is_err() {
            break;
        }
    }
}

#[async_trait]
impl Channel for LoopbackChannel {
    async fn send(&self, message: Bytes) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Transport("channel closed".into()));
        }
        let len = message.len();
        let guard = lock(&self.outbound);
        let tx = guard
            .as_ref()
            .ok_or_else(|| EngineError::Transport("channel closed".into()))?;
        self.buffered.fetch_add(len, Ordering::SeqCst);
        if tx.send(message).is_err() {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            return Err(EngineError::Transport("peer went away".into()));
        }
        self.frames_sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn buffered_amount(&self) -> usize {
        self.buffered()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the queue sender lets the pump drain and then end the
        // peer's incoming stream.
        lock(&self.outbound).take();
        self.release();
    }
}
