//! Connection lifecycle: negotiation, the single live link, teardown.
//!
//! The manager owns the one channel a peer may have at a time and lends it
//! upward as a revocable [`ChannelHandle`]. Observers follow the state
//! through a `watch` channel of [`PeerConnectionState`] snapshots.

use super::channel::{lend, Channel, ChannelHandle, Link, Revoker};
use super::signaling::{Signaling, Transport};
use crate::core::error::EngineError;
use bytes::Bytes;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Idle,
    Negotiating,
    Connected,
    Closing,
    Closed,
    Error,
}

/// Snapshot of the connection as seen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerConnectionState {
    /// Local identifier. Immutable once assigned.
    pub self_id: Option<String>,
    /// What the user hands to the peer, as returned by signaling.
    pub share_token: Option<String>,
    pub remote_id: Option<String>,
    pub is_connected: bool,
    /// Last connectivity error, until acknowledged or superseded.
    pub error: Option<String>,
    pub state: ConnectionState,
}

/// The products of a successful handshake, handed to the engine.
pub struct Established {
    pub remote_id: String,
    pub handle: ChannelHandle,
    pub incoming: mpsc::UnboundedReceiver<Bytes>,
}

struct ActiveLink {
    channel: Arc<dyn Channel>,
    revoker: Revoker,
}

struct Inner {
    state: ConnectionState,
    self_id: Option<String>,
    share_token: Option<String>,
    remote_id: Option<String>,
    error: Option<String>,
    handshaking: bool,
    link: Option<ActiveLink>,
}

pub struct ConnectionManager {
    signaling: Arc<dyn Signaling>,
    transport: Arc<dyn Transport>,
    handshake_timeout: Duration,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<PeerConnectionState>,
}

impl ConnectionManager {
    pub fn new(
        signaling: Arc<dyn Signaling>,
        transport: Arc<dyn Transport>,
        handshake_timeout: Duration,
    ) -> Self {
        let inner = Inner {
            state: ConnectionState::Idle,
            self_id: None,
            share_token: None,
            remote_id: None,
            error: None,
            handshaking: false,
            link: None,
        };
        let (state_tx, _) = watch::channel(snapshot_of(&inner));
        Self {
            signaling,
            transport,
            handshake_timeout,
            inner: Mutex::new(inner),
            state_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Push the current snapshot to observers. Call with the lock held so
    /// snapshots are published in mutation order.
    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(snapshot_of(inner));
    }

    pub fn snapshot(&self) -> PeerConnectionState {
        snapshot_of(&self.lock())
    }

    pub fn subscribe(&self) -> watch::Receiver<PeerConnectionState> {
        self.state_tx.subscribe()
    }

    /// Resolves once the manager is closing or closed.
    async fn closed(&self) {
        let mut rx = self.state_tx.subscribe();
        let _ = rx
            .wait_for(|s| matches!(s.state, ConnectionState::Closing | ConnectionState::Closed))
            .await;
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    /// Assign the local identifier (generated when `local_id` is absent) and
    /// publish this endpoint's descriptor. Returns the share token.
    ///
    /// From `Error` (a lost link or a failed handshake) this prepares and
    /// publishes a fresh descriptor under the id already assigned, so a
    /// listening endpoint can accept again. `local_id` must then be absent
    /// or equal to that id.
    pub async fn begin_negotiation(&self, local_id: Option<&str>) -> Result<String, EngineError> {
        let local_id = local_id.filter(|id| !id.is_empty());
        let assigned = {
            let mut inner = self.lock();
            if inner.handshaking {
                return Err(EngineError::HandshakeInProgress);
            }
            if !matches!(inner.state, ConnectionState::Idle | ConnectionState::Error) {
                return Err(EngineError::InvalidState(format!(
                    "cannot negotiate while {:?}",
                    inner.state
                )));
            }
            match (&inner.self_id, local_id) {
                (Some(_), _) if inner.state == ConnectionState::Idle => {
                    return Err(EngineError::InvalidState("self id already assigned".into()));
                }
                (Some(current), Some(wanted)) if current != wanted => {
                    return Err(EngineError::InvalidState(format!(
                        "self id is already {current}"
                    )));
                }
                _ => {}
            }
            inner.handshaking = true;
            inner.self_id.clone()
        };

        let renegotiating = assigned.is_some();
        let self_id = assigned
            .or_else(|| local_id.map(str::to_owned))
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let published = async {
            let descriptor = self.transport.prepare(&self_id).await?;
            self.signaling
                .publish_local_descriptor(&self_id, descriptor)
                .await
        }
        .await;

        let mut inner = self.lock();
        inner.handshaking = false;
        match published {
            Ok(token) => {
                info!(
                    event = "negotiation_ready",
                    self_id = %self_id,
                    token = %token,
                    renegotiating
                );
                inner.self_id = Some(self_id);
                inner.share_token = Some(token.clone());
                inner.remote_id = None;
                inner.error = None;
                inner.state = ConnectionState::Negotiating;
                self.publish(&inner);
                Ok(token)
            }
            Err(e) => {
                warn!(event = "negotiation_failed", error = %e);
                inner.error = Some(e.to_string());
                self.publish(&inner);
                Err(e)
            }
        }
    }

    /// Fetch the peer's descriptor and complete a handshake toward it.
    pub async fn connect_to(&self, remote_id: &str) -> Result<Established, EngineError> {
        self.start_handshake()?;
        info!(event = "handshake_start", remote_id);

        let attempt = async {
            let descriptor = self.signaling.fetch_remote_descriptor(remote_id).await?;
            self.transport.dial(remote_id, descriptor).await
        };
        let result = tokio::select! {
            r = tokio::time::timeout(self.handshake_timeout, attempt) => {
                r.unwrap_or(Err(EngineError::HandshakeTimeout))
            }
            _ = self.closed() => Err(EngineError::InvalidState("closed during handshake".into())),
        };
        self.finish_handshake(result).await
    }

    /// Wait for a peer to connect to the descriptor published by
    /// [`Self::begin_negotiation`]. Not bounded by the handshake timeout:
    /// the peer may take arbitrarily long to show up.
    pub async fn accept(&self) -> Result<Established, EngineError> {
        {
            let inner = self.lock();
            if inner.state != ConnectionState::Negotiating {
                return Err(EngineError::InvalidState(format!(
                    "cannot accept while {:?}",
                    inner.state
                )));
            }
        }
        self.start_handshake()?;
        info!(event = "accept_start");

        let result = tokio::select! {
            r = self.transport.accept() => r,
            _ = self.closed() => Err(EngineError::InvalidState("closed while accepting".into())),
        };
        self.finish_handshake(result).await
    }

    fn start_handshake(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        match inner.state {
            ConnectionState::Connected => return Err(EngineError::AlreadyConnected),
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(EngineError::InvalidState(format!(
                    "cannot connect while {:?}",
                    inner.state
                )))
            }
            ConnectionState::Idle | ConnectionState::Negotiating | ConnectionState::Error => {}
        }
        if inner.handshaking {
            return Err(EngineError::HandshakeInProgress);
        }
        inner.handshaking = true;
        // A new attempt supersedes the previous error.
        inner.error = None;
        self.publish(&inner);
        Ok(())
    }

    async fn finish_handshake(
        &self,
        result: Result<Link, EngineError>,
    ) -> Result<Established, EngineError> {
        let stale = {
            let mut inner = self.lock();
            inner.handshaking = false;
            let closing = matches!(
                inner.state,
                ConnectionState::Closing | ConnectionState::Closed
            );
            match result {
                Ok(link) if !closing => {
                    let (handle, revoker) = lend(link.channel.clone());
                    inner.link = Some(ActiveLink {
                        channel: link.channel,
                        revoker,
                    });
                    inner.remote_id = Some(link.remote_id.clone());
                    inner.error = None;
                    inner.state = ConnectionState::Connected;
                    self.publish(&inner);
                    info!(event = "connected", remote_id = %link.remote_id);
                    return Ok(Established {
                        remote_id: link.remote_id,
                        handle,
                        incoming: link.incoming,
                    });
                }
                Ok(link) => link.channel,
                Err(e) => {
                    warn!(event = "handshake_failed", error = %e);
                    if !closing {
                        inner.state = ConnectionState::Error;
                        inner.error = Some(e.to_string());
                        self.publish(&inner);
                    }
                    return Err(e);
                }
            }
        };
        // Handshake won the race against disconnect; drop the late link.
        stale.close().await;
        Err(EngineError::InvalidState("closed during handshake".into()))
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Revoke the handle, close the channel, end in `Closed`. Idempotent.
    pub async fn disconnect(&self) {
        let link = {
            let mut inner = self.lock();
            if matches!(
                inner.state,
                ConnectionState::Closing | ConnectionState::Closed
            ) {
                return;
            }
            inner.state = ConnectionState::Closing;
            self.publish(&inner);
            inner.link.take()
        };

        if let Some(link) = link {
            link.revoker.revoke();
            link.channel.close().await;
        }

        let mut inner = self.lock();
        inner.state = ConnectionState::Closed;
        self.publish(&inner);
        info!(event = "disconnected");
    }

    /// The transport reported the link gone. Moves to `Error`; the user may
    /// retry with `connect_to` or finish with `disconnect`.
    pub async fn link_lost(&self, cause: &str) {
        let link = {
            let mut inner = self.lock();
            if inner.state != ConnectionState::Connected {
                return;
            }
            inner.state = ConnectionState::Error;
            inner.error = Some(cause.to_owned());
            self.publish(&inner);
            inner.link.take()
        };
        warn!(event = "link_lost", cause);
        if let Some(link) = link {
            link.revoker.revoke();
            link.channel.close().await;
        }
    }

    /// Clear the reported error without touching the connection.
    pub fn acknowledge_error(&self) {
        let mut inner = self.lock();
        if inner.error.take().is_some() {
            self.publish(&inner);
        }
    }
}

fn snapshot_of(inner: &Inner) -> PeerConnectionState {
    PeerConnectionState {
        self_id: inner.self_id.clone(),
        share_token: inner.share_token.clone(),
        remote_id: inner.remote_id.clone(),
        is_connected: inner.state == ConnectionState::Connected,
        error: inner.error.clone(),
        state: inner.state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::loopback::{LoopbackEndpoint, LoopbackNetwork};

    fn manager(endpoint: &Arc<LoopbackEndpoint>, timeout: Duration) -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(
            endpoint.clone(),
            endpoint.clone(),
            timeout,
        ))
    }

    async fn connected_pair() -> (
        LoopbackNetwork,
        Arc<ConnectionManager>,
        Arc<ConnectionManager>,
        Established,
        Established,
    ) {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        let guest = manager(&net.endpoint(), Duration::from_secs(5));
        host.begin_negotiation(Some("host")).await.unwrap();

        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        let g = guest.connect_to("host").await.unwrap();
        let h = acceptor.await.unwrap().unwrap();
        (net, host, guest, h, g)
    }

    #[tokio::test]
    async fn negotiation_assigns_immutable_id() {
        let net = LoopbackNetwork::new();
        let mgr = manager(&net.endpoint(), Duration::from_secs(5));
        let token = mgr.begin_negotiation(None).await.unwrap();

        let snap = mgr.snapshot();
        assert_eq!(snap.state, ConnectionState::Negotiating);
        let id = snap.self_id.unwrap();
        assert_eq!(id.len(), 32);
        assert_eq!(token, format!("loopback://{id}"));

        assert!(matches!(
            mgr.begin_negotiation(Some("other")).await,
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(mgr.snapshot().self_id.unwrap(), id);
    }

    #[tokio::test]
    async fn connect_and_accept() {
        let (_net, host, guest, mut h, g) = connected_pair().await;
        assert!(host.snapshot().is_connected);
        assert!(guest.snapshot().is_connected);
        assert_eq!(g.remote_id, "host");

        g.handle.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(h.incoming.recv().await.unwrap(), Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn second_connect_is_rejected_without_dialing() {
        let (net, _host, guest, _h, _g) = connected_pair().await;
        let dials = net.dial_count();
        assert!(matches!(
            guest.connect_to("host").await,
            Err(EngineError::AlreadyConnected)
        ));
        assert_eq!(net.dial_count(), dials);
    }

    #[tokio::test]
    async fn unknown_peer_sets_error_and_is_retryable() {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        let guest = manager(&net.endpoint(), Duration::from_secs(5));

        assert!(matches!(
            guest.connect_to("host").await,
            Err(EngineError::PeerNotFound(_))
        ));
        let snap = guest.snapshot();
        assert_eq!(snap.state, ConnectionState::Error);
        assert!(snap.error.unwrap().contains("peer not found"));

        host.begin_negotiation(Some("host")).await.unwrap();
        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        guest.connect_to("host").await.unwrap();
        acceptor.await.unwrap().unwrap();
        let snap = guest.snapshot();
        assert!(snap.is_connected);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn rejected_handshake_reports_error_and_retry_succeeds() {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        let guest = manager(&net.endpoint(), Duration::from_secs(5));
        host.begin_negotiation(Some("host")).await.unwrap();
        net.reject_dials(Some("busy"));

        assert!(matches!(
            guest.connect_to("host").await,
            Err(EngineError::HandshakeFailed(reason)) if reason == "busy"
        ));
        let snap = guest.snapshot();
        assert_eq!(snap.state, ConnectionState::Error);
        assert!(!snap.is_connected);
        assert!(snap.error.is_some_and(|e| e.contains("busy")));
        assert_eq!(host.snapshot().state, ConnectionState::Negotiating);

        net.reject_dials(None);
        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        let g = guest.connect_to("host").await.unwrap();
        acceptor.await.unwrap().unwrap();
        assert_eq!(g.remote_id, "host");
        let snap = guest.snapshot();
        assert!(snap.is_connected);
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn listener_renegotiates_with_same_id_after_link_loss() {
        let (net, host, guest, _h, _g) = connected_pair().await;
        guest.disconnect().await;
        host.link_lost("peer closed the channel").await;
        assert_eq!(host.snapshot().state, ConnectionState::Error);

        assert!(matches!(
            host.begin_negotiation(Some("elsewhere")).await,
            Err(EngineError::InvalidState(_))
        ));
        let token = host.begin_negotiation(None).await.unwrap();
        assert_eq!(token, "loopback://host");
        let snap = host.snapshot();
        assert_eq!(snap.state, ConnectionState::Negotiating);
        assert_eq!(snap.self_id.as_deref(), Some("host"));
        assert!(snap.remote_id.is_none());
        assert!(snap.error.is_none());

        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        let newcomer = manager(&net.endpoint(), Duration::from_secs(5));
        newcomer.connect_to("host").await.unwrap();
        acceptor.await.unwrap().unwrap();
        assert!(host.snapshot().is_connected);
    }

    #[tokio::test]
    async fn foreign_endpoint_cannot_take_over_an_id() {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        let squatter = manager(&net.endpoint(), Duration::from_secs(5));
        host.begin_negotiation(Some("host")).await.unwrap();

        assert!(matches!(
            squatter.begin_negotiation(Some("host")).await,
            Err(EngineError::InvalidState(_))
        ));
        assert_eq!(squatter.snapshot().state, ConnectionState::Idle);
    }

    #[tokio::test]
    async fn stalled_handshake_times_out() {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        let guest = manager(&net.endpoint(), Duration::from_millis(50));
        host.begin_negotiation(Some("host")).await.unwrap();
        net.stall_dials(true);

        assert_eq!(
            guest.connect_to("host").await.err(),
            Some(EngineError::HandshakeTimeout)
        );
        assert_eq!(guest.snapshot().state, ConnectionState::Error);
    }

    #[tokio::test]
    async fn signaling_outage_is_reported() {
        let net = LoopbackNetwork::new();
        let mgr = manager(&net.endpoint(), Duration::from_secs(5));
        net.set_signaling_available(false);

        assert!(matches!(
            mgr.begin_negotiation(None).await,
            Err(EngineError::SignalingUnavailable(_))
        ));
        let snap = mgr.snapshot();
        assert_eq!(snap.state, ConnectionState::Idle);
        assert!(snap.self_id.is_none());
        assert!(snap.error.is_some());

        mgr.acknowledge_error();
        assert!(mgr.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn disconnect_revokes_handle_and_is_idempotent() {
        let (_net, host, guest, mut h, g) = connected_pair().await;
        let mut states = guest.subscribe();

        guest.disconnect().await;
        assert_eq!(guest.snapshot().state, ConnectionState::Closed);
        assert!(states.has_changed().unwrap());
        assert_eq!(states.borrow_and_update().state, ConnectionState::Closed);

        assert_eq!(
            g.handle.send(Bytes::from_static(b"late")).await,
            Err(EngineError::ChannelRevoked)
        );
        // Peer sees the stream end.
        assert!(h.incoming.recv().await.is_none());

        guest.disconnect().await;
        assert_eq!(guest.snapshot().state, ConnectionState::Closed);
        assert!(matches!(
            guest.connect_to("host").await,
            Err(EngineError::InvalidState(_))
        ));

        host.link_lost("peer closed the channel").await;
        let snap = host.snapshot();
        assert_eq!(snap.state, ConnectionState::Error);
        assert!(h.handle.is_revoked());
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_accept() {
        let net = LoopbackNetwork::new();
        let host = manager(&net.endpoint(), Duration::from_secs(5));
        host.begin_negotiation(Some("host")).await.unwrap();
        let acceptor = {
            let host = host.clone();
            tokio::spawn(async move { host.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        host.disconnect().await;
        assert!(acceptor.await.unwrap().is_err());
        assert_eq!(host.snapshot().state, ConnectionState::Closed);
    }
}
