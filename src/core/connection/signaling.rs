//! Seams to the out-of-band collaborators: the signaling service that
//! carries small opaque descriptors between peers, and the transport that
//! turns those descriptors into a live [`Link`].

use super::channel::Link;
use crate::core::error::EngineError;
use async_trait::async_trait;
use bytes::Bytes;

/// Delivers an opaque descriptor from one peer to the other.
///
/// Both calls are request/response and may fail with
/// [`EngineError::SignalingUnavailable`] or [`EngineError::PeerNotFound`].
#[async_trait]
pub trait Signaling: Send + Sync {
    /// Publish `descriptor` under `self_id`. Returns the token the user hands
    /// to the peer (a code, a link, or just the id).
    async fn publish_local_descriptor(
        &self,
        self_id: &str,
        descriptor: Bytes,
    ) -> Result<String, EngineError>;

    /// Look up whatever the peer published under `remote_id`.
    async fn fetch_remote_descriptor(&self, remote_id: &str) -> Result<Bytes, EngineError>;
}

/// Establishes the channel itself.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Produce this endpoint's connection material for `self_id`.
    async fn prepare(&self, self_id: &str) -> Result<Bytes, EngineError>;

    /// Complete a handshake toward the peer that published `descriptor`.
    async fn dial(&self, remote_id: &str, descriptor: Bytes) -> Result<Link, EngineError>;

    /// Wait for a peer to complete a handshake toward us.
    async fn accept(&self) -> Result<Link, EngineError>;
}
