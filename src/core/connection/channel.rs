//! The live pipe between two peers and the revocable handle lent to the
//! layers above the connection manager.

use crate::core::error::EngineError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// A message-oriented, ordered, reliable bidirectional pipe.
///
/// Implementations deliver every message passed to [`Channel::send`] to the
/// peer exactly once and in order; the engine fails transfers loudly if they
/// do not.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Queue one message for delivery.
    async fn send(&self, message: Bytes) -> Result<(), EngineError>;

    /// Bytes accepted by `send` that have not left the local buffer yet.
    async fn buffered_amount(&self) -> usize;

    /// Tear the pipe down. Further sends fail.
    async fn close(&self);
}

/// A freshly established connection as produced by a transport.
pub struct Link {
    /// Identifier of the remote endpoint, as far as the transport knows it.
    pub remote_id: String,
    pub channel: Arc<dyn Channel>,
    /// Inbound messages in arrival order. Ends when the peer goes away.
    pub incoming: mpsc::UnboundedReceiver<Bytes>,
}

/// Single-owner reference to the live channel.
///
/// Issued by the connection manager and revoked on disconnect. Every use
/// after revocation fails with [`EngineError::ChannelRevoked`], so nothing
/// can write through a handle that outlived its connection.
pub struct ChannelHandle {
    channel: Arc<dyn Channel>,
    revoked: watch::Receiver<bool>,
}

/// Manager-side switch that invalidates a [`ChannelHandle`].
pub(crate) struct Revoker {
    tx: watch::Sender<bool>,
}

/// Lend `channel` out: the handle goes up the stack, the revoker stays with
/// the manager.
pub(crate) fn lend(channel: Arc<dyn Channel>) -> (ChannelHandle, Revoker) {
    let (tx, rx) = watch::channel(false);
    (
        ChannelHandle {
            channel,
            revoked: rx,
        },
        Revoker { tx },
    )
}

impl Revoker {
    pub fn revoke(&self) {
        self.tx.send_replace(true);
    }
}

impl ChannelHandle {
    pub fn is_revoked(&self) -> bool {
        *self.revoked.borrow()
    }

    fn ensure_live(&self) -> Result<(), EngineError> {
        if self.is_revoked() {
            Err(EngineError::ChannelRevoked)
        } else {
            Ok(())
        }
    }

    pub async fn send(&self, message: Bytes) -> Result<(), EngineError> {
        self.ensure_live()?;
        self.channel.send(message).await
    }

    pub async fn buffered_amount(&self) -> Result<usize, EngineError> {
        self.ensure_live()?;
        Ok(self.channel.buffered_amount().await)
    }

    /// Resolves once the handle has been revoked (or its manager dropped).
    pub async fn revoked(&self) {
        let mut rx = self.revoked.clone();
        let _ = rx.wait_for(|revoked| *revoked).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::loopback::LoopbackChannel;

    #[tokio::test]
    async fn revoked_handle_fails_fast() {
        let ((channel, _link_a), (_peer, _link_b)) = LoopbackChannel::pair("a", "b");
        let (handle, revoker) = lend(channel.clone());

        handle.send(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(channel.frames_sent(), 1);

        revoker.revoke();
        handle.revoked().await;
        assert_eq!(
            handle.send(Bytes::from_static(b"y")).await,
            Err(EngineError::ChannelRevoked)
        );
        assert_eq!(handle.buffered_amount().await, Err(EngineError::ChannelRevoked));
        assert_eq!(channel.frames_sent(), 1);
    }
}
