//! Backpressure gate in front of the channel.
//!
//! The [`FlowController`] is the only writer on a connection. Metadata and
//! Data frames pass through the permission gate; Control frames skip the
//! gate but are serialized with every other write, so a completion or abort
//! never overtakes data already handed to the channel.

use crate::core::config::EngineConfig;
use crate::core::connection::ChannelHandle;
use crate::core::error::EngineError;
use crate::core::protocol::{encode, Frame};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Counters of what went out on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WireStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    /// How many times senders were suspended at the high-water mark.
    pub pauses: u64,
}

#[derive(Default)]
struct Counters {
    frames: AtomicU64,
    bytes: AtomicU64,
    pauses: AtomicU64,
}

pub struct FlowController {
    handle: ChannelHandle,
    high_water_mark: usize,
    low_water_mark: usize,
    poll_interval: Duration,
    /// `true` while suspended between the high and the low mark. Held for
    /// the whole permission wait plus write, which queues data senders in
    /// FIFO order.
    gate: Mutex<bool>,
    write: Mutex<()>,
    counters: Counters,
}

impl FlowController {
    pub fn new(handle: ChannelHandle, config: &EngineConfig) -> Self {
        Self {
            handle,
            high_water_mark: config.high_water_mark,
            low_water_mark: config.low_water_mark,
            poll_interval: config.flow_poll_interval(),
            gate: Mutex::new(false),
            write: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// Write one frame. Control frames are never held back.
    pub async fn send(&self, frame: &Frame) -> Result<(), EngineError> {
        match frame {
            Frame::Control { .. } => self.write(frame).await,
            Frame::Metadata(_) | Frame::Data { .. } => {
                let mut paused = self.gate.lock().await;
                self.await_send_permission(&mut paused).await?;
                self.write(frame).await
            }
        }
    }

    /// Suspend while the outbound buffer is at or above the high-water mark.
    /// Once suspended, resume only at or below the low-water mark.
    async fn await_send_permission(&self, paused: &mut bool) -> Result<(), EngineError> {
        loop {
            let buffered = self.handle.buffered_amount().await?;
            if *paused {
                if buffered <= self.low_water_mark {
                    *paused = false;
                    info!(event = "flow_resumed", buffered, low_water = self.low_water_mark);
                    return Ok(());
                }
            } else if buffered < self.high_water_mark {
                return Ok(());
            } else {
                *paused = true;
                self.counters.pauses.fetch_add(1, Ordering::Relaxed);
                info!(
                    event = "flow_paused",
                    buffered,
                    high_water = self.high_water_mark,
                    "Applying backpressure - waiting for buffer to drain"
                );
            }

            tokio::select! {
                _ = self.handle.revoked() => return Err(EngineError::ChannelRevoked),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn write(&self, frame: &Frame) -> Result<(), EngineError> {
        let bytes = encode(frame);
        let len = bytes.len() as u64;
        let _write = self.write.lock().await;
        self.handle.send(bytes).await?;
        self.counters.frames.fetch_add(1, Ordering::Relaxed);
        self.counters.bytes.fetch_add(len, Ordering::Relaxed);
        debug!(event = "frame_sent", transfer_id = %frame.transfer_id(), bytes = len);
        Ok(())
    }

    pub fn is_revoked(&self) -> bool {
        self.handle.is_revoked()
    }

    /// Resolves when the underlying handle is revoked.
    pub async fn revoked(&self) {
        self.handle.revoked().await
    }

    pub fn stats(&self) -> WireStats {
        WireStats {
            frames_sent: self.counters.frames.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes.load(Ordering::Relaxed),
            pauses: self.counters.pauses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::channel::lend;
    use crate::core::connection::channel::Channel;
    use crate::core::connection::loopback::LoopbackChannel;
    use crate::core::protocol::ControlKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use uuid::Uuid;

    fn config(high: usize, low: usize) -> EngineConfig {
        EngineConfig {
            high_water_mark: high,
            low_water_mark: low,
            flow_poll_interval_ms: 1,
            ..Default::default()
        }
    }

    fn data(id: Uuid, seq: u32, len: usize) -> Frame {
        Frame::Data {
            transfer_id: id,
            seq,
            payload: Bytes::from(vec![0u8; len]),
        }
    }

    #[tokio::test]
    async fn passes_through_below_high_water() {
        let ((chan, _a), (_peer, mut b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan.clone());
        let flow = FlowController::new(handle, &config(1 << 20, 1 << 10));

        let id = Uuid::new_v4();
        for seq in 0..4 {
            flow.send(&data(id, seq, 100)).await.unwrap();
        }
        for _ in 0..4 {
            b.incoming.recv().await.unwrap();
        }
        let stats = flow.stats();
        assert_eq!(stats.frames_sent, 4);
        assert_eq!(stats.bytes_sent, 4 * (21 + 100));
        assert_eq!(stats.pauses, 0);
    }

    /// Test channel whose buffered amount is set by hand.
    #[derive(Default)]
    struct GaugeChannel {
        buffered: AtomicUsize,
        sent: AtomicU64,
    }

    #[async_trait]
    impl Channel for GaugeChannel {
        async fn send(&self, _message: Bytes) -> Result<(), EngineError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        async fn close(&self) {}
    }

    /// Sender suspended under high occupancy emits nothing until the buffer
    /// drains to the low-water mark.
    #[tokio::test]
    async fn hysteresis_holds_until_low_water() {
        let gauge = Arc::new(GaugeChannel::default());
        let (handle, _revoker) = lend(gauge.clone());
        let flow = Arc::new(FlowController::new(handle, &config(1000, 300)));
        let id = Uuid::new_v4();

        flow.send(&data(id, 0, 10)).await.unwrap();
        assert_eq!(gauge.sent.load(Ordering::SeqCst), 1);

        gauge.buffered.store(1000, Ordering::SeqCst);
        let blocked = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(&data(id, 1, 10)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());

        // Below high but above low: still suspended.
        gauge.buffered.store(500, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished());
        assert_eq!(gauge.sent.load(Ordering::SeqCst), 1);

        gauge.buffered.store(300, Ordering::SeqCst);
        blocked.await.unwrap().unwrap();
        assert_eq!(gauge.sent.load(Ordering::SeqCst), 2);
        assert_eq!(flow.stats().pauses, 1);

        // Resumed: 500 is below the high mark again.
        gauge.buffered.store(500, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_millis(200), flow.send(&data(id, 2, 10)))
            .await
            .expect("resumed sender was held")
            .unwrap();
        assert_eq!(gauge.sent.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn control_frames_bypass_the_gate() {
        let ((chan, _a), (_peer, _b)) = LoopbackChannel::pair("b", "a");
        let (handle, _revoker) = lend(chan.clone());
        let flow = FlowController::new(handle, &config(100, 10));
        let id = Uuid::new_v4();

        chan.hold();
        flow.send(&data(id, 0, 200)).await.unwrap();
        assert!(chan.buffered() >= 100);

        tokio::time::timeout(
            Duration::from_millis(200),
            flow.send(&Frame::control(id, ControlKind::Abort)),
        )
        .await
        .expect("control frame was gated")
        .unwrap();
        assert_eq!(chan.frames_sent(), 2);
    }

    #[tokio::test]
    async fn revocation_ends_the_wait() {
        let ((chan, _a), (_peer, _b)) = LoopbackChannel::pair("b", "a");
        let (handle, revoker) = lend(chan.clone());
        let flow = Arc::new(FlowController::new(handle, &config(100, 10)));
        let id = Uuid::new_v4();

        chan.hold();
        flow.send(&data(id, 0, 200)).await.unwrap();
        let blocked = {
            let flow = flow.clone();
            tokio::spawn(async move { flow.send(&data(id, 1, 200)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        revoker.revoke();
        assert_eq!(blocked.await.unwrap(), Err(EngineError::ChannelRevoked));
        assert_eq!(chan.frames_sent(), 1);
    }
}
