pub mod channel;
pub mod loopback;
pub mod manager;
pub mod manual;
pub mod rtc;
pub mod signaling;

pub use channel::ChannelHandle;
pub use loopback::LoopbackNetwork;
pub use manager::{ConnectionManager, ConnectionState, Established, PeerConnectionState};
pub use manual::ManualSignaling;
pub use rtc::WebRtcTransport;
pub use signaling::{Signaling, Transport};
