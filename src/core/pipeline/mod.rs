//! Transfer pipeline: byte sources and the read-ahead reader feeding senders.

pub mod sender;
pub mod source;

pub use sender::spawn_reader;
pub use source::{ByteSource, StagedFile};
