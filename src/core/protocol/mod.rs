//! Wire protocol: frame kinds and the binary chunk codec.

pub mod frame;

pub use frame::{decode, encode, peek_transfer_id, ControlKind, FileMetadata, Frame, TransferId};
