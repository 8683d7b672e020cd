//! Transfer engine: connection lifecycle, wire codec, flow control,
//! per-file sessions and the transfer queue.

pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod flow;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod session;
