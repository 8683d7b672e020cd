//! Sender pipeline: prefetches chunks from a byte source.
//!
//! ```text
//! ┌────────────┐   bounded chan   ┌───────────────┐
//! │ ByteSource │ ────────────────►│ Sender session │──► FlowController
//! │ (reader)   │  read_ahead deep │ (framing)      │
//! └────────────┘                  └───────────────┘
//! ```
//!
//! The reader task stays `read_ahead` chunks in front of the send loop so
//! the channel is not idle while the next chunk is being read.

use super::source::ByteSource;
use bytes::Bytes;
use std::io;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Consecutive empty reads tolerated before the source is declared stuck.
pub const MAX_EMPTY_READS: usize = 64;

/// Spawn a reader that pulls chunks of at most `chunk_size` bytes from
/// `source` into a bounded channel.
///
/// The channel closes after the last chunk. A read error is forwarded as the
/// final item, and so is a source that returns more than
/// [`MAX_EMPTY_READS`] empty chunks in a row. Dropping the receiver stops
/// the reader.
pub fn spawn_reader(
    mut source: Box<dyn ByteSource>,
    chunk_size: usize,
    read_ahead: usize,
) -> (mpsc::Receiver<io::Result<Bytes>>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(read_ahead.max(1));

    let handle = tokio::spawn(async move {
        let mut empty_reads = 0;
        loop {
            let item = match source.read_chunk(chunk_size).await {
                Ok(Some(chunk)) if chunk.is_empty() => {
                    empty_reads += 1;
                    if empty_reads <= MAX_EMPTY_READS {
                        continue;
                    }
                    Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("source returned {empty_reads} empty chunks in a row"),
                    ))
                }
                Ok(Some(chunk)) => {
                    empty_reads = 0;
                    Ok(chunk)
                }
                Ok(None) => break,
                Err(e) => Err(e),
            };
            let failed = item.is_err();
            // Stop if the send loop has been dropped.
            if tx.send(item).await.is_err() || failed {
                break;
            }
        }
    });

    (rx, handle)
}
