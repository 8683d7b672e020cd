//! Byte sources: what a staged file reads from.
//!
//! A source announces its length up front (that value goes into the
//! Metadata frame) and then yields chunks until it runs dry. Nothing here
//! trusts the announcement; the sender checks the bytes it actually got.

use crate::core::config::DEFAULT_MIME_TYPE;
use crate::core::error::EngineError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use std::path::Path;
use tokio::io::AsyncReadExt;

#[async_trait]
pub trait ByteSource: Send {
    /// Length announced to the peer.
    fn byte_length(&self) -> u64;

    /// Read up to `max` bytes. `Ok(None)` at end of input.
    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>>;
}

/// A source backed by a buffer already in memory.
pub struct MemorySource {
    data: Bytes,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }
}

#[async_trait]
impl ByteSource for MemorySource {
    fn byte_length(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        if self.data.is_empty() {
            return Ok(None);
        }
        let n = max.min(self.data.len());
        Ok(Some(self.data.split_to(n)))
    }
}

/// A source reading a file on disk.
///
/// The length is taken from the file's metadata when opened. A file that
/// grows or shrinks afterwards makes the transfer fail with a length
/// mismatch rather than send something other than what was announced.
pub struct FileSource {
    file: tokio::fs::File,
    byte_length: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let meta = file.metadata().await?;
        if !meta.is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            ));
        }
        Ok(Self {
            file,
            byte_length: meta.len(),
        })
    }
}

#[async_trait]
impl ByteSource for FileSource {
    fn byte_length(&self) -> u64 {
        self.byte_length
    }

    async fn read_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(max);
        // Fill the whole chunk unless the file ends first.
        while buf.len() < max {
            let n = (&mut self.file).take((max - buf.len()) as u64).read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        if buf.is_empty() {
            Ok(None)
        } else {
            Ok(Some(buf.freeze()))
        }
    }
}

/// A file selected for sending: display name, MIME type and its bytes.
pub struct StagedFile {
    pub file_name: String,
    pub mime_type: String,
    pub source: Box<dyn ByteSource>,
}

impl StagedFile {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: Option<&str>,
        source: Box<dyn ByteSource>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type
                .filter(|m| !m.is_empty())
                .unwrap_or(DEFAULT_MIME_TYPE)
                .to_string(),
            source,
        }
    }

    pub fn from_bytes(
        file_name: impl Into<String>,
        mime_type: Option<&str>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self::new(file_name, mime_type, Box::new(MemorySource::new(data)))
    }

    /// Stage a file from disk, guessing the MIME type from its extension.
    pub async fn open(path: &Path) -> Result<Self, EngineError> {
        let source = FileSource::open(path)
            .await
            .map_err(|e| EngineError::Source(format!("{}: {e}", path.display())))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| EngineError::Source(format!("{} has no file name", path.display())))?;
        let mime = mime_guess::from_path(path).first_raw();
        Ok(Self::new(file_name, mime, Box::new(source)))
    }

    pub fn byte_length(&self) -> u64 {
        self.source.byte_length()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir()
            .join("dropwire_test")
            .join("source")
            .join(name);
        let _ = std::fs::create_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn memory_source_splits_into_chunks() {
        let mut src = MemorySource::new(vec![7u8; 10]);
        assert_eq!(src.byte_length(), 10);
        assert_eq!(src.read_chunk(4).await.unwrap().unwrap().len(), 4);
        assert_eq!(src.read_chunk(4).await.unwrap().unwrap().len(), 4);
        assert_eq!(src.read_chunk(4).await.unwrap().unwrap().len(), 2);
        assert!(src.read_chunk(4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_source_fills_chunks() {
        let dir = test_dir("fills");
        let path = dir.join("photo.png");
        std::fs::write(&path, vec![1u8; 1000]).unwrap();

        let mut staged = StagedFile::open(&path).await.unwrap();
        assert_eq!(staged.file_name, "photo.png");
        assert_eq!(staged.mime_type, "image/png");
        assert_eq!(staged.byte_length(), 1000);

        let mut total = 0;
        while let Some(chunk) = staged.source.read_chunk(256).await.unwrap() {
            assert!(chunk.len() <= 256);
            total += chunk.len();
        }
        assert_eq!(total, 1000);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn unknown_extension_defaults_mime() {
        let dir = test_dir("mime");
        let path = dir.join("blob.zzqq");
        std::fs::write(&path, b"x").unwrap();
        let staged = StagedFile::open(&path).await.unwrap();
        assert_eq!(staged.mime_type, DEFAULT_MIME_TYPE);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn missing_file_is_a_source_error() {
        let path = test_dir("missing").join("nope.bin");
        assert!(matches!(
            StagedFile::open(&path).await,
            Err(EngineError::Source(_))
        ));
    }
}
