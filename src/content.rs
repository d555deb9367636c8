//! Source content loading.
//!
//! A source is read exactly once, feeding a hasher and a size counter in
//! the same pass. Small sources stay in memory; once the buffering
//! threshold is crossed the buffer is dropped and the content becomes a
//! re-openable stream over the original path.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use futures_util::stream::{self, BoxStream, StreamExt};
use seahash::SeaHasher;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::error::{EngineError, Result};

/// Maximum content size held in memory. Larger sources are re-read from
/// disk on demand.
pub const MAX_BUFFERED_SIZE: u64 = 5 * 1024 * 1024;

const READ_CHUNK: usize = 64 * 1024;

/// Format a 64-bit hash the way it is used in cache keys and file names.
pub(crate) fn hex64(hash: u64) -> String {
    format!("{hash:016x}")
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> u64 {
    let mut hasher = SeaHasher::new();
    hasher.write(bytes);
    hasher.finish()
}

/// The bytes of an asset, either materialized or re-openable.
#[derive(Debug, Clone)]
pub enum AssetContent {
    /// Fully materialized content.
    Buffer(Bytes),
    /// A handle over the original path; reads re-open the file.
    Stream(PathBuf),
}

impl AssetContent {
    /// Materialize the content, buffering a stream if needed.
    pub async fn to_bytes(&self) -> Result<Bytes> {
        match self {
            Self::Buffer(bytes) => Ok(bytes.clone()),
            Self::Stream(path) => tokio::fs::read(path)
                .await
                .map(Bytes::from)
                .map_err(|source| EngineError::ContentRead {
                    path: path.clone(),
                    source,
                }),
        }
    }

    /// Open the content as a byte stream without materializing it.
    pub async fn open_stream(&self) -> Result<BoxStream<'static, std::io::Result<Bytes>>> {
        match self {
            Self::Buffer(bytes) => Ok(stream::iter([Ok(bytes.clone())]).boxed()),
            Self::Stream(path) => {
                let file = File::open(path)
                    .await
                    .map_err(|source| EngineError::ContentRead {
                        path: path.clone(),
                        source,
                    })?;
                Ok(ReaderStream::new(file).boxed())
            }
        }
    }

    /// Hash and size of the content, computed without buffering streams.
    pub(crate) async fn fingerprint(&self) -> Result<(u64, u64)> {
        match self {
            Self::Buffer(bytes) => Ok((hash_bytes(bytes), bytes.len() as u64)),
            Self::Stream(path) => {
                let mut file = File::open(path)
                    .await
                    .map_err(|source| EngineError::ContentRead {
                        path: path.clone(),
                        source,
                    })?;
                let mut hasher = SeaHasher::new();
                let mut size = 0u64;
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    let n = file
                        .read(&mut chunk)
                        .await
                        .map_err(|source| EngineError::ContentRead {
                            path: path.clone(),
                            source,
                        })?;
                    if n == 0 {
                        break;
                    }
                    hasher.write(&chunk[..n]);
                    size += n as u64;
                }
                Ok((hasher.finish(), size))
            }
        }
    }
}

/// A loaded source: content, size, and the hash over its exact bytes.
///
/// The hash is authoritative for the life of the request; re-opens of a
/// stream are not re-verified against it.
#[derive(Debug, Clone)]
pub struct SourceContent {
    pub content: AssetContent,
    pub size: u64,
    pub hash: u64,
}

impl SourceContent {
    /// Hash and wrap an inline code blob.
    pub fn from_inline(code: &str) -> Self {
        Self {
            content: AssetContent::Buffer(Bytes::copy_from_slice(code.as_bytes())),
            size: code.len() as u64,
            hash: hash_bytes(code.as_bytes()),
        }
    }

    /// Read a source file once, hashing and counting while buffering up
    /// to [`MAX_BUFFERED_SIZE`]. Crossing the threshold discards the
    /// buffer; the content then re-opens the file on demand.
    #[tracing::instrument(level = "trace")]
    pub async fn from_file(path: &Path) -> Result<Self> {
        let read_err = |source| EngineError::ContentRead {
            path: path.to_owned(),
            source,
        };

        let mut file = File::open(path).await.map_err(read_err)?;
        let mut hasher = SeaHasher::new();
        let mut size = 0u64;
        let mut buffer = Some(BytesMut::new());
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let n = file.read(&mut chunk).await.map_err(read_err)?;
            if n == 0 {
                break;
            }
            hasher.write(&chunk[..n]);
            size += n as u64;
            if let Some(buf) = buffer.as_mut() {
                if size > MAX_BUFFERED_SIZE {
                    buffer = None;
                } else {
                    buf.extend_from_slice(&chunk[..n]);
                }
            }
        }

        let content = match buffer {
            Some(buf) => AssetContent::Buffer(buf.freeze()),
            None => AssetContent::Stream(path.to_owned()),
        };
        Ok(Self {
            content,
            size,
            hash: hasher.finish(),
        })
    }
}
