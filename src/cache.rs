//! Content-addressed artifact and blob store.
//!
//! Two flat namespaces under the cache directory: `blobs/` holds
//! committed asset bytes keyed by output hash, `artifacts/` holds
//! serialized asset lists keyed by cache key. The store is append-only
//! with last-writer-wins semantics; concurrent writers under the same
//! key agree on the value because the key encodes full input identity.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::asset::Asset;
use crate::error::{EngineError, Result};

const BLOB_DIR: &str = "blobs";
const ARTIFACT_DIR: &str = "artifacts";

/// Registry tag embedded in artifact envelopes. Records written by a
/// different package version miss instead of deserializing.
fn registry_tag() -> String {
    format!("{}:AssetList", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Serialize, Deserialize)]
struct ArtifactEnvelope {
    registry: String,
    assets: Vec<Asset>,
}

/// Process-wide content-addressed store under the cache directory.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    blob_dir: PathBuf,
    artifact_dir: PathBuf,
}

impl ArtifactCache {
    pub async fn new(cache_dir: &Path) -> Result<Self> {
        let blob_dir = cache_dir.join(BLOB_DIR);
        let artifact_dir = cache_dir.join(ARTIFACT_DIR);
        for dir in [&blob_dir, &artifact_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| EngineError::CacheIo {
                    path: dir.clone(),
                    source,
                })?;
        }
        Ok(Self {
            blob_dir,
            artifact_dir,
        })
    }

    /// Read a blob. Failures degrade to a miss.
    pub async fn get_blob(&self, key: &str) -> Option<Bytes> {
        read_or_miss(self.blob_dir.join(key), key)
            .await
            .map(Bytes::from)
    }

    /// Write a blob under its content key. Failures are fatal: they would
    /// leave a committed asset without its bytes.
    pub async fn set_blob(&self, key: &str, bytes: &[u8]) -> Result<()> {
        write_atomic(self.blob_dir.join(key), bytes).await
    }

    /// Read a serialized asset list. Failures and version mismatches
    /// degrade to a miss.
    pub async fn get_assets(&self, key: &str) -> Option<Vec<Asset>> {
        let bytes = read_or_miss(self.artifact_dir.join(key), key).await?;
        let envelope: ArtifactEnvelope = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::warn!(%key, %err, "artifact deserialization failed, treating as miss");
                return None;
            }
        };
        if envelope.registry != registry_tag() {
            tracing::debug!(%key, registry = %envelope.registry, "artifact version mismatch");
            return None;
        }
        Some(envelope.assets)
    }

    /// Write a serialized asset list under a cache key.
    pub async fn set_assets(&self, key: &str, assets: &[Asset]) -> Result<()> {
        let path = self.artifact_dir.join(key);
        let envelope = ArtifactEnvelope {
            registry: registry_tag(),
            assets: assets.to_vec(),
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|err| EngineError::CacheIo {
            path: path.clone(),
            source: std::io::Error::other(err),
        })?;
        write_atomic(path, &bytes).await
    }
}

async fn read_or_miss(path: PathBuf, key: &str) -> Option<Vec<u8>> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Some(bytes),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => {
            tracing::warn!(%key, %err, "cache read failed, treating as miss");
            None
        }
    }
}

// Temp-file plus rename so readers never observe a partial write.
async fn write_atomic(path: PathBuf, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    let io_err = |source| EngineError::CacheIo {
        path: path.clone(),
        source,
    };
    tokio::fs::write(&tmp, bytes).await.map_err(io_err)?;
    tokio::fs::rename(&tmp, &path).await.map_err(io_err)
}
