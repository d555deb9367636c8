//! The mutable per-asset record and its committed form.
//!
//! An [`AssetStore`] owns all state of one asset while a pipeline runs
//! over it. Reads go through `&AssetStore`; mutation requires a
//! [`MutableAsset`], a borrow-scoped capability the pipeline hands to
//! transformer hooks for the duration of a call. Stores are deliberately
//! not thread-safe; a transformation request runs on a single task.

use std::collections::BTreeMap;
use std::hash::Hasher;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use seahash::SeaHasher;
use serde::{Deserialize, Serialize};

use crate::cache::ArtifactCache;
use crate::content::{hash_bytes, hex64, AssetContent, SourceContent};
use crate::dependency::{ConnectedFile, Dependency};
use crate::environment::Environment;
use crate::error::{EngineError, Result};
use crate::integrity::OutputDigest;
use crate::rt::RtcTransform;
use crate::transformer::{Ast, ChildAsset, GenerateOutput};

/// Timing and size statistics for one asset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetStats {
    /// Final content size in bytes.
    pub size: u64,
    /// Milliseconds spent in transformer hooks.
    pub time_ms: u64,
}

/// A committed, serializable asset record.
///
/// The final bytes live in the blob cache under `output_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub file_path: PathBuf,
    pub asset_type: String,
    pub env: Arc<Environment>,
    /// Hash over the source bytes the asset was built from.
    pub content_hash: String,
    /// Hash over the final bytes plus the impactful options.
    pub output_hash: String,
    /// `<alg>-<base64>` digest over the final bytes, if enabled.
    pub integrity: Option<String>,
    pub dependencies: Vec<Dependency>,
    pub connected_files: Vec<ConnectedFile>,
    /// Exported symbol name to local symbol name.
    pub symbols: BTreeMap<String, String>,
    pub side_effects: bool,
    pub is_isolated: bool,
    pub meta: serde_json::Map<String, serde_json::Value>,
    pub stats: AssetStats,
}

impl Asset {
    /// Read the committed bytes from the blob cache.
    pub async fn read_bytes(&self, cache: &ArtifactCache) -> Option<Bytes> {
        cache.get_blob(&self.output_hash).await
    }

    /// Read the committed bytes as a UTF-8 string.
    pub async fn read_code(&self, cache: &ArtifactCache) -> Option<String> {
        let bytes = self.read_bytes(cache).await?;
        String::from_utf8(bytes.to_vec()).ok()
    }
}

fn make_id(id_base: &str, asset_type: &str, env: &Environment) -> String {
    use std::hash::Hash;
    let mut hasher = SeaHasher::new();
    hasher.write(id_base.as_bytes());
    hasher.write(asset_type.as_bytes());
    env.hash(&mut hasher);
    hex64(hasher.finish())
}

/// The mutable state of a single asset within a pipeline run.
#[derive(Debug)]
pub struct AssetStore {
    id: String,
    file_path: PathBuf,
    asset_type: String,
    env: Arc<Environment>,
    content: AssetContent,
    size: u64,
    content_hash: u64,
    ast: Option<Ast>,
    map: Option<serde_json::Value>,
    dependencies: Vec<Dependency>,
    connected_files: Vec<ConnectedFile>,
    symbols: BTreeMap<String, String>,
    side_effects: bool,
    is_isolated: bool,
    meta: serde_json::Map<String, serde_json::Value>,
    stats: AssetStats,
    output_hash: Option<String>,
    integrity: Option<String>,
    frozen: bool,
}

impl AssetStore {
    /// Construct the initial store for a request.
    pub(crate) fn new(
        id_base: String,
        file_path: PathBuf,
        asset_type: String,
        env: Arc<Environment>,
        source: SourceContent,
        side_effects: bool,
    ) -> Self {
        let id = make_id(&id_base, &asset_type, &env);
        Self {
            id,
            file_path,
            asset_type,
            env,
            content: source.content,
            size: source.size,
            content_hash: source.hash,
            ast: None,
            map: None,
            dependencies: Vec::new(),
            connected_files: Vec::new(),
            symbols: BTreeMap::new(),
            side_effects,
            is_isolated: false,
            meta: serde_json::Map::new(),
            stats: AssetStats::default(),
            output_hash: None,
            integrity: None,
            frozen: false,
        }
    }

    /// Build a store from a child descriptor, inheriting environment,
    /// side effects, dependencies and connected files from the parent.
    pub(crate) async fn from_child(
        id_base: String,
        file_path: PathBuf,
        parent_env: Arc<Environment>,
        parent_side_effects: bool,
        mut dependencies: Vec<Dependency>,
        mut connected_files: Vec<ConnectedFile>,
        child: ChildAsset,
    ) -> Result<Self> {
        let env = child.env.unwrap_or(parent_env);
        let side_effects = child.side_effects.unwrap_or(parent_side_effects);
        let (content_hash, size) = child.content.fingerprint().await?;
        dependencies.extend(child.dependencies);
        connected_files.extend(child.connected_files);
        let id = make_id(&id_base, &child.asset_type, &env);
        Ok(Self {
            id,
            file_path,
            asset_type: child.asset_type,
            env,
            content: child.content,
            size,
            content_hash,
            ast: child.ast,
            map: None,
            dependencies,
            connected_files,
            symbols: child.symbols,
            side_effects,
            is_isolated: child.is_isolated,
            meta: child.meta,
            stats: AssetStats::default(),
            output_hash: None,
            integrity: None,
            frozen: false,
        })
    }

    /// Build a child store of this asset.
    pub(crate) async fn create_child(&self, child: ChildAsset) -> Result<Self> {
        Self::from_child(
            format!("{}:{}", self.id, child.asset_type),
            self.file_path.clone(),
            self.env.clone(),
            self.side_effects,
            self.dependencies.clone(),
            self.connected_files.clone(),
            child,
        )
        .await
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn asset_type(&self) -> &str {
        &self.asset_type
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn content(&self) -> &AssetContent {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Hash over the source bytes; authoritative for the life of the
    /// request, not recomputed on mutation.
    pub fn content_hash(&self) -> u64 {
        self.content_hash
    }

    pub fn ast(&self) -> Option<&Ast> {
        self.ast.as_ref()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    pub fn connected_files(&self) -> &[ConnectedFile] {
        &self.connected_files
    }

    pub fn symbols(&self) -> &BTreeMap<String, String> {
        &self.symbols
    }

    pub fn side_effects(&self) -> bool {
        self.side_effects
    }

    pub fn is_isolated(&self) -> bool {
        self.is_isolated
    }

    pub fn meta(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.meta
    }

    pub fn stats(&self) -> &AssetStats {
        &self.stats
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Materialize the content as bytes, buffering a stream if needed.
    pub async fn get_buffer(&self) -> Result<Bytes> {
        self.content.to_bytes().await
    }

    /// Materialize the content as a UTF-8 string.
    pub async fn get_code(&self) -> Result<String> {
        let bytes = self.get_buffer().await?;
        String::from_utf8(bytes.to_vec()).map_err(|err| EngineError::ContentRead {
            path: self.file_path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        })
    }

    /// Open the content as a byte stream without materializing it.
    pub async fn get_stream(&self) -> Result<BoxStream<'static, std::io::Result<Bytes>>> {
        self.content.open_stream().await
    }

    pub fn get_map(&self) -> Option<&serde_json::Value> {
        self.map.as_ref()
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(EngineError::AssetFrozen {
                id: self.id.clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn take_ast(&mut self) -> Option<Ast> {
        self.ast.take()
    }

    pub(crate) fn set_ast_raw(&mut self, ast: Ast) {
        self.ast = Some(ast);
    }

    /// Write generated code back onto the asset and clear the AST.
    pub(crate) fn apply_generated(&mut self, output: GenerateOutput, source_maps: bool) {
        self.size = output.code.len() as u64;
        self.content = AssetContent::Buffer(output.code.into_bytes().into());
        self.map = if source_maps { output.map } else { None };
        self.ast = None;
    }

    pub(crate) fn stats_mut(&mut self) -> &mut AssetStats {
        &mut self.stats
    }

    /// Finalize the asset: hash the final bytes together with the
    /// impactful options, write the blob, and freeze the store.
    ///
    /// Commit is the engine's only content write point and is atomic per
    /// asset; committing twice is a programmer error.
    #[tracing::instrument(level = "trace", skip_all, fields(id = %self.id))]
    pub(crate) async fn commit(
        &mut self,
        cache: &ArtifactCache,
        options: &RtcTransform,
    ) -> Result<Asset> {
        self.ensure_mutable()?;
        debug_assert!(
            self.ast.is_none(),
            "pipeline must finalize ASTs before commit"
        );
        let bytes = self.get_buffer().await?;
        let mut hasher = SeaHasher::new();
        hasher.write(&bytes);
        hasher.write_u64(options.impactful_hash());
        let output_hash = hex64(hasher.finish());
        cache.set_blob(&output_hash, &bytes).await?;
        self.integrity = OutputDigest::generate_from(options.integrity, &bytes).to_integrity_value();
        self.stats.size = bytes.len() as u64;
        self.output_hash = Some(output_hash);
        self.frozen = true;
        Ok(self.as_committed())
    }

    fn as_committed(&self) -> Asset {
        Asset {
            id: self.id.clone(),
            file_path: self.file_path.clone(),
            asset_type: self.asset_type.clone(),
            env: self.env.clone(),
            content_hash: hex64(self.content_hash),
            output_hash: self.output_hash.clone().unwrap_or_default(),
            integrity: self.integrity.clone(),
            dependencies: self.dependencies.clone(),
            connected_files: self.connected_files.clone(),
            symbols: self.symbols.clone(),
            side_effects: self.side_effects,
            is_isolated: self.is_isolated,
            meta: self.meta.clone(),
            stats: self.stats.clone(),
        }
    }
}

/// Mutable capability over an [`AssetStore`].
///
/// Handed to transformer hooks for the duration of a call; reads go
/// through [`Deref`](std::ops::Deref) to the store.
pub struct MutableAsset<'a> {
    store: &'a mut AssetStore,
}

impl<'a> MutableAsset<'a> {
    pub(crate) fn new(store: &'a mut AssetStore) -> Self {
        Self { store }
    }

    /// Replace the content with a UTF-8 string.
    pub fn set_code(&mut self, code: impl Into<String>) -> Result<()> {
        self.store.ensure_mutable()?;
        let code = code.into();
        self.store.size = code.len() as u64;
        self.store.content = AssetContent::Buffer(code.into_bytes().into());
        Ok(())
    }

    /// Replace the content with raw bytes.
    pub fn set_buffer(&mut self, bytes: Bytes) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.size = bytes.len() as u64;
        self.store.content = AssetContent::Buffer(bytes);
        Ok(())
    }

    /// Replace the content with a re-openable stream over a path.
    pub fn set_stream(&mut self, path: PathBuf) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.content = AssetContent::Stream(path);
        Ok(())
    }

    pub fn set_ast(&mut self, ast: Ast) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.ast = Some(ast);
        Ok(())
    }

    /// Mutable access to the AST tree for in-place rewriting.
    pub fn ast_mut(&mut self) -> Result<Option<&mut Ast>> {
        self.store.ensure_mutable()?;
        Ok(self.store.ast.as_mut())
    }

    /// Retype the asset. A type change ends the asset's participation in
    /// the current pipeline.
    pub fn set_asset_type(&mut self, asset_type: impl Into<String>) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.asset_type = asset_type.into();
        Ok(())
    }

    pub fn set_map(&mut self, map: Option<serde_json::Value>) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.map = map;
        Ok(())
    }

    pub fn set_side_effects(&mut self, side_effects: bool) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.side_effects = side_effects;
        Ok(())
    }

    pub fn set_is_isolated(&mut self, is_isolated: bool) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.is_isolated = is_isolated;
        Ok(())
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: serde_json::Value) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.meta.insert(key.into(), value);
        Ok(())
    }

    pub fn set_symbol(&mut self, exported: impl Into<String>, local: impl Into<String>) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.symbols.insert(exported.into(), local.into());
        Ok(())
    }

    pub fn add_dependency(&mut self, dependency: Dependency) -> Result<()> {
        self.store.ensure_mutable()?;
        self.store.dependencies.push(dependency);
        Ok(())
    }

    /// Register an ancillary file whose contents influence this asset.
    pub async fn add_connected_file(&mut self, path: &Path) -> Result<()> {
        self.store.ensure_mutable()?;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| EngineError::ContentRead {
                path: path.to_owned(),
                source,
            })?;
        self.store.connected_files.push(ConnectedFile {
            path: path.to_owned(),
            hash: hex64(hash_bytes(&bytes)),
        });
        Ok(())
    }

    /// Find and read an ancillary config file for this asset, searching
    /// each directory from the asset upward to the project root. The file
    /// is registered as a connected file; JSON content is parsed, other
    /// content is returned as a string value.
    pub async fn get_config(
        &mut self,
        file_names: &[&str],
        project_root: &Path,
    ) -> Result<Option<serde_json::Value>> {
        self.store.ensure_mutable()?;
        let mut dir = self.store.file_path.parent();
        while let Some(current) = dir {
            for name in file_names {
                let candidate = current.join(name);
                let bytes = match tokio::fs::read(&candidate).await {
                    Ok(bytes) => bytes,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(source) => {
                        return Err(EngineError::ContentRead {
                            path: candidate,
                            source,
                        })
                    }
                };
                self.store.connected_files.push(ConnectedFile {
                    path: candidate.clone(),
                    hash: hex64(hash_bytes(&bytes)),
                });
                let value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                    serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
                });
                return Ok(Some(value));
            }
            if current == project_root {
                break;
            }
            dir = current.parent();
        }
        Ok(None)
    }
}

impl std::ops::Deref for MutableAsset<'_> {
    type Target = AssetStore;

    fn deref(&self) -> &Self::Target {
        self.store
    }
}
