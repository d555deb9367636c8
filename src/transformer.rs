//! The transformer plugin contract.
//!
//! Every stage implements some subset of `{can_reuse_ast, parse,
//! transform, generate, post_process}`; absence is expressed through the
//! default methods and the `provides_*` probes. Transformers must be pure
//! with respect to global state; all I/O goes through the asset views and
//! the injected resolver.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::asset::{Asset, AssetStore, MutableAsset};
use crate::cache::ArtifactCache;
use crate::config::PluginConfig;
use crate::content::AssetContent;
use crate::dependency::{ConnectedFile, Dependency};
use crate::environment::Environment;
use crate::rt::RtcTransform;

/// A parsed representation of an asset's content.
///
/// Tagged with dialect and dialect version so stages can decide
/// compatibility. The tree is owned by the asset; a stage receiving the
/// asset may mutate it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    /// Dialect tag, e.g. `swc`.
    pub dialect: String,
    /// Dialect version; stages reject trees from incompatible versions.
    pub version: String,
    /// The tree itself.
    pub program: serde_json::Value,
}

impl Ast {
    pub fn new(
        dialect: impl Into<String>,
        version: impl Into<String>,
        program: serde_json::Value,
    ) -> Self {
        Self {
            dialect: dialect.into(),
            version: version.into(),
            program,
        }
    }
}

/// Code and optional source map emitted by a `generate` hook.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub code: String,
    pub map: Option<serde_json::Value>,
}

/// Resolver callback injected by the driver; defers to the external
/// resolver collaborator.
pub type Resolve = dyn Fn(&Path, &str) -> anyhow::Result<PathBuf> + Send + Sync;

/// Per-hook context handed to transformer stages.
pub struct TransformContext<'a> {
    /// The stage's preloaded config, if it declared one.
    pub config: Option<&'a PluginConfig>,
    pub options: &'a RtcTransform,
    pub resolve: &'a Resolve,
    /// Blob store holding committed bytes; lets `post_process` read the
    /// content of the finalized assets it receives.
    pub cache: &'a ArtifactCache,
}

/// A descriptor for a child asset emitted by `transform` or
/// `post_process`.
///
/// Unset `env` and `side_effects` inherit from the parent asset.
#[derive(Debug, Clone)]
pub struct ChildAsset {
    pub asset_type: String,
    pub content: AssetContent,
    pub ast: Option<Ast>,
    pub dependencies: Vec<Dependency>,
    pub connected_files: Vec<ConnectedFile>,
    pub env: Option<Arc<Environment>>,
    pub side_effects: Option<bool>,
    pub is_isolated: bool,
    pub symbols: BTreeMap<String, String>,
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl ChildAsset {
    pub fn new(asset_type: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            asset_type: asset_type.into(),
            content: AssetContent::Buffer(code.into().into_bytes().into()),
            ast: None,
            dependencies: Vec::new(),
            connected_files: Vec::new(),
            env: None,
            side_effects: None,
            is_isolated: false,
            symbols: BTreeMap::new(),
            meta: serde_json::Map::new(),
        }
    }
}

/// One output of a `transform` hook.
pub enum TransformOutput {
    /// Keep the (possibly mutated) input asset in the working set.
    Keep,
    /// Emit a new child asset.
    Child(ChildAsset),
}

/// One stage of an asset pipeline.
#[async_trait]
pub trait Transformer: Send + Sync {
    /// Stable stage name; pipeline ids join these.
    fn name(&self) -> &str;

    /// Whether the stage wants a per-file config loaded by the host.
    fn loads_config(&self) -> bool {
        false
    }

    /// May the stage accept this AST directly instead of reparsing?
    fn can_reuse_ast(&self, _ast: &Ast) -> bool {
        false
    }

    /// Whether the stage implements [`Transformer::generate`].
    fn provides_generate(&self) -> bool {
        false
    }

    /// Whether the stage implements [`Transformer::post_process`].
    fn provides_post_process(&self) -> bool {
        false
    }

    /// Produce an AST from the asset's current content. `None` means the
    /// stage does not parse.
    async fn parse(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Option<Ast>> {
        Ok(None)
    }

    /// The core operation: mutate the asset in place and keep it, emit
    /// child assets, or both. An asset absent from the output is dropped.
    async fn transform(
        &self,
        asset: &mut MutableAsset<'_>,
        ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>>;

    /// Convert an AST back to source.
    async fn generate(
        &self,
        _asset: &AssetStore,
        _ast: &Ast,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<GenerateOutput> {
        anyhow::bail!("transformer '{}' does not implement generate", self.name())
    }

    /// Whole-pipeline finalization over the committed asset set. A
    /// non-empty result replaces the asset list.
    async fn post_process(
        &self,
        _assets: &[Asset],
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<ChildAsset>> {
        Ok(Vec::new())
    }
}
