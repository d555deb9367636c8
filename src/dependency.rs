//! Dependency and connected-file records accumulated by transformers.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strum::Display;

use crate::asset::AssetStore;
use crate::environment::Environment;

/// How a dependency specifier was expressed in the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DependencyKind {
    /// An ESM `import`.
    Import,
    /// A CommonJS `require`.
    Require,
    /// A URL reference, e.g. from CSS.
    Url,
}

/// A dependency discovered while transforming an asset.
///
/// The engine only carries these; resolution happens in the outer graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    /// The raw specifier as written in the source.
    pub specifier: String,
    pub kind: DependencyKind,
    /// The path resolution starts from.
    pub resolve_from: PathBuf,
    /// Shared with the originating asset.
    pub env: Arc<Environment>,
    /// Whether a resolution failure may be ignored.
    pub is_optional: bool,
}

impl Dependency {
    pub fn new(specifier: impl Into<String>, kind: DependencyKind, asset: &AssetStore) -> Self {
        Self {
            specifier: specifier.into(),
            kind,
            resolve_from: asset.file_path().to_owned(),
            env: asset.env().clone(),
            is_optional: false,
        }
    }
}

/// An ancillary file whose contents influence an asset, e.g. a config
/// file read by a transformer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectedFile {
    pub path: PathBuf,
    /// Hash over the file bytes at the time it was read.
    pub hash: String,
}
