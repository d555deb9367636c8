//! Runtime config for the engine.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use seahash::SeaHasher;

use crate::integrity::IntegrityType;

/// Runtime config for the transformation engine.
///
/// The shape the outer config layer resolves before handing over: project
/// paths plus the option subset that can change transformer output.
#[derive(Debug, Clone)]
pub struct RtcTransform {
    /// Root used for config lookups and relative source-map paths.
    pub project_root: PathBuf,
    /// Directory the artifact cache persists under.
    pub cache_dir: PathBuf,
    /// When false, cache reads are skipped entirely; writes still occur.
    pub cache: bool,
    /// Whether generators should emit source maps.
    pub source_maps: bool,
    /// Digest recorded on committed assets.
    pub integrity: IntegrityType,
    /// Ask transformers to minify. Participates in cache keys.
    pub minify: bool,
    /// Hot-reload mode. Participates in cache keys.
    pub hot: bool,
    /// Scope hoisting. Participates in cache keys.
    pub scope_hoist: bool,
}

impl RtcTransform {
    pub fn new(project_root: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            cache_dir: cache_dir.into(),
            cache: true,
            source_maps: true,
            integrity: IntegrityType::default(),
            minify: false,
            hot: false,
            scope_hoist: false,
        }
    }

    /// Hash of the option subset that can change transformer output.
    pub fn impactful_hash(&self) -> u64 {
        let mut hasher = SeaHasher::new();
        hasher.write_u8(self.minify as u8);
        hasher.write_u8(self.hot as u8);
        hasher.write_u8(self.scope_hoist as u8);
        hasher.finish()
    }

    /// Construct an instance for testing, rooted in a temp directory.
    pub fn new_test(root: &Path) -> Self {
        Self::new(root, root.join("lade-cache"))
    }
}
