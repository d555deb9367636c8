//! Engine error taxonomy.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the transformation engine.
///
/// All kinds are fatal to the enclosing request; cache *reads* never
/// produce an error here, they degrade to a miss instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The source content was unavailable or unreadable.
    #[error("failed to read source content at {}", path.display())]
    ContentRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The host config loader failed for a plugin.
    #[error("failed to load config for plugin '{package}' at {}", path.display())]
    ConfigLoad {
        package: String,
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A transformer hook failed.
    #[error("transformer '{stage}' failed on {} ({asset_type})", path.display())]
    Transformer {
        stage: String,
        path: PathBuf,
        asset_type: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An asset carries an AST a stage cannot reuse, and no prior stage
    /// provides `generate` to turn it back into source.
    #[error("asset at {} carries an AST but no prior stage provides generate", path.display())]
    AstReuseMismatch { path: PathBuf },

    /// Mutation was attempted after commit.
    #[error("asset {id} is frozen; mutation after commit is not allowed")]
    AssetFrozen { id: String },

    /// A cache write failed. Only raised on the write path.
    #[error("cache write failed at {}", path.display())]
    CacheIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No pipeline rule matched the file path.
    #[error("no pipeline rule matches {}", path.display())]
    NoPipeline { path: PathBuf },

    /// A pipeline rule pattern failed to compile.
    #[error("invalid pipeline rule pattern '{pattern}'")]
    InvalidRule {
        pattern: String,
        #[source]
        source: globset::Error,
    },

    /// A pipeline rule names a stage missing from the plugin registry.
    #[error("pipeline stage '{stage}' is not registered")]
    UnknownStage { stage: String },

    /// Request-level wrapper added by the driver.
    #[error("transformation of {} failed", path.display())]
    Request {
        path: PathBuf,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    /// Wrap an error with request-level context, once.
    pub(crate) fn for_request(self, path: &Path) -> Self {
        match self {
            wrapped @ EngineError::Request { .. } => wrapped,
            other => EngineError::Request {
                path: path.to_owned(),
                source: Box::new(other),
            },
        }
    }
}
