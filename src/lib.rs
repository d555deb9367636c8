//! Lade asset transformation engine.
//!
//! Drives a single source file (or inline code blob) through a chain of
//! pluggable transformer stages, memoizes the work in a content-addressed
//! cache, and re-dispatches assets whose type changed to a new chain.

#![deny(clippy::expect_used)]
#![deny(clippy::unwrap_used)]

mod asset;
mod cache;
mod config;
mod content;
mod dependency;
mod driver;
mod environment;
mod error;
mod integrity;
mod pipeline;
mod rt;
mod transformer;

#[cfg(test)]
mod content_test;
#[cfg(test)]
mod pipeline_test;

pub use asset::{Asset, AssetStats, AssetStore, MutableAsset};
pub use cache::ArtifactCache;
pub use config::{ConfigLoader, ConfigRequest, PluginConfig, ReloadPolicy};
pub use content::{AssetContent, SourceContent, MAX_BUFFERED_SIZE};
pub use dependency::{ConnectedFile, Dependency, DependencyKind};
pub use driver::{TransformOutcome, TransformRequest, TransformationDriver};
pub use environment::Environment;
pub use error::{EngineError, Result};
pub use integrity::{IntegrityType, IntegrityTypeParseError, OutputDigest};
pub use pipeline::{Pipeline, PipelineMap, PipelineRule, PipelineStage};
pub use rt::RtcTransform;
pub use transformer::{
    Ast, ChildAsset, GenerateOutput, Resolve, TransformContext, TransformOutput, Transformer,
};
