//! Plugin configuration results and the host loader contract.
//!
//! Config discovery and parsing live outside the engine; only the loaded
//! result is consumed here, keyed by plugin package name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum::Display;

/// How the host should restore a config on restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReloadPolicy {
    /// The serialized config can be rehydrated from the cache as-is.
    Rehydrate,
    /// The config must be reloaded from disk.
    Reload,
}

/// A request for a plugin's per-file configuration.
///
/// Recorded by the driver for every load performed, so the outer graph
/// can track config dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    /// Package name of the plugin the config belongs to.
    pub package: String,
    /// The asset path the config applies to.
    pub file_path: PathBuf,
}

/// The result of loading a plugin config.
///
/// Opaque to the engine except for the fields participating in cache
/// keys.
#[derive(Debug, Clone)]
pub struct PluginConfig {
    pub package: String,
    /// Stable bytes identifying the loaded config.
    pub result_hash: String,
    /// Development dependencies the config pulls in, ordered by package.
    pub dev_deps: BTreeMap<String, String>,
    pub reload_policy: ReloadPolicy,
    /// The opaque value handed to the transformer.
    pub value: Arc<serde_json::Value>,
}

/// Host callback loading plugin configs.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    async fn load_config(&self, request: &ConfigRequest) -> anyhow::Result<PluginConfig>;
}
