//! Top-level transformation orchestration.
//!
//! One driver instance serves many requests; each request runs on a
//! single cooperative task and shares only the cache, the filesystem and
//! the host callbacks with its peers.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use seahash::SeaHasher;

use crate::asset::{Asset, AssetStore};
use crate::cache::ArtifactCache;
use crate::config::{ConfigLoader, ConfigRequest, PluginConfig};
use crate::content::{hex64, SourceContent};
use crate::environment::Environment;
use crate::error::{EngineError, Result};
use crate::pipeline::{Pipeline, PipelineMap, PipelineStage};
use crate::rt::RtcTransform;
use crate::transformer::{Resolve, TransformContext};

/// A request to transform one source file or inline code blob.
#[derive(Debug, Clone)]
pub struct TransformRequest {
    pub file_path: PathBuf,
    /// Inline code; when present, identity derives from its hash and
    /// cache reads are skipped.
    pub inline_code: Option<String>,
    pub env: Arc<Environment>,
    pub side_effects: bool,
}

impl TransformRequest {
    pub fn new(file_path: impl Into<PathBuf>, env: Arc<Environment>) -> Self {
        Self {
            file_path: file_path.into(),
            inline_code: None,
            env,
            side_effects: true,
        }
    }
}

/// The result of one transformation request.
///
/// Every asset is committed: its final bytes sit in the blob cache under
/// its `output_hash`.
#[derive(Debug)]
pub struct TransformOutcome {
    pub assets: Vec<Asset>,
    /// Config loads performed on behalf of this request, for dependency
    /// tracking by the outer graph.
    pub config_requests: Vec<ConfigRequest>,
    /// Paths whose change invalidates this result.
    pub invalidations: Vec<PathBuf>,
}

/// Orchestrates a transformation request end to end: source loading,
/// pipeline selection, two-level caching, type-change re-dispatch, and
/// postprocessing.
pub struct TransformationDriver {
    options: Arc<RtcTransform>,
    cache: Arc<ArtifactCache>,
    pipelines: Arc<PipelineMap>,
    config_loader: Arc<dyn ConfigLoader>,
    resolve: Arc<Resolve>,
}

impl TransformationDriver {
    pub async fn new(
        options: RtcTransform,
        pipelines: PipelineMap,
        config_loader: Arc<dyn ConfigLoader>,
        resolve: Arc<Resolve>,
    ) -> Result<Self> {
        let cache = Arc::new(ArtifactCache::new(&options.cache_dir).await?);
        Ok(Self {
            options: Arc::new(options),
            cache,
            pipelines: Arc::new(pipelines),
            config_loader,
            resolve,
        })
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Run one transformation request to completion.
    ///
    /// Either yields a full asset set or fails whole; errors bubble out
    /// wrapped with request context and no partial result is returned.
    #[tracing::instrument(level = "trace", skip_all, fields(path = %request.file_path.display()))]
    pub async fn run(&self, request: TransformRequest) -> Result<TransformOutcome> {
        let path = request.file_path.clone();
        self.run_inner(request)
            .await
            .map_err(|err| err.for_request(&path))
    }

    async fn run_inner(&self, request: TransformRequest) -> Result<TransformOutcome> {
        let source = match &request.inline_code {
            Some(code) => SourceContent::from_inline(code),
            None => SourceContent::from_file(&request.file_path).await?,
        };
        let id_base = match &request.inline_code {
            Some(_) => hex64(source.hash),
            None => request.file_path.to_string_lossy().into_owned(),
        };
        let asset_type = request
            .file_path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
            .to_owned();
        let initial = AssetStore::new(
            id_base,
            request.file_path.clone(),
            asset_type,
            request.env.clone(),
            source,
            request.side_effects,
        );

        let mut config_requests = Vec::new();
        let pipeline = self
            .load_pipeline(&request.file_path, &mut config_requests)
            .await?;

        let read_cache = self.options.cache && request.inline_code.is_none();
        let assets = self
            .transform_cached(initial, Arc::new(pipeline), read_cache, &mut config_requests)
            .await?;

        let mut invalidations = BTreeSet::from([request.file_path]);
        for asset in &assets {
            invalidations.extend(asset.connected_files.iter().map(|file| file.path.clone()));
        }

        Ok(TransformOutcome {
            assets,
            config_requests,
            invalidations: invalidations.into_iter().collect(),
        })
    }

    /// Steps 3–6 of the per-request algorithm, entered recursively for
    /// every asset whose type diverged onto a different pipeline.
    fn transform_cached<'a>(
        &'a self,
        initial: AssetStore,
        pipeline: Arc<Pipeline>,
        read_cache: bool,
        config_requests: &'a mut Vec<ConfigRequest>,
    ) -> BoxFuture<'a, Result<Vec<Asset>>> {
        Box::pin(async move {
            let key = cache_key(
                &[KeyPart::of_store(&initial)],
                pipeline.configs(),
                &self.options,
            );

            let mut cached = None;
            if read_cache {
                if let Some(assets) = self.cache.get_assets(&key).await {
                    if self.warm_blobs(&assets).await {
                        tracing::debug!(%key, pipeline = %pipeline.id, "transformation cache hit");
                        cached = Some(assets);
                    }
                }
            }

            let assets = match cached {
                Some(assets) => assets,
                None => {
                    let initial_type = initial.asset_type().to_owned();
                    let stores = pipeline
                        .transform(initial, &self.options, self.resolve.as_ref(), &self.cache)
                        .await?;

                    let mut committed = Vec::new();
                    for mut store in stores {
                        // Re-dispatch on type change: a synthetic path with
                        // the new extension selects the next pipeline; the
                        // asset's own path never changes. Equal pipeline
                        // ids mean the asset is already final.
                        if store.asset_type() != initial_type {
                            let next_path =
                                store.file_path().with_extension(store.asset_type());
                            let next_pipeline =
                                self.load_pipeline(&next_path, config_requests).await?;
                            if next_pipeline.id != pipeline.id {
                                let nested = self
                                    .transform_cached(
                                        store,
                                        Arc::new(next_pipeline),
                                        read_cache,
                                        config_requests,
                                    )
                                    .await?;
                                committed.extend(nested);
                                continue;
                            }
                        }
                        committed.push(store.commit(&self.cache, &self.options).await?);
                    }
                    self.cache.set_assets(&key, &committed).await?;
                    committed
                }
            };

            let Some(stage) = pipeline.post_process_stage() else {
                return Ok(assets);
            };
            self.post_process(stage, &pipeline, assets, read_cache).await
        })
    }

    /// The second cache boundary: keyed over the finalized asset set plus
    /// the pipeline configs, and the hook receives that same finalized
    /// set.
    async fn post_process(
        &self,
        stage: &PipelineStage,
        pipeline: &Pipeline,
        assets: Vec<Asset>,
        read_cache: bool,
    ) -> Result<Vec<Asset>> {
        let parts: Vec<KeyPart> = assets.iter().map(KeyPart::of_committed).collect();
        let key = cache_key(&parts, pipeline.configs(), &self.options);

        if read_cache {
            if let Some(cached) = self.cache.get_assets(&key).await {
                if self.warm_blobs(&cached).await {
                    tracing::debug!(%key, "postprocess cache hit");
                    return Ok(cached);
                }
            }
        }

        let ctx = TransformContext {
            config: stage.config.as_ref(),
            options: &self.options,
            resolve: self.resolve.as_ref(),
            cache: &self.cache,
        };
        let results = stage
            .plugin
            .post_process(&assets, &ctx)
            .await
            .map_err(|source| EngineError::Transformer {
                stage: stage.name.clone(),
                path: assets
                    .first()
                    .map(|asset| asset.file_path.clone())
                    .unwrap_or_default(),
                asset_type: assets
                    .first()
                    .map(|asset| asset.asset_type.clone())
                    .unwrap_or_default(),
                source: source.into(),
            })?;

        let finalized = match assets.first().cloned() {
            Some(lead) if !results.is_empty() => {
                let mut out = Vec::with_capacity(results.len());
                for child in results {
                    let mut store = AssetStore::from_child(
                        format!("{}:{}", lead.id, child.asset_type),
                        lead.file_path.clone(),
                        lead.env.clone(),
                        lead.side_effects,
                        lead.dependencies.clone(),
                        lead.connected_files.clone(),
                        child,
                    )
                    .await?;
                    out.push(store.commit(&self.cache, &self.options).await?);
                }
                out
            }
            _ => assets,
        };

        self.cache.set_assets(&key, &finalized).await?;
        Ok(finalized)
    }

    /// Build the pipeline for a file path, loading per-plugin configs and
    /// recording every load performed.
    async fn load_pipeline(
        &self,
        path: &Path,
        config_requests: &mut Vec<ConfigRequest>,
    ) -> Result<Pipeline> {
        let names = self.pipelines.stage_names(path)?;
        let mut stages = Vec::with_capacity(names.len());
        for name in names {
            let plugin = self.pipelines.plugin(name)?.clone();
            let config = if plugin.loads_config() {
                let request = ConfigRequest {
                    package: name.clone(),
                    file_path: path.to_owned(),
                };
                let config = self
                    .config_loader
                    .load_config(&request)
                    .await
                    .map_err(|source| EngineError::ConfigLoad {
                        package: name.clone(),
                        path: path.to_owned(),
                        source: source.into(),
                    })?;
                config_requests.push(request);
                Some(config)
            } else {
                None
            };
            stages.push(PipelineStage {
                name: name.clone(),
                plugin,
                config,
            });
        }
        Ok(Pipeline::new(stages))
    }

    /// Materialize each cached asset's bytes. A missing blob degrades the
    /// artifact hit to a miss.
    async fn warm_blobs(&self, assets: &[Asset]) -> bool {
        for asset in assets {
            if self.cache.get_blob(&asset.output_hash).await.is_none() {
                tracing::warn!(id = %asset.id, "cached asset blob missing");
                return false;
            }
        }
        true
    }
}

struct KeyPart<'a> {
    path: &'a Path,
    asset_type: &'a str,
    hash: String,
    env: &'a Environment,
}

impl<'a> KeyPart<'a> {
    fn of_store(store: &'a AssetStore) -> Self {
        Self {
            path: store.file_path(),
            asset_type: store.asset_type(),
            hash: hex64(store.content_hash()),
            env: store.env(),
        }
    }

    fn of_committed(asset: &'a Asset) -> Self {
        Self {
            path: &asset.file_path,
            asset_type: &asset.asset_type,
            hash: asset.output_hash.clone(),
            env: &asset.env,
        }
    }
}

/// Content-addressed key over everything that can change the output:
/// asset identities, configs (sorted by package name, dev-deps already
/// ordered), environments, and the impactful options.
fn cache_key<'a>(
    assets: &[KeyPart<'_>],
    configs: impl Iterator<Item = &'a PluginConfig>,
    options: &RtcTransform,
) -> String {
    let mut hasher = SeaHasher::new();
    for part in assets {
        hasher.write(part.path.to_string_lossy().as_bytes());
        hasher.write(part.asset_type.as_bytes());
        hasher.write(part.hash.as_bytes());
        part.env.hash(&mut hasher);
    }
    let mut configs: Vec<_> = configs.collect();
    configs.sort_by(|a, b| a.package.cmp(&b.package));
    for config in configs {
        hasher.write(config.package.as_bytes());
        hasher.write(config.result_hash.as_bytes());
        for (package, version) in &config.dev_deps {
            hasher.write(package.as_bytes());
            hasher.write(version.as_bytes());
        }
    }
    hasher.write_u64(options.impactful_hash());
    hex64(hasher.finish())
}
