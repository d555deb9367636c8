//! Transformer pipelines: selection, AST reconciliation, fan-out.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use globset::{Glob, GlobMatcher};
use serde::Deserialize;

use crate::asset::{AssetStore, MutableAsset};
use crate::cache::ArtifactCache;
use crate::config::PluginConfig;
use crate::error::{EngineError, Result};
use crate::rt::RtcTransform;
use crate::transformer::{Resolve, TransformContext, TransformOutput, Transformer};

/// A selection rule: the first matching glob decides the stage names an
/// asset is driven through.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineRule {
    /// Glob over the asset's file path, e.g. `*.{ts,tsx}`.
    pub pattern: String,
    /// Ordered transformer package names.
    pub stages: Vec<String>,
}

/// Maps file paths to stage lists and holds the plugin registry the
/// names resolve against.
pub struct PipelineMap {
    rules: Vec<(GlobMatcher, Vec<String>)>,
    plugins: HashMap<String, Arc<dyn Transformer>>,
}

impl PipelineMap {
    pub fn new(rules: Vec<PipelineRule>, plugins: Vec<Arc<dyn Transformer>>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let matcher = Glob::new(&rule.pattern)
                    .map_err(|source| EngineError::InvalidRule {
                        pattern: rule.pattern.clone(),
                        source,
                    })?
                    .compile_matcher();
                Ok((matcher, rule.stages))
            })
            .collect::<Result<Vec<_>>>()?;
        let plugins = plugins
            .into_iter()
            .map(|plugin| (plugin.name().to_owned(), plugin))
            .collect();
        Ok(Self { rules, plugins })
    }

    /// Stage names for a file path; first matching rule wins.
    pub fn stage_names(&self, path: &Path) -> Result<&[String]> {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.is_match(path))
            .map(|(_, stages)| stages.as_slice())
            .ok_or_else(|| EngineError::NoPipeline {
                path: path.to_owned(),
            })
    }

    pub fn plugin(&self, name: &str) -> Result<&Arc<dyn Transformer>> {
        self.plugins
            .get(name)
            .ok_or_else(|| EngineError::UnknownStage {
                stage: name.to_owned(),
            })
    }
}

/// One stage of a pipeline: the plugin plus its preloaded config.
#[derive(Clone)]
pub struct PipelineStage {
    pub name: String,
    pub plugin: Arc<dyn Transformer>,
    pub config: Option<PluginConfig>,
}

/// Per-invocation state threaded through the stage walk.
#[derive(Default)]
struct PipelineRun {
    /// The most recent stage providing `generate`. Regenerates code for
    /// stages that cannot reuse a predecessor's AST, and finalizes any
    /// AST still present when the walk ends.
    generator: Option<PipelineStage>,
}

/// An ordered transformer chain selected for one file path.
///
/// The unit within which AST handoff is possible: a stage declaring
/// `can_reuse_ast` receives its predecessor's tree directly; otherwise
/// the tree is regenerated to code and reparsed.
pub struct Pipeline {
    /// Stable id, the stage names joined with `:`. Equal ids mean equal
    /// chains for re-dispatch purposes.
    pub id: String,
    stages: Vec<PipelineStage>,
    /// The last stage providing `post_process`, fixed at construction so
    /// cache hits can honor postprocessing without running the stages.
    post_process: Option<PipelineStage>,
}

impl Pipeline {
    pub fn new(stages: Vec<PipelineStage>) -> Self {
        let id = stages
            .iter()
            .map(|stage| stage.name.as_str())
            .collect::<Vec<_>>()
            .join(":");
        let post_process = stages
            .iter()
            .filter(|stage| stage.plugin.provides_post_process())
            .next_back()
            .cloned();
        Self {
            id,
            stages,
            post_process,
        }
    }

    pub fn stages(&self) -> &[PipelineStage] {
        &self.stages
    }

    pub fn post_process_stage(&self) -> Option<&PipelineStage> {
        self.post_process.as_ref()
    }

    /// Configs of all stages that loaded one.
    pub fn configs(&self) -> impl Iterator<Item = &PluginConfig> {
        self.stages.iter().filter_map(|stage| stage.config.as_ref())
    }

    /// Drive one asset through every stage.
    ///
    /// The working set starts as the initial asset and grows via child
    /// emission. An asset whose type diverges from the pipeline's initial
    /// type exits the working set exactly once and is returned unchanged
    /// from that point; assets diverging on the last stage simply remain
    /// in the working set. Stages run strictly in order and assets are
    /// visited sequentially in working-set order.
    #[tracing::instrument(level = "trace", skip_all, fields(pipeline = %self.id, path = %initial.file_path().display()))]
    pub async fn transform(
        &self,
        initial: AssetStore,
        options: &RtcTransform,
        resolve: &Resolve,
        cache: &ArtifactCache,
    ) -> Result<Vec<AssetStore>> {
        let initial_type = initial.asset_type().to_owned();
        let mut working = vec![initial];
        let mut finals: Vec<AssetStore> = Vec::new();
        let mut run = PipelineRun::default();

        for stage in &self.stages {
            let ctx = TransformContext {
                config: stage.config.as_ref(),
                options,
                resolve,
                cache,
            };
            let mut next = Vec::new();

            for mut store in std::mem::take(&mut working) {
                if store.asset_type() != initial_type {
                    finals.push(store);
                    continue;
                }

                let path = store.file_path().to_owned();
                let asset_type = store.asset_type().to_owned();
                let stage_err = |source: anyhow::Error| EngineError::Transformer {
                    stage: stage.name.clone(),
                    path: path.clone(),
                    asset_type: asset_type.clone(),
                    source: source.into(),
                };

                let started = Instant::now();
                reconcile_ast(stage, &mut store, &run, options, resolve, cache).await?;

                if store.ast().is_none() {
                    let parsed = {
                        let mut view = MutableAsset::new(&mut store);
                        stage.plugin.parse(&mut view, &ctx).await.map_err(stage_err)?
                    };
                    if let Some(ast) = parsed {
                        store.set_ast_raw(ast);
                    }
                }

                let outputs = {
                    let mut view = MutableAsset::new(&mut store);
                    stage
                        .plugin
                        .transform(&mut view, &ctx)
                        .await
                        .map_err(stage_err)?
                };
                store.stats_mut().time_ms += started.elapsed().as_millis() as u64;

                // Normalize in returned order: children become stores,
                // `Keep` re-inserts the (possibly mutated) input once.
                let mut slots = Vec::with_capacity(outputs.len());
                for output in outputs {
                    match output {
                        TransformOutput::Keep => slots.push(None),
                        TransformOutput::Child(child) => {
                            slots.push(Some(store.create_child(child).await?))
                        }
                    }
                }
                let mut store = Some(store);
                for slot in slots {
                    match slot {
                        Some(child) => next.push(child),
                        None => {
                            if let Some(kept) = store.take() {
                                next.push(kept);
                            }
                        }
                    }
                }
            }

            working = next;
            // The generator slot carries forward across stages, always
            // pointing at the most recent stage that can emit.
            if stage.plugin.provides_generate() {
                run.generator = Some(stage.clone());
            }
        }

        // Finalize: any remaining AST is emitted through the current
        // generator before the pipeline returns.
        let mut out = finals;
        out.append(&mut working);
        for store in &mut out {
            if store.ast().is_none() {
                continue;
            }
            let Some(generator) = &run.generator else {
                return Err(EngineError::AstReuseMismatch {
                    path: store.file_path().to_owned(),
                });
            };
            generate_onto(generator, store, options, resolve, cache).await?;
        }
        Ok(out)
    }
}

/// If the asset carries an AST the stage cannot reuse, regenerate code
/// through the current generator and clear the AST so the stage parses
/// fresh source.
async fn reconcile_ast(
    stage: &PipelineStage,
    store: &mut AssetStore,
    run: &PipelineRun,
    options: &RtcTransform,
    resolve: &Resolve,
    cache: &ArtifactCache,
) -> Result<()> {
    let Some(ast) = store.ast() else {
        return Ok(());
    };
    if stage.plugin.can_reuse_ast(ast) {
        return Ok(());
    }
    let Some(generator) = &run.generator else {
        return Err(EngineError::AstReuseMismatch {
            path: store.file_path().to_owned(),
        });
    };
    generate_onto(generator, store, options, resolve, cache).await
}

/// Run a stage's `generate` over the asset's AST and write the emitted
/// code back onto the asset.
async fn generate_onto(
    generator: &PipelineStage,
    store: &mut AssetStore,
    options: &RtcTransform,
    resolve: &Resolve,
    cache: &ArtifactCache,
) -> Result<()> {
    let ctx = TransformContext {
        config: generator.config.as_ref(),
        options,
        resolve,
        cache,
    };
    let Some(ast) = store.take_ast() else {
        return Ok(());
    };
    let output = generator
        .plugin
        .generate(store, &ast, &ctx)
        .await
        .map_err(|source| EngineError::Transformer {
            stage: generator.name.clone(),
            path: store.file_path().to_owned(),
            asset_type: store.asset_type().to_owned(),
            source: source.into(),
        })?;
    store.apply_generated(output, options.source_maps);
    Ok(())
}
