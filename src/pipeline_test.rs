use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::asset::{AssetStore, MutableAsset};
use crate::cache::ArtifactCache;
use crate::content::SourceContent;
use crate::environment::Environment;
use crate::error::EngineError;
use crate::pipeline::{Pipeline, PipelineStage};
use crate::rt::RtcTransform;
use crate::transformer::{
    Ast, ChildAsset, GenerateOutput, Resolve, TransformContext, TransformOutput, Transformer,
};

fn stage_of(plugin: Arc<dyn Transformer>) -> PipelineStage {
    PipelineStage {
        name: plugin.name().to_owned(),
        plugin,
        config: None,
    }
}

fn store_of(path: &str, asset_type: &str, code: &str) -> AssetStore {
    AssetStore::new(
        path.into(),
        path.into(),
        asset_type.into(),
        Arc::new(Environment::default()),
        SourceContent::from_inline(code),
        true,
    )
}

async fn test_env() -> Result<(tempfile::TempDir, RtcTransform, ArtifactCache)> {
    let tmpdir = tempfile::tempdir().context("error building tempdir for test")?;
    let options = RtcTransform::new_test(tmpdir.path());
    let cache = ArtifactCache::new(&options.cache_dir).await?;
    Ok((tmpdir, options, cache))
}

fn test_resolve() -> Box<Resolve> {
    Box::new(|from: &Path, specifier: &str| -> anyhow::Result<PathBuf> {
        Ok(from.with_file_name(specifier))
    })
}

/// Parses dialect `j7`, annotates the tree in place, and emits through
/// `generate`.
#[derive(Default)]
struct ParseAnnotate {
    generate_calls: AtomicUsize,
}

#[async_trait]
impl Transformer for ParseAnnotate {
    fn name(&self) -> &str {
        "parse-annotate"
    }

    fn can_reuse_ast(&self, ast: &Ast) -> bool {
        ast.dialect == "j7"
    }

    fn provides_generate(&self) -> bool {
        true
    }

    async fn parse(
        &self,
        asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Option<Ast>> {
        let code = asset.get_code().await?;
        Ok(Some(Ast::new("j7", "1", json!({ "source": code }))))
    }

    async fn transform(
        &self,
        asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        if let Some(ast) = asset.ast_mut()? {
            if let Some(program) = ast.program.as_object_mut() {
                program.insert("annotated".into(), json!(true));
            }
        }
        Ok(vec![TransformOutput::Keep])
    }

    async fn generate(
        &self,
        _asset: &AssetStore,
        ast: &Ast,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<GenerateOutput> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerateOutput {
            code: format!("gen1:{}", ast.program["annotated"]),
            map: None,
        })
    }
}

/// Accepts `j7` trees as-is and records whether the annotation from the
/// previous stage is visible.
#[derive(Default)]
struct ObserveReuse {
    saw_annotated: AtomicUsize,
    generate_calls: AtomicUsize,
}

#[async_trait]
impl Transformer for ObserveReuse {
    fn name(&self) -> &str {
        "observe-reuse"
    }

    fn can_reuse_ast(&self, ast: &Ast) -> bool {
        ast.dialect == "j7"
    }

    fn provides_generate(&self) -> bool {
        true
    }

    async fn transform(
        &self,
        asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        if asset
            .ast()
            .is_some_and(|ast| ast.program["annotated"] == json!(true))
        {
            self.saw_annotated.fetch_add(1, Ordering::SeqCst);
        }
        Ok(vec![TransformOutput::Keep])
    }

    async fn generate(
        &self,
        _asset: &AssetStore,
        _ast: &Ast,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<GenerateOutput> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerateOutput {
            code: "gen2".into(),
            map: None,
        })
    }
}

/// Rejects any predecessor AST, forcing regeneration, and parses fresh.
#[derive(Default)]
struct RejectReuse {
    parsed_code: Mutex<Option<String>>,
    generate_calls: AtomicUsize,
}

#[async_trait]
impl Transformer for RejectReuse {
    fn name(&self) -> &str {
        "reject-reuse"
    }

    fn provides_generate(&self) -> bool {
        true
    }

    async fn parse(
        &self,
        asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Option<Ast>> {
        let code = asset.get_code().await?;
        if let Ok(mut guard) = self.parsed_code.lock() {
            *guard = Some(code);
        }
        Ok(Some(Ast::new("j9", "1", json!({ "fresh": true }))))
    }

    async fn transform(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        Ok(vec![TransformOutput::Keep])
    }

    async fn generate(
        &self,
        _asset: &AssetStore,
        _ast: &Ast,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<GenerateOutput> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerateOutput {
            code: "gen-reject".into(),
            map: None,
        })
    }
}

/// Transform-only middle stage: reuses `j7` trees, provides no
/// `generate` of its own.
struct PassThrough;

#[async_trait]
impl Transformer for PassThrough {
    fn name(&self) -> &str {
        "pass-through"
    }

    fn can_reuse_ast(&self, ast: &Ast) -> bool {
        ast.dialect == "j7"
    }

    async fn transform(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        Ok(vec![TransformOutput::Keep])
    }
}

/// Parses but cannot emit; any surviving AST is a contract violation.
struct ParseOnly;

#[async_trait]
impl Transformer for ParseOnly {
    fn name(&self) -> &str {
        "parse-only"
    }

    async fn parse(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Option<Ast>> {
        Ok(Some(Ast::new("j7", "1", json!({}))))
    }

    async fn transform(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        Ok(vec![TransformOutput::Keep])
    }
}

/// Keeps the input and emits one `js` child.
struct Split;

#[async_trait]
impl Transformer for Split {
    fn name(&self) -> &str {
        "split"
    }

    async fn transform(
        &self,
        _asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        Ok(vec![
            TransformOutput::Keep,
            TransformOutput::Child(ChildAsset::new("js", "child code")),
        ])
    }
}

/// Marks everything it sees.
struct Mark;

#[async_trait]
impl Transformer for Mark {
    fn name(&self) -> &str {
        "mark"
    }

    async fn transform(
        &self,
        asset: &mut MutableAsset<'_>,
        _ctx: &TransformContext<'_>,
    ) -> anyhow::Result<Vec<TransformOutput>> {
        asset.set_meta("marked", json!(true))?;
        Ok(vec![TransformOutput::Keep])
    }
}

#[tokio::test]
async fn ok_ast_reused_between_compatible_stages() -> Result<()> {
    // Assemble.
    let (_tmpdir, options, cache) = test_env().await?;
    let first = Arc::new(ParseAnnotate::default());
    let second = Arc::new(ObserveReuse::default());
    let pipeline = Pipeline::new(vec![stage_of(first.clone()), stage_of(second.clone())]);

    // Action.
    let out = pipeline
        .transform(store_of("a.js", "js", "let x"), &options, test_resolve().as_ref(), &cache)
        .await?;

    // Assert: the tree is handed over untouched and emitted exactly once,
    // at the end of the pipeline, by the latest generator.
    anyhow::ensure!(out.len() == 1);
    anyhow::ensure!(second.saw_annotated.load(Ordering::SeqCst) == 1);
    anyhow::ensure!(first.generate_calls.load(Ordering::SeqCst) == 0);
    anyhow::ensure!(second.generate_calls.load(Ordering::SeqCst) == 1);
    anyhow::ensure!(out[0].ast().is_none(), "AST must be consumed by finalization");
    anyhow::ensure!(out[0].get_code().await? == "gen2");
    Ok(())
}

#[tokio::test]
async fn ok_ast_regenerated_for_incompatible_stage() -> Result<()> {
    // Assemble.
    let (_tmpdir, options, cache) = test_env().await?;
    let first = Arc::new(ParseAnnotate::default());
    let second = Arc::new(RejectReuse::default());
    let pipeline = Pipeline::new(vec![stage_of(first.clone()), stage_of(second.clone())]);

    // Action.
    let out = pipeline
        .transform(store_of("a.js", "js", "let x"), &options, test_resolve().as_ref(), &cache)
        .await?;

    // Assert: the first stage's generate fires exactly once between the
    // stages, and the second stage parses the regenerated code.
    anyhow::ensure!(first.generate_calls.load(Ordering::SeqCst) == 1);
    let parsed = locked_clone(&second.parsed_code);
    anyhow::ensure!(
        parsed.as_deref() == Some("gen1:true"),
        "second stage must parse the regenerated code, got {parsed:?}"
    );
    anyhow::ensure!(second.generate_calls.load(Ordering::SeqCst) == 1);
    anyhow::ensure!(out.len() == 1);
    anyhow::ensure!(out[0].get_code().await? == "gen-reject");
    Ok(())
}

fn locked_clone(slot: &Mutex<Option<String>>) -> Option<String> {
    slot.lock().ok().and_then(|guard| guard.clone())
}

#[tokio::test]
async fn ok_generator_carries_across_generateless_stage() -> Result<()> {
    // Assemble: the middle stage reuses the tree but cannot emit; the
    // first stage's generate must still be available to the third.
    let (_tmpdir, options, cache) = test_env().await?;
    let first = Arc::new(ParseAnnotate::default());
    let third = Arc::new(RejectReuse::default());
    let pipeline = Pipeline::new(vec![
        stage_of(first.clone()),
        stage_of(Arc::new(PassThrough)),
        stage_of(third.clone()),
    ]);

    // Action.
    let out = pipeline
        .transform(store_of("a.js", "js", "let x"), &options, test_resolve().as_ref(), &cache)
        .await?;

    // Assert: the carried-forward generator fires exactly once, between
    // the second and third stages.
    anyhow::ensure!(first.generate_calls.load(Ordering::SeqCst) == 1);
    let parsed = locked_clone(&third.parsed_code);
    anyhow::ensure!(
        parsed.as_deref() == Some("gen1:true"),
        "third stage must parse the code regenerated by the first stage's emitter, got {parsed:?}"
    );
    anyhow::ensure!(third.generate_calls.load(Ordering::SeqCst) == 1);
    anyhow::ensure!(out.len() == 1);
    anyhow::ensure!(out[0].get_code().await? == "gen-reject");
    Ok(())
}

#[tokio::test]
async fn err_ast_without_generator() -> Result<()> {
    // Assemble.
    let (_tmpdir, options, cache) = test_env().await?;
    let pipeline = Pipeline::new(vec![stage_of(Arc::new(ParseOnly))]);

    // Action.
    let res = pipeline
        .transform(store_of("a.js", "js", "let x"), &options, test_resolve().as_ref(), &cache)
        .await;

    // Assert.
    anyhow::ensure!(
        matches!(res, Err(EngineError::AstReuseMismatch { .. })),
        "an AST with no generator must fail the pipeline"
    );
    Ok(())
}

#[tokio::test]
async fn ok_diverged_asset_exits_pipeline_once() -> Result<()> {
    // Assemble.
    let (_tmpdir, options, cache) = test_env().await?;
    let pipeline = Pipeline::new(vec![stage_of(Arc::new(Split)), stage_of(Arc::new(Mark))]);

    // Action.
    let out = pipeline
        .transform(store_of("a.ts", "ts", "parent code"), &options, test_resolve().as_ref(), &cache)
        .await?;

    // Assert: the `js` child skips the second stage and appears exactly
    // once; the `ts` parent is processed by it.
    anyhow::ensure!(out.len() == 2, "expected child + parent, got {}", out.len());
    let children: Vec<_> = out.iter().filter(|a| a.asset_type() == "js").collect();
    anyhow::ensure!(children.len() == 1, "diverged child must appear exactly once");
    anyhow::ensure!(
        !children[0].meta().contains_key("marked"),
        "diverged child must not run later stages"
    );
    let parent = out
        .iter()
        .find(|a| a.asset_type() == "ts")
        .context("parent missing from output")?;
    anyhow::ensure!(parent.meta().contains_key("marked"));
    Ok(())
}
