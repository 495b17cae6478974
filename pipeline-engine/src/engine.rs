// Engine
// Wires configuration, runtime, cache and scheduler into one entry point

use crate::cache::{CacheManager, FsCacheStore};
use crate::config::{EngineConfig, RuntimeKind};
use crate::error::EngineResult;
use crate::execution::{
    JobExecutor, PipelineRun, PipelineScheduler, PreemptionRegistry, ProgressSender, RunControl,
};
use crate::parser::{Document, DocumentParser};
use crate::resolve::{ResolvedPipeline, Resolver, RunIdentity};
use crate::runtime::{
    DockerConfig, DockerProvider, EnvironmentProvider, LocalShellProvider, RunnerPool,
    ScriptedProvider,
};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loads, plans and runs pipeline documents
pub struct Engine {
    config: EngineConfig,
    provider: Arc<dyn EnvironmentProvider>,
    cache: Option<Arc<CacheManager>>,
    registry: Arc<PreemptionRegistry>,
    events: Option<ProgressSender>,
}

impl Engine {
    /// Build an engine with the runtime and cache the configuration names
    pub fn new(config: EngineConfig) -> Self {
        let provider = Self::provider_for(&config);
        let cache = config.cache_enabled.then(|| {
            Arc::new(CacheManager::new(Arc::new(FsCacheStore::new(&config.cache_root))))
        });

        Self {
            config,
            provider,
            cache,
            registry: Arc::new(PreemptionRegistry::new()),
            events: None,
        }
    }

    fn provider_for(config: &EngineConfig) -> Arc<dyn EnvironmentProvider> {
        let workspace = absolute(&config.workspace_root);
        let base: Arc<dyn EnvironmentProvider> = match config.runtime {
            RuntimeKind::Shell => Arc::new(LocalShellProvider::new(&workspace)),
            RuntimeKind::Docker => Arc::new(DockerProvider::new(DockerConfig {
                mounts: vec![workspace.clone(), absolute(&config.cache_root)],
                working_dir: workspace,
                ..Default::default()
            })),
            RuntimeKind::DryRun => Arc::new(ScriptedProvider::dry_run()),
        };

        if config.runners.is_empty() {
            base
        } else {
            Arc::new(RunnerPool::new(base, config.runners.clone()))
        }
    }

    /// Replace the environment provider, keeping any configured runner slots
    pub fn with_provider(mut self, provider: Arc<dyn EnvironmentProvider>) -> Self {
        self.provider = if self.config.runners.is_empty() {
            provider
        } else {
            Arc::new(RunnerPool::new(provider, self.config.runners.clone()))
        };
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<CacheManager>>) -> Self {
        self.cache = cache;
        self
    }

    /// Share pre-emption state with other engines running the same project
    pub fn with_registry(mut self, registry: Arc<PreemptionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.events = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn load(&self, path: impl AsRef<Path>) -> EngineResult<Document> {
        Ok(DocumentParser::parse_file(path)?)
    }

    /// Resolve a document into an execution plan
    pub fn plan(
        &self,
        document: &Document,
        identity: RunIdentity,
        overrides: BTreeMap<String, String>,
    ) -> EngineResult<ResolvedPipeline> {
        Ok(Resolver::new(identity)
            .with_overrides(overrides)
            .resolve(document)?)
    }

    /// Register a run for `plan`, superseding older runs on the same ref
    pub fn register(&self, plan: &ResolvedPipeline) -> Arc<RunControl> {
        self.registry.register(
            &plan.identity.project,
            &plan.identity.git_ref,
            &plan.identity.pipeline_id,
        )
    }

    /// Run a registered plan to completion
    pub async fn execute(&self, plan: &ResolvedPipeline, control: Arc<RunControl>) -> PipelineRun {
        let mut executor = JobExecutor::new(self.provider.clone(), &plan.identity)
            .with_acquire_timeout(self.config.acquire_timeout())
            .with_default_timeout(self.config.default_timeout());
        if let Some(cache) = &self.cache {
            executor = executor.with_cache(cache.clone());
        }
        if let Some(tx) = &self.events {
            executor = executor.with_progress(tx.clone());
        }

        let mut scheduler = PipelineScheduler::new(Arc::new(executor))
            .with_max_parallel(self.config.max_parallel)
            .with_continue_on_failure(self.config.continue_on_failure);
        if let Some(tx) = &self.events {
            scheduler = scheduler.with_progress(tx.clone());
        }

        let run = scheduler.run(plan, control.clone()).await;
        self.registry
            .finish(&plan.identity.project, &plan.identity.git_ref, &control);
        run
    }

    /// Register and run `plan`
    pub async fn run(&self, plan: &ResolvedPipeline) -> PipelineRun {
        let control = self.register(plan);
        self.execute(plan, control).await
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path)
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{progress_channel, ExecutionEvent, PipelineStatus, PipelineSummary};

    const REMOTE_BUILD: &str = r#"
stages: [audit, build]

variables:
  CARGO_TARGET_DIR: ${CI_CACHE_DIR}/target

.rust_job: &rust_job
  image: rust:1.75
  before_script:
    - rustc --version

cargo_audit:
  <<: *rust_job
  stage: audit
  allow_failure: true
  script: [cargo audit]

cargo_remote_build:
  <<: *rust_job
  stage: build
  script: [cargo build --release]
"#;

    fn engine(cache_root: &Path) -> Engine {
        Engine::new(EngineConfig {
            runtime: RuntimeKind::DryRun,
            cache_root: cache_root.to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_dry_run_end_to_end() {
        let cache = tempfile::tempdir().unwrap();
        let (tx, mut rx) = progress_channel();
        let engine = engine(cache.path()).with_progress(tx);

        let document = DocumentParser::parse(REMOTE_BUILD).unwrap();
        let plan = engine
            .plan(&document, RunIdentity::new("relay", "main"), BTreeMap::new())
            .unwrap();
        let run = engine.run(&plan).await;
        drop(engine);

        let summary = PipelineSummary::from_run(&run);
        assert_eq!(summary.status, PipelineStatus::Succeeded);
        assert_eq!(summary.jobs.len(), 2);

        let mut stages_started = Vec::new();
        while let Some(event) = rx.recv().await {
            if let ExecutionEvent::StageStarted { stage_name, .. } = event {
                stages_started.push(stage_name);
            }
        }
        assert_eq!(stages_started, vec!["audit", "build"]);
    }

    #[tokio::test]
    async fn test_scripted_provider_scenario() {
        let cache = tempfile::tempdir().unwrap();
        let provider = ScriptedProvider::new().on_line("cargo audit", [1]);
        let engine = engine(cache.path()).with_provider(Arc::new(provider.clone()));

        let document = DocumentParser::parse(REMOTE_BUILD).unwrap();
        let plan = engine
            .plan(&document, RunIdentity::new("relay", "main"), BTreeMap::new())
            .unwrap();
        let summary = PipelineSummary::from_run(&engine.run(&plan).await);

        assert_eq!(summary.status, PipelineStatus::SucceededWithAllowedFailures);
        assert_eq!(
            provider.lines_for("cargo_remote_build"),
            vec!["rustc --version", "cargo build --release"]
        );
    }

    #[tokio::test]
    async fn test_demo_document_dry_run() {
        let cache = tempfile::tempdir().unwrap();
        let engine = engine(cache.path());

        let document = DocumentParser::parse(include_str!("../../demos/remote-build.yml")).unwrap();
        let plan = engine
            .plan(&document, RunIdentity::new("relay", "main"), BTreeMap::new())
            .unwrap();
        assert_eq!(plan.job_count(), 2);

        let summary = PipelineSummary::from_run(&engine.run(&plan).await);
        assert_eq!(summary.status, PipelineStatus::Succeeded);
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_unresolved_variable_is_reported_before_running() {
        let cache = tempfile::tempdir().unwrap();
        let engine = engine(cache.path());
        let document = DocumentParser::parse("build:\n  variables:\n    X: $NOPE\n  script: [make]\n").unwrap();

        let err = engine
            .plan(&document, RunIdentity::new("relay", "main"), BTreeMap::new())
            .unwrap_err();
        assert!(matches!(err, crate::error::EngineError::UnresolvedVariable(_)));
    }

    #[test]
    fn test_runner_slots_wrap_provider() {
        let cache = tempfile::tempdir().unwrap();
        let engine = Engine::new(EngineConfig {
            runtime: RuntimeKind::DryRun,
            cache_root: cache.path().to_path_buf(),
            runners: vec![crate::config::RunnerSlotConfig {
                name: "shared".to_string(),
                tags: Vec::new(),
                capacity: 2,
            }],
            ..Default::default()
        });
        assert_eq!(engine.provider_name(), "dry-run");
    }
}
