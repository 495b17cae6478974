// Order Resolver
// Turns a parsed document into an ordered, fully layered execution plan

use crate::parser::models::{AllowFailure, Document, JobDefinition, RetryPolicy};
use crate::resolve::variables::{UnresolvedVariableError, VariableSet, CACHE_DIR_VARIABLE};

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Identity of one pipeline run, injected into every job's variables
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunIdentity {
    pub project: String,
    pub git_ref: String,
    pub commit_depth: u32,
    pub pipeline_id: String,
    /// Checkout the jobs run against
    pub project_dir: PathBuf,
}

impl RunIdentity {
    pub fn new(project: impl Into<String>, git_ref: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            git_ref: git_ref.into(),
            commit_depth: 0,
            pipeline_id: new_pipeline_id(),
            project_dir: PathBuf::from("."),
        }
    }

    pub fn with_commit_depth(mut self, depth: u32) -> Self {
        self.commit_depth = depth;
        self
    }

    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.project_dir = dir.into();
        self
    }

    pub fn with_pipeline_id(mut self, id: impl Into<String>) -> Self {
        self.pipeline_id = id.into();
        self
    }

    /// Ref name reduced to `[a-z0-9-]`, at most 63 chars
    pub fn ref_slug(&self) -> String {
        slugify(&self.git_ref)
    }

    /// Variables visible to every job of the run
    pub fn pipeline_variables(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("CI".to_string(), "true".to_string()),
            ("CI_PROJECT_NAME".to_string(), self.project.clone()),
            (
                "CI_PROJECT_DIR".to_string(),
                self.project_dir.display().to_string(),
            ),
            ("CI_COMMIT_REF_NAME".to_string(), self.git_ref.clone()),
            ("CI_COMMIT_REF_SLUG".to_string(), self.ref_slug()),
            ("CI_COMMIT_DEPTH".to_string(), self.commit_depth.to_string()),
            ("CI_PIPELINE_ID".to_string(), self.pipeline_id.clone()),
        ])
    }

    /// Identity layer for one job
    pub fn job_variables(&self, job: &str, stage: &str) -> BTreeMap<String, String> {
        let mut vars = self.pipeline_variables();
        vars.insert("CI_JOB_NAME".to_string(), job.to_string());
        vars.insert("CI_JOB_STAGE".to_string(), stage.to_string());
        vars
    }
}

fn new_pipeline_id() -> String {
    format!(
        "{}-{}",
        chrono::Utc::now().format("%Y%m%d%H%M%S%3f"),
        std::process::id()
    )
}

pub(crate) fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let trimmed: String = slug.trim_matches('-').chars().take(63).collect();
    trimmed.trim_end_matches('-').to_string()
}

/// A job ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedJob {
    pub name: String,
    pub stage: String,
    pub image: Option<String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub retry: RetryPolicy,
    pub interruptible: bool,
    pub tags: Vec<String>,
    pub allow_failure: AllowFailure,
    pub timeout: Option<Duration>,
    /// Layered variables, interpolated except for deferred names
    pub variables: VariableSet,
    /// Layered variables as written, used to fill deferred names at run time
    pub raw_variables: VariableSet,
}

impl ResolvedJob {
    /// Variables with the cache location filled in
    pub fn variables_with_cache_dir(&self, cache_dir: &str) -> VariableSet {
        let mut raw = self.raw_variables.clone();
        raw.insert(CACHE_DIR_VARIABLE, cache_dir);
        // Every reference was checked at resolution time with the cache dir deferred
        raw.resolved(&[]).unwrap_or_else(|error| {
            tracing::warn!(
                job = %self.name,
                %error,
                "variables failed to expand with the cache directory, using plan-time values"
            );
            let mut fallback = self.variables.clone();
            fallback.insert(CACHE_DIR_VARIABLE, cache_dir);
            fallback
        })
    }

    /// Total number of script lines across before_script and script
    pub fn line_count(&self) -> usize {
        self.before_script.len() + self.script.len()
    }
}

/// A stage with its jobs in declaration order
#[derive(Debug, Clone)]
pub struct ResolvedStage {
    pub name: String,
    pub ordinal: usize,
    pub jobs: Vec<Arc<ResolvedJob>>,
}

/// The full execution plan
#[derive(Debug, Clone)]
pub struct ResolvedPipeline {
    pub identity: RunIdentity,
    pub stages: Vec<ResolvedStage>,
}

impl ResolvedPipeline {
    pub fn job_count(&self) -> usize {
        self.stages.iter().map(|s| s.jobs.len()).sum()
    }

    pub fn find_job(&self, name: &str) -> Option<&Arc<ResolvedJob>> {
        self.stages.iter().flat_map(|s| &s.jobs).find(|j| j.name == name)
    }

    /// Keep only the named stages/jobs; empty stages are kept so the plan
    /// still shows them
    pub fn retain_jobs(&mut self, mut keep: impl FnMut(&ResolvedJob) -> bool) {
        for stage in &mut self.stages {
            stage.jobs.retain(|job| keep(job));
        }
    }
}

/// Resolves stage order and variable layering
pub struct Resolver {
    identity: RunIdentity,
    overrides: BTreeMap<String, String>,
}

impl Resolver {
    pub fn new(identity: RunIdentity) -> Self {
        Self {
            identity,
            overrides: BTreeMap::new(),
        }
    }

    /// Run-level variables that shadow every document layer
    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Build the ordered plan. Fails if any job references an undefined variable.
    pub fn resolve(&self, document: &Document) -> Result<ResolvedPipeline, UnresolvedVariableError> {
        let mut stages = Vec::with_capacity(document.stages.len());

        for stage in &document.stages {
            let jobs = document
                .jobs_in_stage(&stage.name)
                .map(|job| self.resolve_job(document, job).map(Arc::new))
                .collect::<Result<Vec<_>, _>>()?;

            stages.push(ResolvedStage {
                name: stage.name.clone(),
                ordinal: stage.ordinal,
                jobs,
            });
        }

        Ok(ResolvedPipeline {
            identity: self.identity.clone(),
            stages,
        })
    }

    fn resolve_job(
        &self,
        document: &Document,
        job: &JobDefinition,
    ) -> Result<ResolvedJob, UnresolvedVariableError> {
        let identity = self.identity.job_variables(&job.name, &job.stage);
        let raw_variables = VariableSet::layered([
            &identity,
            &document.variables,
            &job.variables,
            &self.overrides,
        ]);

        let deferred = [CACHE_DIR_VARIABLE];
        let variables = raw_variables.resolved_for_job(&job.name, &deferred)?;

        let image = match &job.image {
            Some(image) => Some(
                variables
                    .interpolate("image", image, &deferred)
                    .map_err(|mut e| {
                        e.job = Some(job.name.clone());
                        e
                    })?,
            ),
            None => None,
        };

        Ok(ResolvedJob {
            name: job.name.clone(),
            stage: job.stage.clone(),
            image,
            before_script: job.before_script.clone(),
            script: job.script.clone(),
            retry: job.retry.clone(),
            interruptible: job.interruptible,
            tags: job.tags.clone(),
            allow_failure: job.allow_failure.clone(),
            timeout: job.timeout,
            variables,
            raw_variables,
        })
    }
}
