// Pipeline Scheduler
// Runs stages in order with a barrier between them and bounded parallelism within

use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::executor::JobExecutor;
use crate::execution::preemption::RunControl;
use crate::execution::record::{JobRun, PipelineRun, StageRun, StageStatus};
use crate::resolve::{ResolvedPipeline, ResolvedStage};

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Why later stages are not dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Halt {
    /// An earlier stage failed; later jobs are skipped
    Failed,
    /// The run was cancelled or superseded; later jobs are cancelled
    Stopped,
}

/// Dispatches a resolved pipeline stage by stage
pub struct PipelineScheduler {
    executor: Arc<JobExecutor>,
    /// Maximum concurrently running jobs within a stage (0 = unlimited)
    max_parallel: usize,
    continue_on_failure: bool,
    events: Option<ProgressSender>,
}

impl PipelineScheduler {
    pub fn new(executor: Arc<JobExecutor>) -> Self {
        Self {
            executor,
            max_parallel: 0,
            continue_on_failure: false,
            events: None,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Run every stage of `plan`. A stage starts only after the previous one
    /// reached a terminal, successful status.
    pub async fn run(&self, plan: &ResolvedPipeline, control: Arc<RunControl>) -> PipelineRun {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut halt: Option<Halt> = None;
        let mut stages = Vec::with_capacity(plan.stages.len());

        self.events.send_event(ExecutionEvent::PipelineStarted {
            pipeline_id: plan.identity.pipeline_id.clone(),
            git_ref: plan.identity.git_ref.clone(),
            total_stages: plan.stages.len(),
            total_jobs: plan.job_count(),
        });

        for stage in &plan.stages {
            if halt.is_none() && control.is_stopping() {
                halt = Some(Halt::Stopped);
            }

            let run = match halt {
                Some(reason) => self.halted_stage(stage, reason),
                None => {
                    let span = tracing::info_span!("stage", stage = %stage.name);
                    self.run_stage(stage, &control).instrument(span).await
                }
            };

            if halt.is_none() {
                halt = match run.status {
                    StageStatus::Failed if !self.continue_on_failure => Some(Halt::Failed),
                    StageStatus::Canceled => Some(Halt::Stopped),
                    _ if control.is_stopping() => Some(Halt::Stopped),
                    _ => None,
                };
            }
            stages.push(run);
        }

        let run = PipelineRun {
            identity: plan.identity.clone(),
            started_at,
            finished_at: Utc::now(),
            stages,
        };

        let status = crate::execution::summary::PipelineStatus::of(&run);
        tracing::info!(pipeline = %plan.identity.pipeline_id, ?status, "pipeline finished");
        self.events.send_event(ExecutionEvent::PipelineCompleted {
            pipeline_id: plan.identity.pipeline_id.clone(),
            status,
            duration: started.elapsed(),
        });
        run
    }

    fn halted_stage(&self, stage: &ResolvedStage, reason: Halt) -> StageRun {
        let (jobs, message): (Vec<JobRun>, &str) = match reason {
            Halt::Failed => (
                stage.jobs.iter().map(|job| JobRun::skipped(job)).collect(),
                "an earlier stage failed",
            ),
            Halt::Stopped => (
                stage
                    .jobs
                    .iter()
                    .map(|job| JobRun::cancelled(job, "pipeline was cancelled before the stage started"))
                    .collect(),
                "the pipeline was cancelled",
            ),
        };

        let status = match reason {
            Halt::Failed => StageStatus::Skipped,
            Halt::Stopped if jobs.is_empty() => StageStatus::Skipped,
            Halt::Stopped => StageStatus::Canceled,
        };

        self.events
            .send_event(ExecutionEvent::stage_skipped(&stage.name, status, message));

        StageRun {
            name: stage.name.clone(),
            ordinal: stage.ordinal,
            status,
            jobs,
        }
    }

    async fn run_stage(&self, stage: &ResolvedStage, control: &Arc<RunControl>) -> StageRun {
        let started = Instant::now();
        self.events
            .send_event(ExecutionEvent::stage_started(&stage.name, stage.jobs.len()));

        let permits = (self.max_parallel > 0).then(|| Arc::new(Semaphore::new(self.max_parallel)));
        let mut set = JoinSet::new();

        for (index, job) in stage.jobs.iter().enumerate() {
            let job = job.clone();
            let executor = self.executor.clone();
            let control = control.clone();
            let permits = permits.clone();

            set.spawn(async move {
                let token = control.token_for(job.interruptible);

                let _permit = match permits {
                    Some(permits) => tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return (index, JobRun::cancelled(&job, "cancelled while waiting for a free slot"));
                        }
                        permit = permits.acquire_owned() => permit.ok(),
                    },
                    None => None,
                };

                if !control.begin_job(job.interruptible) {
                    return (index, JobRun::cancelled(&job, "pipeline was cancelled before the job started"));
                }

                let run = AssertUnwindSafe(executor.run(&job, &token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(job = %job.name, %message, "job task panicked");
                        JobRun::panicked(&job, &message)
                    });
                (index, run)
            });
        }

        // Barrier: every job reaches a terminal record before the stage ends
        let mut runs: Vec<Option<JobRun>> = vec![None; stage.jobs.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, run)) => runs[index] = Some(run),
                Err(error) => tracing::error!(stage = %stage.name, %error, "job task failed to join"),
            }
        }

        let jobs: Vec<JobRun> = runs
            .into_iter()
            .zip(&stage.jobs)
            .map(|(run, job)| run.unwrap_or_else(|| JobRun::panicked(job, "job task was lost")))
            .collect();

        let status = StageStatus::from_jobs(&jobs);
        self.events.send_event(ExecutionEvent::stage_completed(
            &stage.name,
            status,
            started.elapsed(),
        ));

        StageRun {
            name: stage.name.clone(),
            ordinal: stage.ordinal,
            status,
            jobs,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::record::{AttemptOutcome, JobStatus};
    use crate::execution::summary::{PipelineStatus, PipelineSummary};
    use crate::parser::models::FailureCause;
    use crate::parser::DocumentParser;
    use crate::resolve::{Resolver, RunIdentity};
    use crate::runtime::{EnvironmentError, ScriptedProvider};
    use std::time::Duration;

    const REMOTE_BUILD: &str = r#"
stages: [audit, build]

.rust_job: &rust_job
  image: rust:1.75
  interruptible: true
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

    fn plan(yaml: &str) -> ResolvedPipeline {
        let doc = DocumentParser::parse(yaml).unwrap();
        Resolver::new(RunIdentity::new("relay", "main").with_pipeline_id("7"))
            .resolve(&doc)
            .unwrap()
    }

    fn scheduler(provider: &ScriptedProvider, plan: &ResolvedPipeline) -> PipelineScheduler {
        let executor = JobExecutor::new(Arc::new(provider.clone()), &plan.identity)
            .with_scratch_root(std::env::temp_dir().join("relay-scheduler-tests"));
        PipelineScheduler::new(Arc::new(executor))
    }

    #[tokio::test]
    async fn test_allowed_failure_lets_next_stage_run() {
        let provider = ScriptedProvider::new().on_line("cargo audit", [1]);
        let plan = plan(REMOTE_BUILD);

        let run = scheduler(&provider, &plan)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;

        assert_eq!(run.stage("audit").unwrap().status, StageStatus::SucceededWithAllowedFailures);
        assert_eq!(run.stage("build").unwrap().status, StageStatus::Succeeded);
        assert_eq!(run.job("cargo_audit").unwrap().status, JobStatus::AllowedFailure);
        assert_eq!(
            PipelineSummary::from_run(&run).status,
            PipelineStatus::SucceededWithAllowedFailures
        );
    }

    #[tokio::test]
    async fn test_failed_stage_halts_later_stages() {
        let provider = ScriptedProvider::new().on_line("cargo audit", [1]);
        let plan = plan(&REMOTE_BUILD.replace("allow_failure: true", "allow_failure: false"));

        let run = scheduler(&provider, &plan)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;

        assert_eq!(run.stage("audit").unwrap().status, StageStatus::Failed);
        assert_eq!(run.stage("build").unwrap().status, StageStatus::Skipped);
        assert!(provider.lines_for("cargo_remote_build").is_empty());
        assert_eq!(provider.acquisitions("cargo_remote_build"), 0);
        assert_eq!(PipelineSummary::from_run(&run).status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_continue_on_failure_runs_later_stages() {
        let provider = ScriptedProvider::new().on_line("cargo audit", [1]);
        let plan = plan(&REMOTE_BUILD.replace("allow_failure: true", "allow_failure: false"));

        let run = scheduler(&provider, &plan)
            .with_continue_on_failure(true)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;

        assert_eq!(run.stage("build").unwrap().status, StageStatus::Succeeded);
        assert_eq!(PipelineSummary::from_run(&run).status, PipelineStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_scenario_records_three_attempts() {
        let provider = ScriptedProvider::new().fail_acquire(
            "cargo_remote_build",
            [
                EnvironmentError::Unavailable("runner lost".into()),
                EnvironmentError::Unavailable("runner lost".into()),
            ],
        );
        let yaml = REMOTE_BUILD.replace(
            "  stage: build\n",
            "  stage: build\n  retry:\n    max: 2\n    when: [runner_system_failure]\n",
        );
        let plan = plan(&yaml);

        let run = scheduler(&provider, &plan)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;

        let build = run.job("cargo_remote_build").unwrap();
        assert_eq!(build.records.len(), 3);
        assert_eq!(build.status, JobStatus::Succeeded);
        assert_eq!(
            build.records[1].outcome,
            AttemptOutcome::Failed {
                cause: FailureCause::RunnerSystemFailure
            }
        );
    }

    #[tokio::test]
    async fn test_stage_barrier() {
        let provider = ScriptedProvider::new()
            .delay_line("slow", Duration::from_millis(80))
            .delay_line("fast", Duration::from_millis(5));
        let plan = plan(
            r#"
stages: [one, two]
a:
  stage: one
  script: [slow]
b:
  stage: one
  script: [fast]
c:
  stage: two
  script: [fast]
"#,
        );

        scheduler(&provider, &plan)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;

        let log = provider.exec_log();
        let last_one = log
            .iter()
            .filter(|e| e.job == "a" || e.job == "b")
            .map(|e| e.finished)
            .max()
            .unwrap();
        let first_two = log
            .iter()
            .filter(|e| e.job == "c")
            .map(|e| e.started)
            .min()
            .unwrap();
        assert!(first_two >= last_one);
    }

    #[tokio::test]
    async fn test_jobs_in_a_stage_run_concurrently_within_limit() {
        let provider = ScriptedProvider::new().delay_line("work", Duration::from_millis(50));
        let plan = plan("a:\n  script: [work]\nb:\n  script: [work]\nc:\n  script: [work]\nd:\n  script: [work]\n");

        scheduler(&provider, &plan)
            .with_max_parallel(2)
            .run(&plan, Arc::new(RunControl::new("7")))
            .await;
        assert_eq!(provider.max_active(), 2);

        let unbounded = ScriptedProvider::new().delay_line("work", Duration::from_millis(50));
        scheduler(&unbounded, &plan)
            .run(&plan, Arc::new(RunControl::new("8")))
            .await;
        assert_eq!(unbounded.max_active(), 4);
    }

    #[tokio::test]
    async fn test_cancellation_marks_running_and_pending_jobs_cancelled() {
        let provider = ScriptedProvider::new().delay_line("cargo audit", Duration::from_secs(30));
        let plan = plan(REMOTE_BUILD);
        let control = Arc::new(RunControl::new("7"));

        let trigger = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = scheduler(&provider, &plan).run(&plan, control).await;

        let audit = run.job("cargo_audit").unwrap();
        assert_eq!(audit.status, JobStatus::Canceled);
        assert_eq!(audit.records.last().unwrap().outcome, AttemptOutcome::Cancelled);

        let build = run.job("cargo_remote_build").unwrap();
        assert_eq!(build.status, JobStatus::Canceled);
        assert_eq!(run.stage("build").unwrap().status, StageStatus::Canceled);
        assert_eq!(PipelineSummary::from_run(&run).status, PipelineStatus::Canceled);
        assert_eq!(provider.active(), 0);
    }

    #[tokio::test]
    async fn test_superseded_run_cancels_interruptible_jobs_only() {
        use crate::execution::preemption::PreemptionRegistry;

        let provider = ScriptedProvider::new().delay_line("cargo audit", Duration::from_secs(30));
        let plan = plan(REMOTE_BUILD);
        let registry = Arc::new(PreemptionRegistry::new());
        let control = registry.register("relay", "main", "7");

        let newer = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            newer.register("relay", "main", "8");
        });

        let run = scheduler(&provider, &plan).run(&plan, control).await;

        assert_eq!(run.job("cargo_audit").unwrap().status, JobStatus::Canceled);
        assert!(provider.lines_for("cargo_remote_build").is_empty());
        assert_eq!(PipelineSummary::from_run(&run).status, PipelineStatus::Canceled);
    }
}
