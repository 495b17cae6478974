// Job Executor
// Runs one job: environment, cache lease, scripts, timeout and retry

use crate::cache::{CacheKey, CacheLease, CacheManager};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::record::{AttemptOutcome, ExecutionRecord, JobRun};
use crate::parser::models::FailureCause;
use crate::resolve::{ResolvedJob, RunIdentity};
use crate::runtime::{Environment, EnvironmentProvider, EnvironmentRequest, ExecStatus};

use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// How an attempt's work ended, before timeouts are told apart from cancellation
enum Ending {
    Succeeded,
    Failed(FailureCause),
    Interrupted,
}

struct AttemptState {
    ending: Ending,
    exit_code: Option<i32>,
    environment: Option<String>,
    output: String,
}

impl AttemptState {
    fn new() -> Self {
        Self {
            ending: Ending::Succeeded,
            exit_code: None,
            environment: None,
            output: String::new(),
        }
    }

    fn push_output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if !self.output.is_empty() {
            self.output.push('\n');
        }
        self.output.push_str(text);
    }

    fn fail(mut self, cause: FailureCause, message: &str) -> Self {
        self.ending = Ending::Failed(cause);
        self.push_output(message);
        self
    }

    fn interrupted(mut self) -> Self {
        self.ending = Ending::Interrupted;
        self
    }
}

/// Executes single jobs against an environment provider
pub struct JobExecutor {
    provider: Arc<dyn EnvironmentProvider>,
    cache: Option<Arc<CacheManager>>,
    project: String,
    git_ref: String,
    acquire_timeout: Duration,
    default_timeout: Option<Duration>,
    scratch_root: PathBuf,
    events: Option<ProgressSender>,
}

impl JobExecutor {
    pub fn new(provider: Arc<dyn EnvironmentProvider>, identity: &RunIdentity) -> Self {
        Self {
            provider,
            cache: None,
            project: identity.project.clone(),
            git_ref: identity.git_ref.clone(),
            acquire_timeout: Duration::from_secs(300),
            default_timeout: None,
            scratch_root: std::env::temp_dir().join("relay-scratch"),
            events: None,
        }
    }

    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Wall-clock limit for jobs without their own `timeout`
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Where `CI_CACHE_DIR` points when caching is disabled
    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.events = Some(tx);
        self
    }

    /// Run `job` to a final status, retrying as its policy allows.
    ///
    /// Produces at most `retry.max + 1` records. Cancelled attempts are
    /// never retried.
    pub async fn run(&self, job: &ResolvedJob, cancel: &CancellationToken) -> JobRun {
        let started = Instant::now();
        let mut records = Vec::new();
        let mut attempt = 1;

        loop {
            let span = tracing::info_span!("attempt", job = %job.name, attempt);
            let record = self.attempt(job, attempt, cancel).instrument(span).await;
            let outcome = record.outcome;
            records.push(record);

            let retry_cause = match outcome {
                AttemptOutcome::Succeeded | AttemptOutcome::Cancelled => None,
                AttemptOutcome::Failed { cause } => {
                    job.retry.should_retry(attempt, cause).then_some(cause)
                }
                AttemptOutcome::TimedOut => [
                    FailureCause::JobExecutionTimeout,
                    FailureCause::StuckOrTimeoutFailure,
                ]
                .into_iter()
                .find(|cause| job.retry.should_retry(attempt, *cause)),
            };

            match retry_cause {
                Some(cause) if !cancel.is_cancelled() => {
                    tracing::warn!(job = %job.name, attempt, %cause, "attempt failed, retrying");
                    self.events.send_event(ExecutionEvent::JobRetrying {
                        job_name: job.name.clone(),
                        next_attempt: attempt + 1,
                        cause,
                    });
                    attempt += 1;
                }
                _ => break,
            }
        }

        let run = JobRun::from_records(job, records);
        tracing::info!(job = %job.name, status = ?run.status, attempts = run.attempts(), "job finished");
        self.events.send_event(ExecutionEvent::job_completed(
            &job.stage,
            &job.name,
            run.status,
            run.attempts(),
            started.elapsed(),
        ));
        run
    }

    async fn attempt(&self, job: &ResolvedJob, attempt: u32, cancel: &CancellationToken) -> ExecutionRecord {
        let started_at = Utc::now();
        let started = Instant::now();
        let token = cancel.child_token();

        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = job.timeout.or(self.default_timeout).map(|limit| {
            let token = token.clone();
            let timed_out = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                timed_out.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        let state = self.run_attempt(job, attempt, &token).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }

        let outcome = match state.ending {
            Ending::Succeeded => AttemptOutcome::Succeeded,
            Ending::Failed(cause) => AttemptOutcome::Failed { cause },
            Ending::Interrupted if timed_out.load(Ordering::SeqCst) && !cancel.is_cancelled() => {
                AttemptOutcome::TimedOut
            }
            Ending::Interrupted => AttemptOutcome::Cancelled,
        };

        self.events.send_event(ExecutionEvent::AttemptCompleted {
            stage_name: job.stage.clone(),
            job_name: job.name.clone(),
            attempt,
            outcome,
            exit_code: state.exit_code,
            duration: started.elapsed(),
        });

        ExecutionRecord {
            job: job.name.clone(),
            attempt,
            started_at,
            finished_at: Utc::now(),
            outcome,
            exit_code: state.exit_code,
            environment: state.environment,
            output: state.output,
        }
    }

    async fn run_attempt(&self, job: &ResolvedJob, attempt: u32, token: &CancellationToken) -> AttemptState {
        let state = AttemptState::new();
        let request = EnvironmentRequest {
            job: job.name.clone(),
            image: job.image.clone(),
            tags: job.tags.clone(),
        };

        let acquired = tokio::select! {
            biased;
            _ = token.cancelled() => return state.interrupted(),
            acquired = tokio::time::timeout(self.acquire_timeout, self.provider.acquire(&request)) => acquired,
        };

        let mut environment = match acquired {
            Ok(Ok(environment)) => environment,
            Ok(Err(error)) => {
                tracing::warn!(job = %job.name, %error, "environment acquisition failed");
                return state.fail(error.cause(), &error.to_string());
            }
            Err(_) => {
                let message = format!(
                    "no environment became available within {}s",
                    self.acquire_timeout.as_secs()
                );
                tracing::warn!(job = %job.name, "{}", message);
                return state.fail(FailureCause::RunnerSystemFailure, &message);
            }
        };

        let mut state = state;
        state.environment = Some(environment.id().to_string());
        self.events.send_event(ExecutionEvent::AttemptStarted {
            stage_name: job.stage.clone(),
            job_name: job.name.clone(),
            attempt,
            max_attempts: job.retry.max_attempts(),
            environment: environment.id().to_string(),
        });

        let key = CacheKey::new(&self.project, &self.git_ref, &job.name);
        let lease = match &self.cache {
            Some(cache) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    environment.release().await;
                    return state.interrupted();
                }
                lease = cache.lease(&key) => Some(lease),
            },
            None => None,
        };
        let cache_dir = self.cache_dir(job, &key, lease.as_ref()).await;

        let env = job.variables_with_cache_dir(&cache_dir).to_env();
        let state = self
            .run_scripts(job, attempt, environment.as_mut(), &env, token, state)
            .await;

        environment.release().await;

        if let Some(lease) = lease {
            if matches!(state.ending, Ending::Succeeded) {
                lease.commit().await;
            }
        }
        state
    }

    async fn cache_dir(&self, job: &ResolvedJob, key: &CacheKey, lease: Option<&CacheLease>) -> String {
        match lease {
            Some(lease) => {
                if lease.is_fallback() {
                    self.events.send_event(ExecutionEvent::CacheFallback {
                        job_name: job.name.clone(),
                        key: key.to_string(),
                    });
                }
                lease.location().display().to_string()
            }
            None => {
                let scratch = self.scratch_root.join(key.relative_path());
                if let Err(error) = tokio::fs::create_dir_all(&scratch).await {
                    tracing::warn!(path = %scratch.display(), %error, "failed to create scratch directory");
                }
                scratch.display().to_string()
            }
        }
    }

    async fn run_scripts(
        &self,
        job: &ResolvedJob,
        attempt: u32,
        environment: &mut dyn Environment,
        env: &std::collections::HashMap<String, String>,
        token: &CancellationToken,
        mut state: AttemptState,
    ) -> AttemptState {
        for (line_index, line) in job.before_script.iter().chain(&job.script).enumerate() {
            if token.is_cancelled() {
                return state.interrupted();
            }
            state.exit_code = None;

            self.events.send_event(ExecutionEvent::LineStarted {
                job_name: job.name.clone(),
                attempt,
                line_index,
                line: line.clone(),
            });

            let status = match environment.exec(line, env, token).await {
                Ok(status) => status,
                Err(error) => {
                    tracing::warn!(job = %job.name, %error, "script line could not be executed");
                    return state.fail(error.cause(), &error.to_string());
                }
            };

            if !status.output().is_empty() {
                self.events.send_event(ExecutionEvent::LineOutput {
                    job_name: job.name.clone(),
                    attempt,
                    line_index,
                    output: status.output().to_string(),
                });
            }
            state.push_output(status.output());

            match status {
                ExecStatus::Exited { code, .. } => {
                    state.exit_code = Some(code);
                    if code != 0 {
                        tracing::debug!(job = %job.name, line_index, code, "script line failed");
                        state.ending = Ending::Failed(FailureCause::ScriptFailure);
                        return state;
                    }
                }
                ExecStatus::Interrupted { .. } => return state.interrupted(),
            }
        }
        state
    }
}
