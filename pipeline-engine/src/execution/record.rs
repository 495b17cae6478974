// Execution Records
// Per-attempt records and the job, stage and pipeline runs built from them

use crate::parser::models::FailureCause;
use crate::resolve::{ResolvedJob, RunIdentity};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// How one attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed { cause: FailureCause },
    TimedOut,
    Cancelled,
}

impl AttemptOutcome {
    /// Cause reported for a failed or timed-out attempt
    pub fn cause(&self) -> Option<FailureCause> {
        match self {
            AttemptOutcome::Failed { cause } => Some(*cause),
            AttemptOutcome::TimedOut => Some(FailureCause::JobExecutionTimeout),
            AttemptOutcome::Succeeded | AttemptOutcome::Cancelled => None,
        }
    }
}

/// One attempt of one job. Appended, never modified.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub job: String,
    /// 1-based
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub exit_code: Option<i32>,
    pub environment: Option<String>,
    pub output: String,
}

impl ExecutionRecord {
    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }

    /// A record for a job that was cancelled before it could start
    pub fn cancelled_before_start(job: &str, reason: &str) -> Self {
        let now = Utc::now();
        Self {
            job: job.to_string(),
            attempt: 1,
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Cancelled,
            exit_code: None,
            environment: None,
            output: reason.to_string(),
        }
    }
}

/// Final status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    Failed,
    /// Failed, but `allow_failure` tolerates it
    AllowedFailure,
    Canceled,
    /// Never dispatched because an earlier stage halted the pipeline
    Skipped,
}

impl JobStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::AllowedFailure)
    }
}

/// Everything that happened to one job
#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub name: String,
    pub stage: String,
    pub allow_failure: bool,
    pub status: JobStatus,
    pub records: Vec<ExecutionRecord>,
}

impl JobRun {
    /// Derive the job status from its records
    pub fn from_records(job: &ResolvedJob, records: Vec<ExecutionRecord>) -> Self {
        let status = match records.last() {
            None => JobStatus::Skipped,
            Some(last) => match last.outcome {
                AttemptOutcome::Succeeded => JobStatus::Succeeded,
                AttemptOutcome::Cancelled => JobStatus::Canceled,
                AttemptOutcome::Failed { .. } | AttemptOutcome::TimedOut => {
                    if job.allow_failure.permits(last.exit_code) {
                        JobStatus::AllowedFailure
                    } else {
                        JobStatus::Failed
                    }
                }
            },
        };

        Self {
            name: job.name.clone(),
            stage: job.stage.clone(),
            allow_failure: job.allow_failure.is_enabled(),
            status,
            records,
        }
    }

    pub fn skipped(job: &ResolvedJob) -> Self {
        Self::from_records(job, Vec::new())
    }

    pub fn cancelled(job: &ResolvedJob, reason: &str) -> Self {
        Self::from_records(job, vec![ExecutionRecord::cancelled_before_start(&job.name, reason)])
    }

    /// The job's task panicked; no record of its own survived
    pub fn panicked(job: &ResolvedJob, message: &str) -> Self {
        let now = Utc::now();
        let record = ExecutionRecord {
            job: job.name.clone(),
            attempt: 1,
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Failed {
                cause: FailureCause::UnknownFailure,
            },
            exit_code: None,
            environment: None,
            output: message.to_string(),
        };
        Self::from_records(job, vec![record])
    }

    pub fn attempts(&self) -> usize {
        self.records.len()
    }

    pub fn retries(&self) -> usize {
        self.records.len().saturating_sub(1)
    }

    pub fn final_cause(&self) -> Option<FailureCause> {
        self.records.last().and_then(|r| r.outcome.cause())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.records.last().and_then(|r| r.exit_code)
    }

    pub fn duration(&self) -> Duration {
        self.records.iter().map(ExecutionRecord::duration).sum()
    }
}

/// Status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Succeeded,
    SucceededWithAllowedFailures,
    Failed,
    Canceled,
    Skipped,
}

impl StageStatus {
    /// Roll job statuses up into a terminal stage status
    pub fn from_jobs(jobs: &[JobRun]) -> Self {
        let any = |status: JobStatus| jobs.iter().any(|j| j.status == status);

        if any(JobStatus::Failed) {
            StageStatus::Failed
        } else if any(JobStatus::Canceled) {
            StageStatus::Canceled
        } else if !jobs.is_empty() && jobs.iter().all(|j| j.status == JobStatus::Skipped) {
            StageStatus::Skipped
        } else if any(JobStatus::AllowedFailure) {
            StageStatus::SucceededWithAllowedFailures
        } else {
            StageStatus::Succeeded
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageStatus::Pending | StageStatus::Running)
    }

    /// Whether the next stage may start after this one
    pub fn permits_next(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::SucceededWithAllowedFailures
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub name: String,
    pub ordinal: usize,
    pub status: StageStatus,
    pub jobs: Vec<JobRun>,
}

/// A finished pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub identity: RunIdentity,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub stages: Vec<StageRun>,
}

impl PipelineRun {
    pub fn job(&self, name: &str) -> Option<&JobRun> {
        self.stages.iter().flat_map(|s| &s.jobs).find(|j| j.name == name)
    }

    pub fn stage(&self, name: &str) -> Option<&StageRun> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{AllowFailure, ExitCodes, RetryPolicy};
    use crate::resolve::VariableSet;

    fn job(allow_failure: AllowFailure) -> ResolvedJob {
        ResolvedJob {
            name: "cargo_audit".to_string(),
            stage: "audit".to_string(),
            image: None,
            before_script: Vec::new(),
            script: vec!["cargo audit".to_string()],
            retry: RetryPolicy::none(),
            interruptible: false,
            tags: Vec::new(),
            allow_failure,
            timeout: None,
            variables: VariableSet::new(),
            raw_variables: VariableSet::new(),
        }
    }

    fn failed(code: i32) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            job: "cargo_audit".to_string(),
            attempt: 1,
            started_at: now,
            finished_at: now,
            outcome: AttemptOutcome::Failed {
                cause: FailureCause::ScriptFailure,
            },
            exit_code: Some(code),
            environment: None,
            output: String::new(),
        }
    }

    #[test]
    fn test_allow_failure_flag() {
        let run = JobRun::from_records(&job(AllowFailure::Flag(true)), vec![failed(1)]);
        assert_eq!(run.status, JobStatus::AllowedFailure);
        assert_eq!(run.final_cause(), Some(FailureCause::ScriptFailure));

        let run = JobRun::from_records(&job(AllowFailure::Flag(false)), vec![failed(1)]);
        assert_eq!(run.status, JobStatus::Failed);
    }

    #[test]
    fn test_allow_failure_exit_codes() {
        let allow = AllowFailure::ExitCodes {
            exit_codes: ExitCodes::Many(vec![137, 255]),
        };
        assert_eq!(
            JobRun::from_records(&job(allow.clone()), vec![failed(137)]).status,
            JobStatus::AllowedFailure
        );
        assert_eq!(
            JobRun::from_records(&job(allow), vec![failed(1)]).status,
            JobStatus::Failed
        );
    }

    #[test]
    fn test_stage_rollup() {
        let allowed = JobRun::from_records(&job(AllowFailure::Flag(true)), vec![failed(1)]);
        let failed_run = JobRun::from_records(&job(AllowFailure::Flag(false)), vec![failed(1)]);
        let cancelled = JobRun::cancelled(&job(AllowFailure::Flag(false)), "superseded");
        let skipped = JobRun::skipped(&job(AllowFailure::Flag(false)));

        assert_eq!(StageStatus::from_jobs(&[allowed.clone()]), StageStatus::SucceededWithAllowedFailures);
        assert_eq!(
            StageStatus::from_jobs(&[allowed.clone(), cancelled.clone(), failed_run]),
            StageStatus::Failed
        );
        assert_eq!(StageStatus::from_jobs(&[allowed, cancelled]), StageStatus::Canceled);
        assert_eq!(StageStatus::from_jobs(&[skipped]), StageStatus::Skipped);
        assert_eq!(StageStatus::from_jobs(&[]), StageStatus::Succeeded);
        assert!(StageStatus::SucceededWithAllowedFailures.permits_next());
        assert!(!StageStatus::Canceled.permits_next());
    }

    #[test]
    fn test_panicked_job_is_unknown_failure() {
        let run = JobRun::panicked(&job(AllowFailure::Flag(false)), "boom");
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.final_cause(), Some(FailureCause::UnknownFailure));
    }
}
