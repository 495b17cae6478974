// Result Aggregator
// Overall pipeline status, per-job report and process exit code

use crate::execution::record::{JobStatus, PipelineRun, StageStatus};
use crate::parser::models::FailureCause;

use serde::Serialize;
use std::fmt;

/// Overall status of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    SucceededWithAllowedFailures,
    Failed,
    Canceled,
}

impl PipelineStatus {
    /// Failed beats Canceled, which beats allowed failures
    pub fn of(run: &PipelineRun) -> Self {
        let any_stage = |status: StageStatus| run.stages.iter().any(|s| s.status == status);
        let any_allowed = run
            .stages
            .iter()
            .flat_map(|s| &s.jobs)
            .any(|j| j.status == JobStatus::AllowedFailure);

        if any_stage(StageStatus::Failed) {
            PipelineStatus::Failed
        } else if any_stage(StageStatus::Canceled) {
            PipelineStatus::Canceled
        } else if any_allowed {
            PipelineStatus::SucceededWithAllowedFailures
        } else {
            PipelineStatus::Succeeded
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStatus::Succeeded | PipelineStatus::SucceededWithAllowedFailures => 0,
            PipelineStatus::Failed => 1,
            PipelineStatus::Canceled => 2,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::SucceededWithAllowedFailures => "succeeded with allowed failures",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Canceled => "canceled",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    pub name: String,
    pub status: StageStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub name: String,
    pub stage: String,
    pub status: JobStatus,
    pub attempts: usize,
    pub retries: usize,
    pub duration_secs: f64,
    pub final_cause: Option<FailureCause>,
    pub exit_code: Option<i32>,
    pub allow_failure: bool,
}

/// Report of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineSummary {
    pub pipeline_id: String,
    pub project: String,
    pub git_ref: String,
    pub status: PipelineStatus,
    pub duration_secs: f64,
    pub stages: Vec<StageSummary>,
    pub jobs: Vec<JobSummary>,
}

impl PipelineSummary {
    pub fn from_run(run: &PipelineRun) -> Self {
        let stages = run
            .stages
            .iter()
            .map(|s| StageSummary {
                name: s.name.clone(),
                status: s.status,
            })
            .collect();

        let jobs = run
            .stages
            .iter()
            .flat_map(|s| &s.jobs)
            .map(|job| JobSummary {
                name: job.name.clone(),
                stage: job.stage.clone(),
                status: job.status,
                attempts: job.attempts(),
                retries: job.retries(),
                duration_secs: job.duration().as_secs_f64(),
                final_cause: job.final_cause(),
                exit_code: job.exit_code(),
                allow_failure: job.allow_failure,
            })
            .collect();

        Self {
            pipeline_id: run.identity.pipeline_id.clone(),
            project: run.identity.project.clone(),
            git_ref: run.identity.git_ref.clone(),
            status: PipelineStatus::of(run),
            duration_secs: run.duration().as_secs_f64(),
            stages,
            jobs,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn job(&self, name: &str) -> Option<&JobSummary> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::record::{AttemptOutcome, ExecutionRecord, JobRun, StageRun};
    use crate::resolve::RunIdentity;
    use chrono::Utc;

    fn job(name: &str, stage: &str, status: JobStatus, outcomes: &[AttemptOutcome]) -> JobRun {
        let now = Utc::now();
        JobRun {
            name: name.to_string(),
            stage: stage.to_string(),
            allow_failure: status == JobStatus::AllowedFailure,
            status,
            records: outcomes
                .iter()
                .enumerate()
                .map(|(i, outcome)| ExecutionRecord {
                    job: name.to_string(),
                    attempt: i as u32 + 1,
                    started_at: now,
                    finished_at: now,
                    outcome: *outcome,
                    exit_code: None,
                    environment: None,
                    output: String::new(),
                })
                .collect(),
        }
    }

    fn run(stages: Vec<(StageStatus, Vec<JobRun>)>) -> PipelineRun {
        let now = Utc::now();
        PipelineRun {
            identity: RunIdentity::new("relay", "main").with_pipeline_id("3"),
            started_at: now,
            finished_at: now,
            stages: stages
                .into_iter()
                .enumerate()
                .map(|(ordinal, (status, jobs))| StageRun {
                    name: format!("stage{}", ordinal),
                    ordinal,
                    status,
                    jobs,
                })
                .collect(),
        }
    }

    const FAILED: AttemptOutcome = AttemptOutcome::Failed {
        cause: FailureCause::ScriptFailure,
    };

    #[test]
    fn test_status_precedence() {
        let allowed = job("a", "stage0", JobStatus::AllowedFailure, &[FAILED]);
        let ok = job("b", "stage1", JobStatus::Succeeded, &[AttemptOutcome::Succeeded]);

        let summary = PipelineSummary::from_run(&run(vec![
            (StageStatus::SucceededWithAllowedFailures, vec![allowed.clone()]),
            (StageStatus::Succeeded, vec![ok.clone()]),
        ]));
        assert_eq!(summary.status, PipelineStatus::SucceededWithAllowedFailures);
        assert_eq!(summary.exit_code(), 0);

        let summary = PipelineSummary::from_run(&run(vec![
            (StageStatus::Canceled, vec![]),
            (StageStatus::Failed, vec![]),
        ]));
        assert_eq!(summary.status, PipelineStatus::Failed);
        assert_eq!(summary.exit_code(), 1);

        let summary = PipelineSummary::from_run(&run(vec![
            (StageStatus::SucceededWithAllowedFailures, vec![allowed]),
            (StageStatus::Canceled, vec![]),
        ]));
        assert_eq!(summary.exit_code(), 2);

        let summary = PipelineSummary::from_run(&run(vec![(StageStatus::Succeeded, vec![ok])]));
        assert_eq!(summary.status, PipelineStatus::Succeeded);
    }

    #[test]
    fn test_job_entries() {
        let retried = job(
            "cargo_remote_build",
            "stage0",
            JobStatus::Succeeded,
            &[
                AttemptOutcome::Failed {
                    cause: FailureCause::RunnerSystemFailure,
                },
                AttemptOutcome::Succeeded,
            ],
        );
        let summary = PipelineSummary::from_run(&run(vec![(StageStatus::Succeeded, vec![retried])]));

        let entry = summary.job("cargo_remote_build").unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.retries, 1);
        assert_eq!(entry.final_cause, None);
    }

    #[test]
    fn test_json_report() {
        let failed = job("cargo_audit", "stage0", JobStatus::Failed, &[FAILED]);
        let summary = PipelineSummary::from_run(&run(vec![(StageStatus::Failed, vec![failed])]));

        let json: serde_json::Value = serde_json::from_str(&summary.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["jobs"][0]["final_cause"], "script_failure");
        assert_eq!(json["stages"][0]["status"], "failed");
    }
}
