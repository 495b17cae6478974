// Execution Events
// Progress reporting for pipeline runs

use crate::execution::record::{AttemptOutcome, JobStatus, StageStatus};
use crate::execution::summary::PipelineStatus;
use crate::parser::models::FailureCause;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during a pipeline run
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        pipeline_id: String,
        git_ref: String,
        total_stages: usize,
        total_jobs: usize,
    },

    PipelineCompleted {
        pipeline_id: String,
        status: PipelineStatus,
        duration: Duration,
    },

    StageStarted {
        stage_name: String,
        total_jobs: usize,
    },

    StageCompleted {
        stage_name: String,
        status: StageStatus,
        duration: Duration,
    },

    /// Stage never dispatched (earlier failure, cancellation or supersession)
    StageSkipped {
        stage_name: String,
        status: StageStatus,
        reason: String,
    },

    AttemptStarted {
        stage_name: String,
        job_name: String,
        attempt: u32,
        max_attempts: u32,
        environment: String,
    },

    /// A script line is about to run
    LineStarted {
        job_name: String,
        attempt: u32,
        line_index: usize,
        line: String,
    },

    /// Captured output of one script line
    LineOutput {
        job_name: String,
        attempt: u32,
        line_index: usize,
        output: String,
    },

    AttemptCompleted {
        stage_name: String,
        job_name: String,
        attempt: u32,
        outcome: AttemptOutcome,
        exit_code: Option<i32>,
        duration: Duration,
    },

    /// A failed attempt will be retried
    JobRetrying {
        job_name: String,
        next_attempt: u32,
        cause: FailureCause,
    },

    JobCompleted {
        stage_name: String,
        job_name: String,
        status: JobStatus,
        attempts: usize,
        duration: Duration,
    },

    /// Cache entry was unreadable and the job started from an empty cache
    CacheFallback { job_name: String, key: String },
}

impl ExecutionEvent {
    pub fn stage_started(name: impl Into<String>, total_jobs: usize) -> Self {
        Self::StageStarted {
            stage_name: name.into(),
            total_jobs,
        }
    }

    pub fn stage_completed(name: impl Into<String>, status: StageStatus, duration: Duration) -> Self {
        Self::StageCompleted {
            stage_name: name.into(),
            status,
            duration,
        }
    }

    pub fn stage_skipped(
        name: impl Into<String>,
        status: StageStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self::StageSkipped {
            stage_name: name.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn job_completed(
        stage_name: impl Into<String>,
        job_name: impl Into<String>,
        status: JobStatus,
        attempts: usize,
        duration: Duration,
    ) -> Self {
        Self::JobCompleted {
            stage_name: stage_name.into(),
            job_name: job_name.into(),
            status,
            attempts,
            duration,
        }
    }

    /// Job the event belongs to, if any
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Self::AttemptStarted { job_name, .. }
            | Self::LineStarted { job_name, .. }
            | Self::LineOutput { job_name, .. }
            | Self::AttemptCompleted { job_name, .. }
            | Self::JobRetrying { job_name, .. }
            | Self::JobCompleted { job_name, .. }
            | Self::CacheFallback { job_name, .. } => Some(job_name),
            _ => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}
