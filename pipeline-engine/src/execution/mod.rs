// Execution Module
// Stage scheduling, job execution, pre-emption and result aggregation

pub mod events;
pub mod executor;
pub mod preemption;
pub mod record;
pub mod scheduler;
pub mod summary;

pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::JobExecutor;
pub use preemption::{PreemptionRegistry, RunControl};
pub use record::{AttemptOutcome, ExecutionRecord, JobRun, JobStatus, PipelineRun, StageRun, StageStatus};
pub use scheduler::PipelineScheduler;
pub use summary::{JobSummary, PipelineStatus, PipelineSummary, StageSummary};
