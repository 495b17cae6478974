// Pipeline Engine Library
// Core engine for GitLab-style CI document resolution and job orchestration

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod parser;
pub mod resolve;
pub mod runtime;
pub mod scm;

// Re-export commonly used types
pub use config::{EngineConfig, RunnerSlotConfig, RuntimeKind};
pub use engine::Engine;
pub use error::{EngineError, EngineResult};

// Re-export parser types
pub use parser::{Document, DocumentParser, FailureCause, ParseError, ParseErrorKind, ParseResult};

// Re-export resolution types
pub use resolve::{ResolvedJob, ResolvedPipeline, ResolvedStage, Resolver, RunIdentity, VariableSet};

// Re-export execution types
pub use execution::{
    progress_channel, ExecutionEvent, JobExecutor, JobStatus, PipelineRun, PipelineScheduler,
    PipelineStatus, PipelineSummary, PreemptionRegistry, ProgressReceiver, ProgressSender,
    RunControl, StageStatus,
};

// Re-export runtime types
pub use runtime::{DockerProvider, EnvironmentProvider, LocalShellProvider, RunnerPool, ScriptedProvider};

// Re-export cache and source control types
pub use cache::{CacheManager, CacheStore, FsCacheStore};
pub use scm::{GitSourceControl, SourceControl, StaticSourceControl};
