// Environment Runtime
// Provisioning interface for the isolated environments jobs run in

pub mod container;
pub mod pool;
pub mod scripted;
pub mod shell;

pub use container::{DockerConfig, DockerProvider};
pub use pool::RunnerPool;
pub use scripted::ScriptedProvider;
pub use shell::LocalShellProvider;

use crate::parser::models::FailureCause;

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// What a job needs from an environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRequest {
    pub job: String,
    pub image: Option<String>,
    pub tags: Vec<String>,
}

/// How one script line ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecStatus {
    Exited { code: i32, output: String },
    /// The cancellation token fired and the line was killed
    Interrupted { output: String },
}

impl ExecStatus {
    pub fn output(&self) -> &str {
        match self {
            ExecStatus::Exited { output, .. } | ExecStatus::Interrupted { output } => output,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnvironmentError {
    #[error("no environment available: {0}")]
    Unavailable(String),

    #[error("provisioning API error: {0}")]
    Api(String),

    #[error("execution failed: {0}")]
    Exec(String),
}

impl EnvironmentError {
    /// Failure cause recorded for an attempt that hit this error
    pub fn cause(&self) -> FailureCause {
        match self {
            EnvironmentError::Unavailable(_) | EnvironmentError::Exec(_) => {
                FailureCause::RunnerSystemFailure
            }
            EnvironmentError::Api(_) => FailureCause::ApiFailure,
        }
    }
}

/// Hands out environments for job attempts
#[async_trait]
pub trait EnvironmentProvider: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    async fn acquire(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<Box<dyn Environment>, EnvironmentError>;
}

/// A provisioned environment owned by one job attempt
#[async_trait]
pub trait Environment: Send {
    fn id(&self) -> &str;

    /// Run one script line. Returns `Interrupted` once `cancel` fires.
    async fn exec(
        &mut self,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus, EnvironmentError>;

    /// Tear the environment down. Called exactly once per acquired environment.
    async fn release(&mut self);
}

/// Whether an environment carrying `offered` can serve a job asking for `wanted`
pub fn tags_match(wanted: &[String], offered: &[String]) -> bool {
    wanted.iter().all(|tag| offered.contains(tag))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_causes() {
        assert_eq!(
            EnvironmentError::Unavailable("x".into()).cause(),
            FailureCause::RunnerSystemFailure
        );
        assert_eq!(EnvironmentError::Api("x".into()).cause(), FailureCause::ApiFailure);
    }

    #[test]
    fn test_tags_match() {
        let offered = vec!["docker".to_string(), "large".to_string()];
        assert!(tags_match(&[], &offered));
        assert!(tags_match(&["docker".to_string()], &offered));
        assert!(!tags_match(&["gpu".to_string()], &offered));
    }
}
