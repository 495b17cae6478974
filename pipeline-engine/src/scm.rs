// Source Control
// Ref and history metadata for the checkout a pipeline runs against

use crate::error::{EngineError, EngineResult};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Branch or tag name of the checkout
    async fn current_ref(&self) -> EngineResult<String>;

    /// Number of commits reachable from HEAD
    async fn commit_depth(&self) -> EngineResult<u32>;
}

/// Reads metadata from a git working tree
pub struct GitSourceControl {
    repo: PathBuf,
}

impl GitSourceControl {
    pub fn new(repo: impl AsRef<Path>) -> Self {
        Self {
            repo: repo.as_ref().to_path_buf(),
        }
    }

    /// Check that a `git` binary is on PATH
    pub fn is_available() -> bool {
        which::which("git").is_ok()
    }

    async fn git(&self, args: &[&str]) -> EngineResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .output()
            .await
            .map_err(|e| EngineError::SourceControl(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(EngineError::SourceControl(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl SourceControl for GitSourceControl {
    async fn current_ref(&self) -> EngineResult<String> {
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        if branch != "HEAD" {
            return Ok(branch);
        }
        // Detached checkout: fall back to a tag, then the short hash
        match self.git(&["describe", "--tags", "--exact-match"]).await {
            Ok(tag) => Ok(tag),
            Err(_) => self.git(&["rev-parse", "--short", "HEAD"]).await,
        }
    }

    async fn commit_depth(&self) -> EngineResult<u32> {
        let count = self.git(&["rev-list", "--count", "HEAD"]).await?;
        count
            .parse()
            .map_err(|_| EngineError::SourceControl(format!("unexpected commit count '{}'", count)))
    }
}

/// Fixed metadata, for checkouts without git and for tests
#[derive(Debug, Clone)]
pub struct StaticSourceControl {
    pub git_ref: String,
    pub depth: u32,
}

impl StaticSourceControl {
    pub fn new(git_ref: impl Into<String>, depth: u32) -> Self {
        Self {
            git_ref: git_ref.into(),
            depth,
        }
    }
}

#[async_trait]
impl SourceControl for StaticSourceControl {
    async fn current_ref(&self) -> EngineResult<String> {
        Ok(self.git_ref.clone())
    }

    async fn commit_depth(&self) -> EngineResult<u32> {
        Ok(self.depth)
    }
}
