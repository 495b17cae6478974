// Engine Configuration
// Scheduler limits, cache location and runtime selection

use crate::error::{EngineError, EngineResult};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which environment provider jobs run on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    /// `sh -c` in the project directory
    #[default]
    Shell,
    /// One container per attempt
    Docker,
    /// Nothing is executed; every line succeeds
    DryRun,
}

impl std::str::FromStr for RuntimeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shell" => Ok(Self::Shell),
            "docker" => Ok(Self::Docker),
            "dry-run" => Ok(Self::DryRun),
            other => Err(format!(
                "unknown runtime '{}', expected one of: shell, docker, dry-run",
                other
            )),
        }
    }
}

/// A tagged group of environments with a fixed capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerSlotConfig {
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_capacity() -> usize {
    1
}

/// Engine configuration, loaded from YAML with every field defaulted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum jobs running at once within a stage (0 = unlimited)
    pub max_parallel: usize,
    /// Keep running later stages after a failed one
    pub continue_on_failure: bool,
    /// How long a job may wait for an environment
    pub acquire_timeout_secs: u64,
    /// Wall-clock limit for jobs without a `timeout` key (0 = none)
    pub default_timeout_secs: u64,
    pub cache_enabled: bool,
    pub cache_root: PathBuf,
    /// Checkout jobs run against
    pub workspace_root: PathBuf,
    pub runtime: RuntimeKind,
    /// Runner slots; empty means one unbounded, untagged slot
    pub runners: Vec<RunnerSlotConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cache_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".relay")
            .join("cache");

        Self {
            max_parallel: 0,
            continue_on_failure: false,
            acquire_timeout_secs: 300,
            default_timeout_secs: 3600,
            cache_enabled: true,
            cache_root,
            workspace_root: PathBuf::from("."),
            runtime: RuntimeKind::default(),
            runners: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_yaml(content: &str) -> EngineResult<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(content).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        for slot in &self.runners {
            if slot.capacity == 0 {
                return Err(EngineError::Config(format!(
                    "runner slot '{}' has zero capacity",
                    slot.name
                )));
            }
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_secs > 0).then(|| Duration::from_secs(self.default_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_parallel, 0);
        assert!(!config.continue_on_failure);
        assert!(config.cache_root.ends_with(".relay/cache"));
        assert_eq!(config.default_timeout(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml(
            r#"
max_parallel: 4
runtime: dry-run
runners:
  - name: docker-large
    tags: [docker, large]
    capacity: 2
  - name: shared
"#,
        )
        .unwrap();

        assert_eq!(config.max_parallel, 4);
        assert_eq!(config.runtime, RuntimeKind::DryRun);
        assert_eq!(config.acquire_timeout_secs, 300);
        assert_eq!(config.runners[0].tags, vec!["docker", "large"]);
        assert_eq!(config.runners[1].capacity, 1);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = EngineConfig::from_yaml("runners:\n  - name: x\n    capacity: 0\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_timeout_secs: 0\ncache_enabled: false").unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_timeout(), None);
        assert!(!config.cache_enabled);
    }

    #[test]
    fn test_runtime_from_str() {
        assert_eq!("docker".parse::<RuntimeKind>(), Ok(RuntimeKind::Docker));
        assert!("podman".parse::<RuntimeKind>().is_err());
    }
}
