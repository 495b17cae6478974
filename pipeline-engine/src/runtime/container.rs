// Docker Provider
// Runs each job attempt in a fresh container from the job's image

use crate::runtime::shell::run_to_completion;
use crate::runtime::{Environment, EnvironmentError, EnvironmentProvider, EnvironmentRequest, ExecStatus};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImagePullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// Configuration for container execution
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Container CLI to invoke
    pub program: String,
    /// Image for jobs without an `image` key
    pub default_image: String,
    pub pull_policy: ImagePullPolicy,
    /// Host paths mounted at the same location inside the container
    pub mounts: Vec<PathBuf>,
    /// Working directory inside the container
    pub working_dir: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            program: "docker".to_string(),
            default_image: "alpine:latest".to_string(),
            pull_policy: ImagePullPolicy::IfNotPresent,
            mounts: Vec::new(),
            working_dir: PathBuf::from("/"),
        }
    }
}

/// Provisions one container per acquisition
pub struct DockerProvider {
    config: DockerConfig,
    counter: AtomicUsize,
}

impl DockerProvider {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            counter: AtomicUsize::new(0),
        }
    }

    /// Check if the docker CLI is installed and the daemon answers
    pub async fn is_available() -> bool {
        if which::which("docker").is_err() {
            return false;
        }
        Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn docker(&self, args: &[String]) -> Result<String, EnvironmentError> {
        let output = Command::new(&self.config.program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| EnvironmentError::Unavailable(format!("docker is not available: {}", e)))?;

        if !output.status.success() {
            return Err(EnvironmentError::Api(format!(
                "docker {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn pull_if_needed(&self, image: &str) -> Result<(), EnvironmentError> {
        let pull = match self.config.pull_policy {
            ImagePullPolicy::Never => false,
            ImagePullPolicy::Always => true,
            ImagePullPolicy::IfNotPresent => self
                .docker(&["image".into(), "inspect".into(), image.into()])
                .await
                .is_err(),
        };

        if pull {
            tracing::info!(%image, "pulling image");
            self.docker(&["pull".into(), image.into()]).await?;
        }
        Ok(())
    }

    fn run_args(&self, name: &str, image: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
            "-w".to_string(),
            self.config.working_dir.display().to_string(),
        ];

        for mount in &self.config.mounts {
            args.push("-v".to_string());
            args.push(format!("{0}:{0}", mount.display()));
        }

        // Keep the container alive between script lines
        args.extend(
            [image, "tail", "-f", "/dev/null"]
                .into_iter()
                .map(String::from),
        );
        args
    }
}

#[async_trait]
impl EnvironmentProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn acquire(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        if which::which(&self.config.program).is_err() {
            return Err(EnvironmentError::Unavailable(format!(
                "{} CLI not found on PATH",
                self.config.program
            )));
        }

        let image = request
            .image
            .clone()
            .unwrap_or_else(|| self.config.default_image.clone());
        self.pull_if_needed(&image).await?;

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "relay-{}-{}-{}",
            crate::resolve::resolver::slugify(&request.job),
            std::process::id(),
            n
        );

        // Removes the container if startup fails or this future is dropped midway
        let pending = PendingContainer::new(&self.config.program, &name);
        let id = self.docker(&self.run_args(&name, &image)).await?;
        pending.disarm();
        tracing::debug!(job = %request.job, container = %name, %image, "container started");

        Ok(Box::new(ContainerEnvironment {
            id,
            name,
            program: self.config.program.clone(),
            working_dir: self.config.working_dir.clone(),
            released: false,
        }))
    }
}

/// Guard for a container whose `run` has not yet returned
struct PendingContainer {
    program: String,
    name: String,
    armed: bool,
}

impl PendingContainer {
    fn new(program: &str, name: &str) -> Self {
        Self {
            program: program.to_string(),
            name: name.to_string(),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingContainer {
    fn drop(&mut self) {
        if self.armed {
            tracing::debug!(container = %self.name, "container startup abandoned, removing");
            remove_detached(&self.program, &self.name);
        }
    }
}

/// Force-remove a container without awaiting the result
fn remove_detached(program: &str, name: &str) {
    let args = ["rm", "-f", name];
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            let mut command = Command::new(program);
            command.args(args).stdout(Stdio::null()).stderr(Stdio::null());
            let name = name.to_string();
            handle.spawn(async move {
                if let Err(error) = command.status().await {
                    tracing::warn!(container = %name, %error, "failed to remove container");
                }
            });
        }
        Err(_) => {
            let result = std::process::Command::new(program)
                .args(args)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
            if let Err(error) = result {
                tracing::warn!(container = %name, %error, "failed to remove container");
            }
        }
    }
}

struct ContainerEnvironment {
    id: String,
    name: String,
    program: String,
    working_dir: PathBuf,
    released: bool,
}

impl ContainerEnvironment {
    fn exec_args(&self, line: &str, env: &HashMap<String, String>) -> Vec<String> {
        let mut args = vec![
            "exec".to_string(),
            "-w".to_string(),
            self.working_dir.display().to_string(),
        ];
        for (key, value) in env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.extend([self.name.as_str(), "sh", "-c", line].into_iter().map(String::from));
        args
    }
}

#[async_trait]
impl Environment for ContainerEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(
        &mut self,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus, EnvironmentError> {
        let child = Command::new(&self.program)
            .args(self.exec_args(line, env))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvironmentError::Exec(format!("failed to run docker exec: {}", e)))?;

        let status = run_to_completion(child, cancel).await?;
        if matches!(status, ExecStatus::Interrupted { .. }) {
            // Killing the exec client leaves the process running in the container
            let _ = Command::new(&self.program)
                .args(["kill", &self.name])
                .kill_on_drop(true)
                .output()
                .await;
        }
        Ok(status)
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let result = Command::new(&self.program)
            .args(["rm", "-f", &self.name])
            .kill_on_drop(true)
            .output()
            .await;
        if let Err(e) = result {
            tracing::warn!(container = %self.name, error = %e, "failed to remove container");
        }
    }
}

impl Drop for ContainerEnvironment {
    fn drop(&mut self) {
        if !self.released {
            remove_detached(&self.program, &self.name);
        }
    }
}
