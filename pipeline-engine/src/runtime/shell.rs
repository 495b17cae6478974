// Local Shell Provider
// Runs script lines with the host shell in the project directory

use crate::runtime::{Environment, EnvironmentError, EnvironmentProvider, EnvironmentRequest, ExecStatus};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Shell used to interpret script lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// sh on Unix, cmd on Windows
    Default,
    Bash,
}

impl Shell {
    fn command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Runs every job on the local machine, ignoring `image`
pub struct LocalShellProvider {
    shell: Shell,
    working_dir: PathBuf,
    counter: AtomicUsize,
}

impl LocalShellProvider {
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            shell: Shell::Default,
            working_dir: working_dir.as_ref().to_path_buf(),
            counter: AtomicUsize::new(0),
        }
    }

    pub fn with_shell(mut self, shell: Shell) -> Self {
        self.shell = shell;
        self
    }
}

#[async_trait]
impl EnvironmentProvider for LocalShellProvider {
    fn name(&self) -> &str {
        "shell"
    }

    async fn acquire(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let (program, _) = self.shell.command();
        if which::which(program).is_err() {
            return Err(EnvironmentError::Unavailable(format!(
                "shell '{}' not found on PATH",
                program
            )));
        }
        if !self.working_dir.is_dir() {
            return Err(EnvironmentError::Unavailable(format!(
                "working directory {} does not exist",
                self.working_dir.display()
            )));
        }
        if let Some(image) = &request.image {
            tracing::debug!(job = %request.job, %image, "shell runtime ignores image");
        }

        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(ShellEnvironment {
            id: format!("shell-{}-{}", request.job, n),
            shell: self.shell,
            working_dir: self.working_dir.clone(),
        }))
    }
}

struct ShellEnvironment {
    id: String,
    shell: Shell,
    working_dir: PathBuf,
}

#[async_trait]
impl Environment for ShellEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(
        &mut self,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus, EnvironmentError> {
        let (program, args) = self.shell.command();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg(line)
            .current_dir(&self.working_dir)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| {
            EnvironmentError::Exec(format!("failed to spawn '{}': {}", program, e))
        })?;

        run_to_completion(child, cancel).await
    }

    async fn release(&mut self) {}
}

/// Wait for a child while collecting its output; kill it once `cancel` fires
pub(crate) async fn run_to_completion(
    mut child: tokio::process::Child,
    cancel: &CancellationToken,
) -> Result<ExecStatus, EnvironmentError> {
    let stdout = child.stdout.take().map(|s| tokio::spawn(collect_lines(s)));
    let stderr = child.stderr.take().map(|s| tokio::spawn(collect_lines(s)));

    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            None
        }
    };

    // Grandchildren of a killed shell may keep the pipes open
    let grace = waited.is_none().then(|| Duration::from_millis(500));

    let mut output = String::new();
    for handle in [stdout, stderr].into_iter().flatten() {
        let text = match grace {
            Some(grace) => tokio::time::timeout(grace, handle)
                .await
                .ok()
                .and_then(Result::ok)
                .unwrap_or_default(),
            None => handle.await.unwrap_or_default(),
        };
        if text.is_empty() {
            continue;
        }
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&text);
    }

    match waited {
        None => Ok(ExecStatus::Interrupted { output }),
        Some(Ok(status)) => Ok(ExecStatus::Exited {
            // Killed by a signal
            code: status.code().unwrap_or(-1),
            output,
        }),
        Some(Err(e)) => Err(EnvironmentError::Exec(format!("failed to wait for process: {}", e))),
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = BufReader::new(reader).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}
