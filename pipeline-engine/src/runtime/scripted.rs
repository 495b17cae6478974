// Scripted Provider
// Deterministic environments whose results are programmed up front.
// Backs `--runtime dry-run` and the engine's own tests.

use crate::runtime::{Environment, EnvironmentError, EnvironmentProvider, EnvironmentRequest, ExecStatus};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// One executed line
#[derive(Debug, Clone)]
pub struct ExecEntry {
    pub job: String,
    pub environment: String,
    pub line: String,
    pub env: HashMap<String, String>,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Default)]
struct Program {
    /// Exit codes per line, consumed front first; the last one repeats
    exit_codes: HashMap<String, VecDeque<i32>>,
    delays: HashMap<String, Duration>,
    /// Remaining acquisition failures per job
    acquire_failures: HashMap<String, VecDeque<EnvironmentError>>,
}

#[derive(Default)]
struct Journal {
    execs: Vec<ExecEntry>,
    acquired: HashMap<String, usize>,
    released: usize,
    active: usize,
    max_active: usize,
}

#[derive(Default)]
struct Shared {
    program: Mutex<Program>,
    journal: Mutex<Journal>,
}

/// Environments that run nothing and answer from a script
#[derive(Clone)]
pub struct ScriptedProvider {
    name: String,
    shared: Arc<Shared>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    /// Every line exits 0
    pub fn new() -> Self {
        Self {
            name: "scripted".to_string(),
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn dry_run() -> Self {
        Self {
            name: "dry-run".to_string(),
            ..Self::new()
        }
    }

    /// Exit codes for successive runs of `line`
    pub fn on_line(self, line: &str, codes: impl IntoIterator<Item = i32>) -> Self {
        self.shared
            .program
            .lock()
            .exit_codes
            .insert(line.to_string(), codes.into_iter().collect());
        self
    }

    /// Make `line` take `delay` before exiting
    pub fn delay_line(self, line: &str, delay: Duration) -> Self {
        self.shared
            .program
            .lock()
            .delays
            .insert(line.to_string(), delay);
        self
    }

    /// Fail the next acquisitions for `job` with the given errors, in order
    pub fn fail_acquire(self, job: &str, errors: impl IntoIterator<Item = EnvironmentError>) -> Self {
        self.shared
            .program
            .lock()
            .acquire_failures
            .insert(job.to_string(), errors.into_iter().collect());
        self
    }

    pub fn exec_log(&self) -> Vec<ExecEntry> {
        self.shared.journal.lock().execs.clone()
    }

    /// Lines executed for one job, in order
    pub fn lines_for(&self, job: &str) -> Vec<String> {
        self.shared
            .journal
            .lock()
            .execs
            .iter()
            .filter(|e| e.job == job)
            .map(|e| e.line.clone())
            .collect()
    }

    /// Acquisition attempts for a job, failed ones included
    pub fn acquisitions(&self, job: &str) -> usize {
        self.shared
            .journal
            .lock()
            .acquired
            .get(job)
            .copied()
            .unwrap_or(0)
    }

    pub fn released(&self) -> usize {
        self.shared.journal.lock().released
    }

    /// Environments currently held
    pub fn active(&self) -> usize {
        self.shared.journal.lock().active
    }

    /// Highest number of environments held at once
    pub fn max_active(&self) -> usize {
        self.shared.journal.lock().max_active
    }

    fn next_exit_code(&self, line: &str) -> i32 {
        let mut program = self.shared.program.lock();
        match program.exit_codes.get_mut(line) {
            Some(codes) if codes.len() > 1 => codes.pop_front().unwrap_or(0),
            Some(codes) => codes.front().copied().unwrap_or(0),
            None => 0,
        }
    }
}

#[async_trait]
impl EnvironmentProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn acquire(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let count = {
            let mut journal = self.shared.journal.lock();
            let count = journal.acquired.entry(request.job.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let failure = self
            .shared
            .program
            .lock()
            .acquire_failures
            .get_mut(&request.job)
            .and_then(VecDeque::pop_front);
        if let Some(error) = failure {
            return Err(error);
        }

        {
            let mut journal = self.shared.journal.lock();
            journal.active += 1;
            journal.max_active = journal.max_active.max(journal.active);
        }

        Ok(Box::new(ScriptedEnvironment {
            id: format!("{}-{}-{}", self.name, request.job, count),
            job: request.job.clone(),
            provider: self.clone(),
            released: false,
        }))
    }
}

struct ScriptedEnvironment {
    id: String,
    job: String,
    provider: ScriptedProvider,
    released: bool,
}

#[async_trait]
impl Environment for ScriptedEnvironment {
    fn id(&self) -> &str {
        &self.id
    }

    async fn exec(
        &mut self,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus, EnvironmentError> {
        let started = Instant::now();
        let delay = self.provider.shared.program.lock().delays.get(line).copied();

        let interrupted = match delay {
            Some(delay) => tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancel.cancelled() => true,
            },
            None => cancel.is_cancelled(),
        };

        self.provider.shared.journal.lock().execs.push(ExecEntry {
            job: self.job.clone(),
            environment: self.id.clone(),
            line: line.to_string(),
            env: env.clone(),
            started,
            finished: Instant::now(),
        });

        let output = format!("$ {}", line);
        if interrupted {
            return Ok(ExecStatus::Interrupted { output });
        }
        Ok(ExecStatus::Exited {
            code: self.provider.next_exit_code(line),
            output,
        })
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let mut journal = self.provider.shared.journal.lock();
        journal.active = journal.active.saturating_sub(1);
        journal.released += 1;
    }
}
