// Run Control and Pre-emption
// Cancellation tokens for one run and supersession of older runs on the same ref

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RunState {
    non_interruptible_started: bool,
    superseded: bool,
    finished: bool,
}

/// Cancellation handles for one pipeline run.
///
/// `cancel` stops everything. Supersession only cancels interruptible jobs
/// and keeps later stages from starting.
#[derive(Debug)]
pub struct RunControl {
    pipeline_id: String,
    run_token: CancellationToken,
    preempt_token: CancellationToken,
    state: Mutex<RunState>,
}

impl RunControl {
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        let run_token = CancellationToken::new();
        let preempt_token = run_token.child_token();
        Self {
            pipeline_id: pipeline_id.into(),
            run_token,
            preempt_token,
            state: Mutex::new(RunState::default()),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Cancel every job of the run
    pub fn cancel(&self) {
        self.run_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.run_token.is_cancelled()
    }

    pub fn is_superseded(&self) -> bool {
        self.state.lock().superseded
    }

    /// No further stage may start
    pub fn is_stopping(&self) -> bool {
        self.is_cancelled() || self.is_superseded()
    }

    /// Token a job should observe
    pub fn token_for(&self, interruptible: bool) -> CancellationToken {
        if interruptible {
            self.preempt_token.child_token()
        } else {
            self.run_token.child_token()
        }
    }

    /// Check the run is still live and note that a job is starting.
    ///
    /// Returns false when the job must not start. Starting a
    /// non-interruptible job makes the run immune to supersession.
    pub fn begin_job(&self, interruptible: bool) -> bool {
        let mut state = self.state.lock();
        if state.superseded || self.run_token.is_cancelled() {
            return false;
        }
        if !interruptible {
            state.non_interruptible_started = true;
        }
        true
    }

    /// Supersede this run unless a non-interruptible job already started
    fn try_supersede(&self) -> bool {
        let mut state = self.state.lock();
        if state.finished || state.non_interruptible_started {
            return false;
        }
        if !state.superseded {
            state.superseded = true;
            self.preempt_token.cancel();
        }
        true
    }

    fn mark_finished(&self) {
        self.state.lock().finished = true;
    }
}

/// Tracks live runs per (project, ref)
#[derive(Debug, Default)]
pub struct PreemptionRegistry {
    runs: Mutex<HashMap<(String, String), Vec<Arc<RunControl>>>>,
}

impl PreemptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run, superseding older runs on the same ref where allowed
    pub fn register(&self, project: &str, git_ref: &str, pipeline_id: &str) -> Arc<RunControl> {
        let control = Arc::new(RunControl::new(pipeline_id));
        let mut runs = self.runs.lock();
        let live = runs
            .entry((project.to_string(), git_ref.to_string()))
            .or_default();

        for older in live.iter() {
            if older.try_supersede() {
                tracing::info!(
                    superseded = %older.pipeline_id(),
                    by = %pipeline_id,
                    %git_ref,
                    "superseding older run"
                );
            } else {
                tracing::info!(
                    older = %older.pipeline_id(),
                    %git_ref,
                    "older run has started a non-interruptible job, leaving it running"
                );
            }
        }

        live.push(control.clone());
        control
    }

    /// Forget a finished run
    pub fn finish(&self, project: &str, git_ref: &str, control: &Arc<RunControl>) {
        control.mark_finished();
        let mut runs = self.runs.lock();
        let key = (project.to_string(), git_ref.to_string());
        if let Some(live) = runs.get_mut(&key) {
            live.retain(|c| !Arc::ptr_eq(c, control));
            if live.is_empty() {
                runs.remove(&key);
            }
        }
    }

    pub fn live_runs(&self, project: &str, git_ref: &str) -> usize {
        self.runs
            .lock()
            .get(&(project.to_string(), git_ref.to_string()))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newer_run_supersedes_interruptible_run() {
        let registry = PreemptionRegistry::new();
        let old = registry.register("relay", "main", "1");
        let old_job = old.token_for(true);
        let old_protected = old.token_for(false);
        assert!(old.begin_job(true));

        let _new = registry.register("relay", "main", "2");

        assert!(old.is_superseded());
        assert!(old_job.is_cancelled());
        assert!(!old_protected.is_cancelled());
        assert!(!old.begin_job(false));
    }

    #[test]
    fn test_started_non_interruptible_job_blocks_supersession() {
        let registry = PreemptionRegistry::new();
        let old = registry.register("relay", "main", "1");
        let old_job = old.token_for(true);
        assert!(old.begin_job(false));

        let _new = registry.register("relay", "main", "2");

        assert!(!old.is_superseded());
        assert!(!old_job.is_cancelled());
        assert!(old.begin_job(true));
    }

    #[test]
    fn test_other_refs_are_untouched() {
        let registry = PreemptionRegistry::new();
        let main = registry.register("relay", "main", "1");
        let _feature = registry.register("relay", "feature", "2");
        assert!(!main.is_superseded());
    }

    #[test]
    fn test_finish_forgets_run() {
        let registry = PreemptionRegistry::new();
        let run = registry.register("relay", "main", "1");
        assert_eq!(registry.live_runs("relay", "main"), 1);

        registry.finish("relay", "main", &run);
        assert_eq!(registry.live_runs("relay", "main"), 0);

        let _next = registry.register("relay", "main", "2");
        assert!(!run.is_superseded());
    }

    #[test]
    fn test_cancel_reaches_every_job() {
        let control = RunControl::new("1");
        let a = control.token_for(true);
        let b = control.token_for(false);
        control.cancel();
        assert!(a.is_cancelled() && b.is_cancelled());
        assert!(control.is_stopping());
        assert!(!control.begin_job(true));
    }
}
