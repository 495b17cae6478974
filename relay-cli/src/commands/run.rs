use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{
    progress_channel, DockerProvider, Engine, ExecutionEvent, JobStatus, PipelineStatus,
    PipelineSummary, RuntimeKind, StageStatus,
};

/// Run a pipeline document
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Run only the named job (can be repeated)
    #[arg(long = "job", value_name = "JOB")]
    pub jobs: Vec<String>,

    /// Run only jobs of the named stage
    #[arg(long, value_name = "STAGE")]
    pub stage: Option<String>,

    /// Git ref to report (default: read from git)
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Project name used for cache keys (default: workspace directory name)
    #[arg(long, value_name = "NAME")]
    pub project: Option<String>,

    /// Working directory for execution
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Engine configuration file
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Where jobs run: shell, docker or dry-run
    #[arg(long, value_name = "RUNTIME")]
    pub runtime: Option<RuntimeKind>,

    /// Maximum concurrently running jobs per stage (0 = unbounded)
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Keep running later stages after a stage fails
    #[arg(long)]
    pub continue_on_failure: bool,

    /// Cache root directory
    #[arg(long, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Disable the build cache
    #[arg(long)]
    pub no_cache: bool,

    /// Print the final report as JSON on stdout
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs) -> Result<i32> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    let overrides = super::parse_variables(&args.variables)?;

    // File values first, flags on top
    let mut config = super::load_config(args.config.as_deref())?;
    let workspace = match &args.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    config.workspace_root = workspace.clone();
    if let Some(runtime) = args.runtime {
        config.runtime = runtime;
    }
    if let Some(max_parallel) = args.max_parallel {
        config.max_parallel = max_parallel;
    }
    if args.continue_on_failure {
        config.continue_on_failure = true;
    }
    if let Some(cache_dir) = &args.cache_dir {
        config.cache_root = cache_dir.clone();
    }
    if args.no_cache {
        config.cache_enabled = false;
    }

    if config.runtime == RuntimeKind::Docker && !DockerProvider::is_available().await {
        color_eyre::eyre::bail!("The docker runtime was selected but the docker daemon is not reachable");
    }

    let (tx, mut rx) = progress_channel();
    let engine = Engine::new(config).with_progress(tx);

    output::status("Parsing", &format!("{}", pipeline_path.display()));
    let document = engine.load(pipeline_path)?;

    let identity = super::identity(&workspace, args.project.clone(), args.git_ref.clone()).await?;
    let mut plan = engine.plan(&document, identity, overrides)?;

    if !args.jobs.is_empty() || args.stage.is_some() {
        plan.retain_jobs(|job| {
            (args.jobs.is_empty() || args.jobs.contains(&job.name))
                && args.stage.as_ref().map_or(true, |s| s == &job.stage)
        });
        if plan.job_count() == 0 {
            color_eyre::eyre::bail!("No jobs match the --job/--stage filters");
        }
    }

    output::info(&format!(
        "Project '{}' at '{}': {} stages, {} jobs on {}",
        plan.identity.project,
        plan.identity.git_ref,
        plan.stages.len(),
        plan.job_count(),
        engine.provider_name()
    ));

    let control = engine.register(&plan);

    let interrupt = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            output::warning("Interrupted, cancelling running jobs");
            interrupt.cancel();
        }
    });

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { engine.execute(&plan, control).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        if !args.json {
            print_event(&event);
        }
    }

    let run = exec_handle.await?;
    let summary = PipelineSummary::from_run(&run);

    if args.json {
        println!("{}", summary.to_json()?);
    } else {
        print_summary(&summary);
    }

    Ok(summary.exit_code())
}

fn print_event(event: &ExecutionEvent) {
    match event {
        ExecutionEvent::PipelineStarted {
            pipeline_id,
            git_ref,
            total_stages,
            total_jobs,
        } => {
            println!();
            output::header(&format!(
                "Pipeline {} on '{}' ({} stages, {} jobs)",
                pipeline_id, git_ref, total_stages, total_jobs
            ));
        }

        ExecutionEvent::PipelineCompleted {
            status, duration, ..
        } => {
            println!();
            let message = format!("Pipeline {} in {:.2}s", status, duration.as_secs_f64());
            match status {
                PipelineStatus::Succeeded | PipelineStatus::SucceededWithAllowedFailures => {
                    output::success(&message)
                }
                PipelineStatus::Failed | PipelineStatus::Canceled => output::failure(&message),
            }
        }

        ExecutionEvent::StageStarted {
            stage_name,
            total_jobs,
        } => {
            output::stage_header(stage_name, *total_jobs);
        }

        ExecutionEvent::StageCompleted {
            stage_name,
            status,
            duration,
        } => {
            let symbol = match status {
                StageStatus::Succeeded => "OK",
                StageStatus::SucceededWithAllowedFailures => "OK (allowed failures)",
                StageStatus::Failed => "FAIL",
                StageStatus::Canceled => "CANCELED",
                _ => "DONE",
            };
            let color_fn = if status.permits_next() {
                output::dim_success
            } else {
                output::dim_failure
            };
            color_fn(&format!(
                "  Stage '{}' {} ({:.2}s)",
                stage_name,
                symbol,
                duration.as_secs_f64()
            ));
        }

        ExecutionEvent::StageSkipped {
            stage_name, reason, ..
        } => {
            output::warning(&format!("  Stage '{}' skipped: {}", stage_name, reason));
        }

        ExecutionEvent::AttemptStarted {
            job_name,
            attempt,
            max_attempts,
            environment,
            ..
        } => {
            println!(
                "    Job '{}' attempt {}/{} on {}",
                job_name, attempt, max_attempts, environment
            );
        }

        ExecutionEvent::LineStarted { job_name, line, .. } => {
            output::script_line(job_name, line);
        }

        ExecutionEvent::LineOutput {
            job_name,
            output: text,
            ..
        } => {
            for line in text.lines() {
                output::job_output(job_name, line);
            }
        }

        ExecutionEvent::AttemptCompleted {
            job_name,
            attempt,
            outcome,
            exit_code,
            ..
        } => {
            if let Some(cause) = outcome.cause() {
                output::dim_failure(&format!(
                    "    Job '{}' attempt {} failed: {} (exit code: {:?})",
                    job_name, attempt, cause, exit_code
                ));
            }
        }

        ExecutionEvent::JobRetrying {
            job_name,
            next_attempt,
            cause,
        } => {
            output::warning(&format!(
                "    Retrying '{}' after {} (attempt {})",
                job_name, cause, next_attempt
            ));
        }

        ExecutionEvent::JobCompleted {
            job_name,
            status,
            attempts,
            duration,
            ..
        } => {
            let symbol = job_symbol(*status);
            let message = format!(
                "    Job '{}' {} ({:.2}s, {} attempt(s))",
                job_name,
                symbol,
                duration.as_secs_f64(),
                attempts
            );
            match status {
                JobStatus::Succeeded | JobStatus::AllowedFailure => output::dim_success(&message),
                _ => output::dim_failure(&message),
            }
        }

        ExecutionEvent::CacheFallback { job_name, key } => {
            output::warning(&format!(
                "    Cache for '{}' ({}) was unreadable, starting empty",
                job_name, key
            ));
        }
    }
}

fn job_symbol(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Succeeded => "OK",
        JobStatus::AllowedFailure => "FAIL (allowed)",
        JobStatus::Failed => "FAIL",
        JobStatus::Canceled => "CANCELED",
        JobStatus::Skipped => "SKIPPED",
    }
}

fn print_summary(summary: &PipelineSummary) {
    println!();
    output::header("Summary");
    output::table_row(&[
        ("JOB", 24),
        ("STAGE", 12),
        ("STATUS", 16),
        ("RETRIES", 8),
        ("TIME", 10),
        ("CAUSE", 0),
    ]);
    for job in &summary.jobs {
        let retries = job.retries.to_string();
        let time = format!("{:.2}s", job.duration_secs);
        let cause = job
            .final_cause
            .map(|c| c.to_string())
            .unwrap_or_default();
        output::table_row(&[
            (&job.name, 24),
            (&job.stage, 12),
            (job_symbol(job.status), 16),
            (&retries, 8),
            (&time, 10),
            (&cause, 0),
        ]);
    }
    println!();
    output::status("Result", &format!("{} ({:.2}s)", summary.status, summary.duration_secs));
}
