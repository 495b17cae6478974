use crate::output;

use std::path::PathBuf;

use clap::Args;
use color_eyre::Result;

use pipeline_engine::{DocumentParser, EngineError, Resolver};

/// Validate a pipeline document
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the pipeline YAML file
    pub pipeline: PathBuf,

    /// Set a variable (can be repeated, format: name=value)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    pub variables: Vec<String>,

    /// Git ref to resolve against (default: read from git)
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Project name (default: current directory name)
    #[arg(long, value_name = "NAME")]
    pub project: Option<String>,
}

pub async fn execute(args: ValidateArgs) -> Result<i32> {
    let pipeline_path = &args.pipeline;

    if !pipeline_path.exists() {
        color_eyre::eyre::bail!("Pipeline file not found: {}", pipeline_path.display());
    }

    // Step 1: Parse YAML and merge fragments
    output::status("Validating", &format!("{}", pipeline_path.display()));

    let document = match DocumentParser::parse_file(pipeline_path) {
        Ok(document) => document,
        Err(e) => {
            output::error(&format!("Parse error: {}", e.message));
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            return Ok(1);
        }
    };

    output::check(&format!(
        "Document valid: {} stages, {} jobs",
        document.stages.len(),
        document.jobs.len()
    ));

    // Step 2: Resolve variables and stage order
    let overrides = super::parse_variables(&args.variables)?;
    let workspace = std::env::current_dir()?;
    let identity = super::identity(&workspace, args.project, args.git_ref).await?;

    let plan = match Resolver::new(identity).with_overrides(overrides).resolve(&document) {
        Ok(plan) => plan,
        Err(e) => {
            output::error(&EngineError::from(e).to_string());
            return Ok(1);
        }
    };

    output::check("Variables resolved");

    for stage in &plan.stages {
        output::stage_header(&stage.name, stage.jobs.len());
        for job in &stage.jobs {
            let mut notes = Vec::new();
            if let Some(image) = &job.image {
                notes.push(format!("image {}", image));
            }
            if job.retry.max > 0 {
                notes.push(format!("retry {}", job.retry.max));
            }
            if job.interruptible {
                notes.push("interruptible".to_string());
            }
            if job.allow_failure.is_enabled() {
                notes.push("allow_failure".to_string());
            }
            println!(
                "    {} ({} lines){}",
                job.name,
                job.line_count(),
                if notes.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", notes.join(", "))
                }
            );
        }
    }

    println!();
    output::success("Pipeline is valid");
    Ok(0)
}
