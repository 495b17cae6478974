mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run GitLab-style CI pipelines locally
#[derive(Parser, Debug)]
#[command(name = "relay", version, about)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace); RUST_LOG takes precedence
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline document
    Run(commands::run::RunArgs),
    /// Parse and resolve a pipeline document without running it
    Validate(commands::validate::ValidateArgs),
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "pipeline_engine=debug,relay=debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let code = match cli.command {
        Command::Run(args) => commands::run::execute(args).await?,
        Command::Validate(args) => commands::validate::execute(args).await?,
    };

    std::process::exit(code);
}
