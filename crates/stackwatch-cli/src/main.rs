//! Stackwatch CLI tool.
//!
//! Works directly on the data directory, so it needs no running server:
//! triggers written here are picked up by the server's dispatcher.

use clap::{Parser, Subcommand};
use stackwatch_config::{LogFormat, SystemConfig, resolve_system_config};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;

use output::OutputFormat;

#[derive(Parser)]
#[command(name = "stackwatch")]
#[command(about = "Trigger and inspect stack builds", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "STACKWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a build of a stack
    Trigger {
        /// Stack name
        stack: String,
    },
    /// List pending and running jobs
    Jobs,
    /// List finished runs, newest first
    History {
        /// Only runs of this stack
        #[arg(long)]
        stack: Option<String>,
        /// Maximum number of runs to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Show a pending job (by stack name) or a finished run (by run id)
    Show {
        /// Stack name or run id (`{timestamp}-{stack}`)
        target: String,
    },
    /// Print the log of a run
    Tail {
        /// Run id, or a stack name to follow its current build
        run: String,
        /// Keep printing output until the run finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Archive pending jobs whose process is gone
    Reap,
    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    match cli.command {
        Commands::Validate { path } => {
            commands::validate(path.as_deref().or(cli.config.as_deref()), format)
        }
        command => {
            let config = resolve_system_config(cli.config.as_deref())?;
            init_tracing(&config);
            run(command, &config, format).await
        }
    }
}

async fn run(command: Commands, config: &SystemConfig, format: OutputFormat) -> anyhow::Result<()> {
    debug!(data_dir = %config.data_dir.display(), "Using data directory");
    match command {
        Commands::Trigger { stack } => commands::trigger(config, &stack, format).await,
        Commands::Jobs => commands::jobs::pending(config, format).await,
        Commands::History { stack, limit } => {
            commands::jobs::history(config, stack.as_deref(), limit, format).await
        }
        Commands::Show { target } => commands::show(config, &target, format).await,
        Commands::Tail { run, follow } => commands::tail::tail(config, &run, follow).await,
        Commands::Reap => commands::reap(config, format).await,
        Commands::Validate { path } => commands::validate(path.as_deref(), format),
    }
}

fn init_tracing(config: &SystemConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
