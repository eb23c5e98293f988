use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use repowatch::config::RepowatchConfig;
use repowatch::jobs::dispatcher::ForkMode;
use repowatch::telemetry::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "repowatch")]
#[command(version, about = "Background processing of repository metadata")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the config directory, a default repowatch.toml and the database
    Init,
    /// Run the admin HTTP API together with the worker pool
    Serve {
        /// Port to serve on (overrides server.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable dev mode (permissive CORS, bind all interfaces)
        #[arg(long)]
        dev: bool,

        /// Serve the API only; run workers elsewhere
        #[arg(long)]
        no_workers: bool,
    },
    /// Print processing status records
    Status {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        repo: Option<String>,
        /// Restrict to one operation (analyze, screenshot, short-description, readme, sync)
        #[arg(long)]
        operation: Option<String>,
    },
    /// Inspect and control queued jobs
    Jobs {
        #[command(subcommand)]
        command: JobsCommands,
    },
    /// Enqueue an operation for one repository, or for all of an owner's repositories
    Dispatch {
        operation: String,

        #[arg(long)]
        owner: String,

        /// Dispatch a single repository instead of the owner's full list
        #[arg(long)]
        repo: Option<String>,

        /// Include repositories on the hidden list
        #[arg(long)]
        include_hidden: bool,

        /// Fork handling for batch runs: include, exclude, only
        #[arg(long, default_value = "include")]
        forks: ForkMode,

        /// REPOWATCH_TOKEN_* environment variable holding the GitHub token for these jobs
        #[arg(long)]
        credential_ref: Option<String>,

        /// Recompute analysis even when the cached bundle is unchanged
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum JobsCommands {
    /// List job counts and the oldest jobs per state
    List {
        #[arg(long)]
        queue: Option<String>,
        /// Comma-separated states (waiting, active, delayed, paused, completed, failed)
        #[arg(long)]
        state: Option<String>,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Pause a waiting or delayed job
    Pause {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        id: String,
    },
    /// Resume a paused job
    Resume {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        id: String,
    },
    /// Re-queue a failed job with a fresh attempt budget
    Retry {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        id: String,
    },
    /// Remove a job that is not currently running
    Remove {
        #[arg(long)]
        queue: String,
        #[arg(long)]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    if let Commands::Init = cli.command {
        let _guard = telemetry::init(cli.verbose, log_format(&cli), None);
        return cmd::cmd_init(&project_dir);
    }

    let config = RepowatchConfig::load(&project_dir)?;
    let log_dir = matches!(cli.command, Commands::Serve { .. }).then(|| config.log_dir());
    let _guard = telemetry::init(cli.verbose, log_format(&cli), log_dir.as_deref());

    match cli.command {
        Commands::Init => {}
        Commands::Serve {
            port,
            dev,
            no_workers,
        } => cmd::cmd_serve(config, port, dev, no_workers).await?,
        Commands::Status {
            owner,
            repo,
            operation,
        } => {
            cmd::cmd_status(
                &config,
                owner.as_deref(),
                repo.as_deref(),
                operation.as_deref(),
            )
            .await?
        }
        Commands::Jobs { command } => cmd::cmd_jobs(&config, command).await?,
        Commands::Dispatch {
            operation,
            owner,
            repo,
            include_hidden,
            forks,
            credential_ref,
            force,
        } => {
            cmd::cmd_dispatch(
                &config,
                cmd::DispatchArgs {
                    operation: &operation,
                    owner: &owner,
                    repo: repo.as_deref(),
                    include_hidden,
                    forks,
                    credential_ref: credential_ref.as_deref(),
                    force,
                },
            )
            .await?
        }
    }

    Ok(())
}

fn log_format(cli: &Cli) -> LogFormat {
    if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    }
}
