use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rollout::config::{CliOverrides, Config, PublishMode};
use rollout::ledger::PhaseState;
use rollout::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "rollout")]
#[command(version, about = "Workflow phase ledger and automated change deployment")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Log output format on stderr
    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Drive and inspect the workflow phase ledger
    Phase {
        #[command(subcommand)]
        command: PhaseCommands,
    },
    /// Implement, test and publish a batch of recommendations
    Deploy {
        /// Batch file (JSON or YAML): a list of items or {"recommendations": [...]}
        batch: PathBuf,

        /// Write generated code to temporary files only; no tests, no publication
        #[arg(long)]
        dry_run: bool,

        /// Where to write the JSON deployment report
        #[arg(long)]
        report: Option<PathBuf>,

        /// Consecutive failures before the batch halts
        #[arg(long)]
        max_failures: Option<u32>,

        /// Keep going when generated tests fail
        #[arg(long)]
        no_block_on_test_failure: bool,

        /// Publication mode: none, push, pull-request
        #[arg(long)]
        publish: Option<PublishMode>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum PhaseCommands {
    /// Mark a phase in progress
    Start {
        id: String,
        /// Metadata as key=value (repeatable)
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Mark a phase complete
    Complete {
        id: String,
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Mark a phase failed
    Fail {
        id: String,
        #[arg(long)]
        error: String,
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Record that a phase does not apply to this run
    Skip {
        id: String,
        #[arg(long)]
        reason: String,
        #[arg(long = "meta")]
        meta: Vec<String>,
    },
    /// Invalidate a completed phase and every completed phase downstream of it
    Rerun {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Return one phase, or all of them, to PENDING
    Reset {
        id: Option<String>,
        #[arg(long)]
        all: bool,
    },
    /// Show phase states
    Status {
        id: Option<String>,
        /// Only phases in this state
        #[arg(long)]
        state: Option<PhaseState>,
        #[arg(long)]
        json: bool,
    },
    /// Render the markdown status document
    Report {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default rollout.toml file
    Init,
}

fn overrides(cli: &Cli) -> CliOverrides {
    let mut overrides = CliOverrides {
        log_format: cli.log_format,
        verbose: cli.verbose,
        ..Default::default()
    };
    if let Commands::Deploy {
        dry_run,
        max_failures,
        no_block_on_test_failure,
        publish,
        ..
    } = &cli.command
    {
        overrides.dry_run = dry_run.then_some(true);
        overrides.max_failures = *max_failures;
        overrides.block_on_test_failure = no_block_on_test_failure.then_some(false);
        overrides.publish = *publish;
    }
    overrides
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let config = Config::load(&project_dir, overrides(&cli))?;
    let logging = config.logging();
    if let Some(dir) = &logging.file_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    }
    let _guard = logging::init(&logging);

    match &cli.command {
        Commands::Phase { command } => cmd::cmd_phase(&config, command.clone())?,
        Commands::Deploy { batch, report, .. } => {
            cmd::cmd_deploy(&config, batch, report.as_deref()).await?
        }
        Commands::Config { command } => cmd::cmd_config(&config, command.clone())?,
    }

    Ok(())
}
