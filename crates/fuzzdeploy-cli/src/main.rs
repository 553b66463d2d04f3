//! fuzzdeploy CLI
//!
//! Command-line interface for running fuzzing campaigns on a core pool.

mod commands;
mod shutdown;

use clap::{Parser, Subcommand};
use fuzzdeploy_core::CampaignConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// fuzzdeploy - CPU-core aware scheduler for large fuzzing campaigns
#[derive(Parser, Debug)]
#[command(name = "fuzzdeploy")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a campaign described by a configuration file
    Run {
        /// Campaign configuration (TOML)
        config: PathBuf,

        #[command(flatten)]
        overrides: commands::Overrides,
    },

    /// Run a fuzzing campaign over fuzzers, targets and repeats
    Fuzz {
        #[command(flatten)]
        args: commands::FuzzArgs,

        #[command(flatten)]
        overrides: commands::Overrides,
    },

    /// Show the jobs of a campaign and whether they would be skipped
    Plan {
        /// Campaign configuration (TOML)
        config: PathBuf,
    },

    /// Show core information
    Cores,
}

/// Pick the log level: verbose flag, then explicit level, then the fallback
fn log_level<'a>(verbose: bool, explicit: Option<&'a str>, fallback: &'a str) -> &'a str {
    if verbose {
        "debug"
    } else {
        explicit.unwrap_or(fallback)
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn execute(cli: Cli) -> anyhow::Result<ExitCode> {
    let Cli {
        verbose,
        log_level: explicit,
        command,
    } = cli;

    match command {
        Commands::Run { config, overrides } => {
            let mut config = CampaignConfig::from_file(&config)?;
            overrides.apply(&mut config);
            init_logging(log_level(verbose, explicit.as_deref(), &config.logging.level));

            let cancel = shutdown::install_shutdown_handler();
            commands::run_campaign(config, cancel).await
        }
        Commands::Fuzz { args, overrides } => {
            init_logging(log_level(verbose, explicit.as_deref(), "info"));

            let cancel = shutdown::install_shutdown_handler();
            commands::fuzz(args, &overrides, cancel).await
        }
        Commands::Plan { config } => {
            init_logging(log_level(verbose, explicit.as_deref(), "warn"));

            let config = CampaignConfig::from_file(&config)?;
            commands::plan(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cores => {
            commands::cores();
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
