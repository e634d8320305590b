//! Epochal CLI: run, resume and inspect training runs.
//!
//! `epochal train` drives a synthetic regression workload through the
//! resumable trainer; `checkpoints` and `inspect` read what a run left on disk.

mod commands;
mod demo;

use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Epochal: resumable training runs with checkpoint rotation and hooks
#[derive(Parser, Debug)]
#[command(name = "epochal", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Train (or resume) the demo regression model
    Train(TrainArgs),
    /// List stored checkpoints of a run
    Checkpoints {
        /// Run directory
        #[arg(short, long, default_value = "training")]
        model_dir: PathBuf,
    },
    /// Print the run state stored in a checkpoint
    Inspect {
        /// Run directory
        #[arg(short, long, default_value = "training")]
        model_dir: PathBuf,
        /// Epoch to read (latest if omitted)
        #[arg(short, long)]
        epoch: Option<u64>,
    },
}

#[derive(clap::Args, Debug, Clone)]
struct TrainArgs {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run directory; overrides the config file
    #[arg(short, long)]
    model_dir: Option<PathBuf>,

    /// Train until this many epochs have completed in total
    #[arg(short, long, default_value = "20")]
    epochs: u64,

    /// Number of generated examples
    #[arg(long, default_value = "512")]
    samples: usize,

    /// Examples per batch
    #[arg(short, long, default_value = "32")]
    batch_size: usize,

    /// Seed for the generated data
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Keep the top models as an ensemble and smooth validation predictions
    #[arg(long)]
    ensemble: bool,

    /// Stop after this many validations without improvement
    #[arg(short, long)]
    patience: Option<usize>,

    /// Learning rate
    #[arg(long, default_value = "0.05")]
    lr: f64,

    /// Momentum coefficient
    #[arg(long, default_value = "0.9")]
    momentum: f64,
}

/// Human-readable stderr logging, plus JSON file logs under `log_dir` when given.
fn init_tracing(verbose: u8, quiet: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let (json_layer, guard) = match log_dir {
        Some(dir) if std::fs::create_dir_all(dir).is_ok() => {
            let file_appender = tracing_appender::rolling::daily(dir, "epochal.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(EnvFilter::new("debug"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Training runs also keep structured logs next to their checkpoints.
    let train_config = match &cli.command {
        Commands::Train(args) => Some(commands::resolve_train_config(args)?),
        _ => None,
    };
    let log_dir = train_config
        .as_ref()
        .map(|config| config.model_dir.join("logs"));
    let _guard = init_tracing(cli.verbose, cli.quiet, log_dir.as_deref());

    commands::handle_command(cli.command, train_config).await
}
