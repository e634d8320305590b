//! CLI subcommand handlers.

use anyhow::Context;

use crate::Commands;
use crate::TrainArgs;
use crate::demo::{self, FEATURES, LinearRegression, MomentumSgd, Params};
use epochal_core::capability::Device;
use epochal_core::callbacks::{AnomalyHook, EarlyStoppingHook, InterruptHook, LoggingHook};
use epochal_core::checkpoint::CheckpointStore;
use epochal_core::config::{TrainerConfig, load_config};
use epochal_core::error::TrainError;
use epochal_core::metrics::TrainingMetrics;
use epochal_core::state::RunState;
use epochal_core::trainer::{BoxedHook, Components, Trainer};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Step losses this many times above the recent mean abort the run.
const ANOMALY_THRESHOLD: f64 = 10.0;
const ANOMALY_WINDOW: usize = 20;
const EARLY_STOPPING_MIN_DELTA: f64 = 1e-6;

/// Handle a CLI subcommand.
///
/// `train_config` is the already resolved configuration of a `train` command;
/// it is resolved here when absent.
pub async fn handle_command(
    command: Commands,
    train_config: Option<TrainerConfig>,
) -> anyhow::Result<()> {
    match command {
        Commands::Train(args) => {
            let config = match train_config {
                Some(config) => config,
                None => resolve_train_config(&args)?,
            };
            handle_train(args, config).await
        }
        Commands::Checkpoints { model_dir } => handle_checkpoints(&model_dir),
        Commands::Inspect { model_dir, epoch } => handle_inspect(&model_dir, epoch),
    }
}

/// Layered configuration with the command-line overrides applied.
pub fn resolve_train_config(args: &TrainArgs) -> anyhow::Result<TrainerConfig> {
    if let Some(path) = &args.config {
        if !path.exists() {
            anyhow::bail!("Config file not found: {}", path.display());
        }
    }
    let mut config = load_config(args.config.as_deref())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    if let Some(dir) = &args.model_dir {
        config.model_dir = dir.clone();
    }
    if args.ensemble {
        config.ensemble = true;
    }
    config.validate()?;
    Ok(config)
}

/// Knobs of the demo workload that are not part of the trainer config.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub epochs: u64,
    pub samples: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub patience: Option<usize>,
    pub lr: f64,
    pub momentum: f64,
}

impl From<&TrainArgs> for RunSettings {
    fn from(args: &TrainArgs) -> Self {
        Self {
            epochs: args.epochs,
            samples: args.samples,
            batch_size: args.batch_size,
            seed: args.seed,
            patience: args.patience,
            lr: args.lr,
            momentum: args.momentum,
        }
    }
}

/// What a finished `train` invocation prints.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub epoch: u64,
    pub step: u64,
    pub best_loss: Option<f64>,
    pub best_losses: Vec<f64>,
    pub metrics: TrainingMetrics,
    pub learned: Params,
    pub truth: Params,
}

async fn handle_train(args: TrainArgs, config: TrainerConfig) -> anyhow::Result<()> {
    let settings = RunSettings::from(&args);

    let interrupted = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&interrupted);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing the current step and checkpointing");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    // The trainer is synchronous; keep it off the async workers.
    let report =
        tokio::task::spawn_blocking(move || run_training(config, &settings, interrupted)).await??;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Build the demo trainer (resuming when `config.model_dir` holds a run) and
/// train until the epoch target, a stop hook or `interrupt` ends it.
pub fn run_training(
    config: TrainerConfig,
    settings: &RunSettings,
    interrupt: Arc<AtomicBool>,
) -> Result<RunReport, TrainError> {
    let data = demo::synthetic(settings.samples, settings.batch_size, settings.seed)?;

    let components = Components {
        model: LinearRegression::new(FEATURES),
        optimizer: MomentumSgd::new(FEATURES, settings.lr, settings.momentum),
        loss_fn: Box::new(demo::mse),
        train_data: Box::new(data.train),
        validation_data: Box::new(data.validation),
    };

    // Hook states are restored by position; optional hooks go last.
    let mut hooks: Vec<BoxedHook<LinearRegression>> = vec![
        Box::new(InterruptHook::new(interrupt)),
        Box::new(AnomalyHook::new(ANOMALY_THRESHOLD, ANOMALY_WINDOW)),
        Box::new(LoggingHook::new()),
    ];
    if let Some(patience) = settings.patience {
        hooks.push(Box::new(EarlyStoppingHook::new(patience, EARLY_STOPPING_MIN_DELTA)));
    }

    let mut trainer = Trainer::new(config, components, hooks)?;
    let remaining = settings.epochs.saturating_sub(trainer.state().epoch);
    let metrics = trainer.train(&Device::Cpu, Some(remaining))?;

    let state = trainer.state();
    Ok(RunReport {
        epoch: state.epoch,
        step: state.step,
        best_loss: state.best_loss.is_finite().then_some(state.best_loss),
        best_losses: state.best_losses.clone(),
        metrics,
        learned: trainer.model().params().clone(),
        truth: data.truth,
    })
}

fn handle_checkpoints(model_dir: &Path) -> anyhow::Result<()> {
    let config = TrainerConfig::new(model_dir);
    let store = CheckpointStore::new(config.checkpoint_dir(), config.keep_n_checkpoints);
    let epochs = store
        .list()
        .with_context(|| format!("Failed to list {}", store.dir().display()))?;

    if epochs.is_empty() {
        println!("No checkpoints found in: {}", store.dir().display());
        return Ok(());
    }

    println!("Checkpoints in {}:", store.dir().display());
    for epoch in &epochs {
        match store.info(*epoch) {
            Ok(info) => println!(
                "  epoch {:>5}  {}  {:>8} bytes  sha256 {}",
                info.epoch,
                info.created_at.format("%Y-%m-%d %H:%M:%S"),
                info.size_bytes,
                &info.sha256[..info.sha256.len().min(12)]
            ),
            Err(e) => println!("  epoch {:>5}  (error: {})", epoch, e),
        }
    }
    println!("\nTotal: {} checkpoints", epochs.len());
    Ok(())
}

fn handle_inspect(model_dir: &Path, epoch: Option<u64>) -> anyhow::Result<()> {
    let config = TrainerConfig::new(model_dir);
    let store = CheckpointStore::new(config.checkpoint_dir(), config.keep_n_checkpoints);
    let state = store
        .restore(epoch)
        .with_context(|| format!("Failed to restore a checkpoint from {}", store.dir().display()))?;
    println!("{}", serde_json::to_string_pretty(&summarize(&state))?);
    Ok(())
}

/// JSON view of a run state; an unvalidated `best_loss` shows as `null`.
fn summarize(state: &RunState) -> Value {
    json!({
        "epoch": state.epoch,
        "step": state.step,
        "best_loss": state.best_loss,
        "best_losses": state.best_losses,
        "model_state": state.model_state,
        "optimizer_state": state.optimizer_state,
        "hook_states": state.hook_states,
        "remembered_passes": state.prediction_history.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn settings(epochs: u64) -> RunSettings {
        RunSettings {
            epochs,
            samples: 80,
            batch_size: 16,
            seed: 3,
            patience: None,
            lr: 0.1,
            momentum: 0.5,
        }
    }

    fn no_interrupt() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(false))
    }

    #[test]
    fn test_run_training_learns_and_checkpoints() {
        let dir = TempDir::new().unwrap();
        let report = run_training(TrainerConfig::new(dir.path()), &settings(5), no_interrupt()).unwrap();

        assert_eq!(report.epoch, 5);
        assert_eq!(report.metrics.epochs_completed, 5);
        assert!(!report.metrics.stopped_early);
        // 64 training examples in batches of 16.
        assert_eq!(report.step, 20);

        let first = report.metrics.val_loss_history[0].1;
        let last = report.metrics.last_val_loss().unwrap();
        assert!(last < first, "validation loss should drop: {first} -> {last}");
        assert!(report.best_loss.is_some());

        let store = CheckpointStore::new(dir.path().join("checkpoints"), 3);
        assert!(store.list().unwrap().contains(&5));
        assert!(dir.path().join("best_model.json").exists());
    }

    #[test]
    fn test_rerun_resumes_to_epoch_target() {
        let dir = TempDir::new().unwrap();
        run_training(TrainerConfig::new(dir.path()), &settings(2), no_interrupt()).unwrap();

        let report = run_training(TrainerConfig::new(dir.path()), &settings(4), no_interrupt()).unwrap();
        assert_eq!(report.epoch, 4);
        assert_eq!(report.metrics.epochs_completed, 2);
        assert!(!report.metrics.stopped_early);
    }

    #[test]
    fn test_rerun_past_target_trains_nothing() {
        let dir = TempDir::new().unwrap();
        run_training(TrainerConfig::new(dir.path()), &settings(3), no_interrupt()).unwrap();

        let report = run_training(TrainerConfig::new(dir.path()), &settings(2), no_interrupt()).unwrap();
        assert_eq!(report.epoch, 3);
        assert_eq!(report.metrics.epochs_completed, 0);
        assert!(!report.metrics.stopped_early);
    }

    #[test]
    fn test_interrupt_before_first_epoch() {
        let dir = TempDir::new().unwrap();
        let report = run_training(
            TrainerConfig::new(dir.path()),
            &settings(5),
            Arc::new(AtomicBool::new(true)),
        )
        .unwrap();

        assert_eq!(report.epoch, 0);
        assert_eq!(report.metrics.epochs_completed, 0);
        assert!(report.metrics.stopped_early);
    }

    #[test]
    fn test_bad_batch_size_is_a_data_error() {
        let dir = TempDir::new().unwrap();
        let mut bad = settings(1);
        bad.batch_size = 0;
        let err = run_training(TrainerConfig::new(dir.path()), &bad, no_interrupt()).unwrap_err();
        assert!(matches!(err, TrainError::Data(_)));
    }

    fn train_args(argv: &[&str]) -> TrainArgs {
        use clap::Parser;
        let cli = crate::Cli::try_parse_from(argv).unwrap();
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        args
    }

    #[test]
    fn test_resolve_train_config_applies_flags() {
        let args = train_args(&["epochal", "train", "--model-dir", "runs/flagged", "--ensemble"]);
        let config = resolve_train_config(&args).unwrap();
        assert_eq!(config.model_dir, std::path::PathBuf::from("runs/flagged"));
        assert!(config.ensemble);
    }

    #[test]
    fn test_resolve_train_config_missing_file() {
        let args = train_args(&["epochal", "train", "--config", "/nonexistent/epochal.toml"]);
        let err = resolve_train_config(&args).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn test_summarize_fresh_state() {
        let summary = summarize(&RunState::default());
        assert_eq!(summary["epoch"], json!(0));
        assert_eq!(summary["best_loss"], Value::Null);
        assert_eq!(summary["remembered_passes"], json!(0));
    }
}
