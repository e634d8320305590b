//! Configuration for a training run.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file -> environment.
//! Environment variables use the `EPOCHAL_` prefix, e.g. `EPOCHAL_ACCUMULATION_STEPS=4`.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::TrainError;

/// Recognized trainer options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainerConfig {
    /// Directory holding `checkpoints/` and the best-model artifacts.
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,
    /// Number of epoch checkpoints kept on disk.
    #[serde(default = "default_keep_n")]
    pub keep_n_checkpoints: usize,
    /// Epochs between checkpoint writes.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Epochs between validation passes.
    #[serde(default = "default_one")]
    pub validation_interval: u64,
    /// Batches whose gradients are summed before one optimizer step.
    #[serde(default = "default_one_usize")]
    pub accumulation_steps: usize,
    /// Report the per-example mean validation loss instead of the per-batch sum.
    #[serde(default = "default_true")]
    pub loss_is_normalized: bool,
    /// Ensemble size and prediction history depth.
    #[serde(default = "default_remember")]
    pub remember: usize,
    /// Keep the `remember` best models and smooth validation predictions.
    #[serde(default)]
    pub ensemble: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            keep_n_checkpoints: default_keep_n(),
            checkpoint_interval: default_checkpoint_interval(),
            validation_interval: default_one(),
            accumulation_steps: default_one_usize(),
            loss_is_normalized: true,
            remember: default_remember(),
            ensemble: false,
        }
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("training")
}

fn default_keep_n() -> usize {
    3
}

fn default_checkpoint_interval() -> u64 {
    10
}

fn default_one() -> u64 {
    1
}

fn default_one_usize() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_remember() -> usize {
    10
}

impl TrainerConfig {
    /// Configuration rooted at `model_dir` with every other option defaulted.
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
            ..Self::default()
        }
    }

    /// Directory of the rotating epoch checkpoints.
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.model_dir.join("checkpoints")
    }

    /// Reject option combinations the controller cannot run with.
    pub fn validate(&self) -> Result<(), TrainError> {
        if self.keep_n_checkpoints == 0 {
            return Err(TrainError::config("keep_n_checkpoints must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(TrainError::config("checkpoint_interval must be at least 1"));
        }
        if self.validation_interval == 0 {
            return Err(TrainError::config("validation_interval must be at least 1"));
        }
        if self.accumulation_steps == 0 {
            return Err(TrainError::config("accumulation_steps must be at least 1"));
        }
        if self.ensemble && self.remember == 0 {
            return Err(TrainError::config(
                "remember must be at least 1 when ensemble mode is enabled",
            ));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Environment variables (prefixed with `EPOCHAL_`)
/// 2. The TOML file at `file`, when given and present
/// 3. Built-in defaults
pub fn load_config(file: Option<&Path>) -> Result<TrainerConfig, TrainError> {
    let mut figment = Figment::from(Serialized::defaults(TrainerConfig::default()));

    if let Some(path) = file {
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        }
    }

    figment = figment.merge(Env::prefixed("EPOCHAL_"));

    let config: TrainerConfig = figment
        .extract()
        .map_err(|e| TrainError::config(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TrainerConfig::default();
        assert_eq!(config.keep_n_checkpoints, 3);
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.validation_interval, 1);
        assert_eq!(config.accumulation_steps, 1);
        assert!(config.loss_is_normalized);
        assert_eq!(config.remember, 10);
        assert!(!config.ensemble);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_checkpoint_dir() {
        let config = TrainerConfig::new("/runs/qm9");
        assert_eq!(config.checkpoint_dir(), PathBuf::from("/runs/qm9/checkpoints"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = TrainerConfig::default();
        config.accumulation_steps = 0;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));

        let mut config = TrainerConfig::default();
        config.keep_n_checkpoints = 0;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));

        let mut config = TrainerConfig::default();
        config.ensemble = true;
        config.remember = 0;
        assert!(matches!(config.validate(), Err(TrainError::Config(_))));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: TrainerConfig = toml_from("accumulation_steps = 4\nensemble = true\n");
        assert_eq!(config.accumulation_steps, 4);
        assert!(config.ensemble);
        assert_eq!(config.keep_n_checkpoints, 3);
    }

    fn toml_from(content: &str) -> TrainerConfig {
        Figment::from(Serialized::defaults(TrainerConfig::default()))
            .merge(Toml::string(content))
            .extract()
            .unwrap()
    }

    #[test]
    fn test_load_config_layers_file_and_env() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "epochal.toml",
                r#"
                model_dir = "runs/ethanol"
                keep_n_checkpoints = 5
                remember = 4
                "#,
            )?;
            jail.set_env("EPOCHAL_KEEP_N_CHECKPOINTS", "7");
            jail.set_env("EPOCHAL_LOSS_IS_NORMALIZED", "false");

            let config = load_config(Some(Path::new("epochal.toml"))).unwrap();
            assert_eq!(config.model_dir, PathBuf::from("runs/ethanol"));
            assert_eq!(config.keep_n_checkpoints, 7);
            assert_eq!(config.remember, 4);
            assert!(!config.loss_is_normalized);
            Ok(())
        });
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("EPOCHAL_CHECKPOINT_INTERVAL", "0");
            assert!(matches!(load_config(None), Err(TrainError::Config(_))));
            Ok(())
        });
    }
}
