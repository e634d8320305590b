//! Best-model selection driven by validation loss.

use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::capability::Stateful;
use crate::error::TrainError;
use crate::persistence::atomic_write_json;
use crate::state::RunState;

/// Which models survive validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Keep one model, the lowest validation loss so far.
    SingleBest,
    /// Keep up to `remember` models in stable, numbered slots.
    Ensemble { remember: usize },
}

/// What a validation loss did to the retained set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Selection {
    /// New single best model.
    Improved { previous: f64 },
    /// Ensemble not yet full; the model took a fresh slot.
    Filled { slot: usize },
    /// Replaced the worst ensemble member.
    Replaced { slot: usize, previous: f64 },
    /// Model not retained.
    Rejected,
}

/// Persists the best model(s) next to, but outside of, the checkpoint rotation.
pub struct BestModelSelector {
    policy: SelectionPolicy,
    dir: PathBuf,
}

impl BestModelSelector {
    pub fn new(policy: SelectionPolicy, dir: impl Into<PathBuf>) -> Self {
        Self {
            policy,
            dir: dir.into(),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.policy
    }

    /// Artifact path of the single best model.
    pub fn best_model_path(&self) -> PathBuf {
        self.dir.join("best_model.json")
    }

    /// Artifact path of ensemble slot `slot`.
    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("best_model-{slot}.json"))
    }

    /// Update `state` with `loss` and persist `model` if it is retained.
    pub fn select(
        &self,
        state: &mut RunState,
        loss: f64,
        model: &dyn Stateful,
    ) -> Result<Selection, TrainError> {
        if !loss.is_finite() {
            tracing::warn!(epoch = state.epoch, loss, "Ignoring non-finite validation loss");
            return Ok(Selection::Rejected);
        }

        let selection = match self.policy {
            SelectionPolicy::SingleBest => {
                if loss < state.best_loss {
                    let previous = state.best_loss;
                    save_model(&self.best_model_path(), model)?;
                    state.best_loss = loss;
                    Selection::Improved { previous }
                } else {
                    Selection::Rejected
                }
            }
            SelectionPolicy::Ensemble { remember } => {
                if state.best_losses.len() < remember {
                    state.best_losses.push(loss);
                    let slot = state.best_losses.len() - 1;
                    save_model(&self.slot_path(slot), model)?;
                    Selection::Filled { slot }
                } else {
                    match worst_slot(&state.best_losses) {
                        Some(slot) if loss < state.best_losses[slot] => {
                            let previous = state.best_losses[slot];
                            save_model(&self.slot_path(slot), model)?;
                            state.best_losses[slot] = loss;
                            Selection::Replaced { slot, previous }
                        }
                        _ => Selection::Rejected,
                    }
                }
            }
        };

        if selection != Selection::Rejected {
            tracing::info!(epoch = state.epoch, loss, ?selection, "Retained model");
        }
        Ok(selection)
    }
}

/// Slot holding the highest loss; the first one on ties.
fn worst_slot(losses: &[f64]) -> Option<usize> {
    let mut worst: Option<usize> = None;
    for (slot, loss) in losses.iter().enumerate() {
        match worst {
            Some(w) if *loss <= losses[w] => {}
            _ => worst = Some(slot),
        }
    }
    worst
}

fn save_model(path: &Path, model: &dyn Stateful) -> Result<(), TrainError> {
    let state: Value = model.state_dict()?;
    atomic_write_json(path, &state)?;
    Ok(())
}
