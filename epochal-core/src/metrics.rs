//! Training metrics for one `train` invocation.

use serde::{Deserialize, Serialize};

/// Summary returned by [`crate::trainer::Trainer::train`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetrics {
    pub epochs_completed: u64,
    pub steps_taken: u64,
    /// Mean accumulation-window loss per epoch.
    pub loss_history: Vec<f64>,
    /// `(epoch, loss)` for every validation pass.
    pub val_loss_history: Vec<(u64, f64)>,
    pub best_epoch: Option<u64>,
    pub best_val_loss: Option<f64>,
    /// True when a hook requested the stop before `max_epochs` ran out.
    pub stopped_early: bool,
    pub total_training_time_secs: f64,
}

impl TrainingMetrics {
    pub fn record_epoch(&mut self, train_loss: f64, steps: u64) {
        self.loss_history.push(train_loss);
        self.epochs_completed += 1;
        self.steps_taken += steps;
    }

    pub fn record_validation(&mut self, epoch: u64, loss: f64) {
        self.val_loss_history.push((epoch, loss));
        if loss.is_finite() && self.best_val_loss.is_none_or(|best| loss < best) {
            self.best_val_loss = Some(loss);
            self.best_epoch = Some(epoch);
        }
    }

    pub fn last_val_loss(&self) -> Option<f64> {
        self.val_loss_history.last().map(|(_, loss)| *loss)
    }
}
