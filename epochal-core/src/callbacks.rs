//! Built-in hooks: early stopping, anomaly detection, epoch/step limits,
//! logging and external interruption.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::TrainError;
use crate::hooks::{Hook, HookContext};

/// Decision a callback reaches after observing a loss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    Continue,
    Stop,
}

/// Early stopping on validation loss.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyStoppingHook {
    pub patience: usize,
    pub min_delta: f64,
    counter: usize,
    best_loss: Option<f64>,
}

impl EarlyStoppingHook {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            counter: 0,
            best_loss: None,
        }
    }

    /// Passes since the last improvement.
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn observe(&mut self, loss: f64) -> CallbackAction {
        match self.best_loss {
            None if loss.is_finite() => {
                self.best_loss = Some(loss);
                CallbackAction::Continue
            }
            Some(best) if loss < best - self.min_delta => {
                self.best_loss = Some(loss);
                self.counter = 0;
                CallbackAction::Continue
            }
            _ => {
                self.counter += 1;
                if self.counter >= self.patience {
                    CallbackAction::Stop
                } else {
                    CallbackAction::Continue
                }
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct EarlyStoppingState {
    counter: usize,
    best_loss: Option<f64>,
}

impl<B, O> Hook<B, O> for EarlyStoppingHook {
    fn name(&self) -> &str {
        "early_stopping"
    }

    fn on_validation_end(&mut self, ctx: &mut HookContext<'_>, loss: f64) -> Result<(), TrainError> {
        if self.observe(loss) == CallbackAction::Stop {
            tracing::info!(
                epoch = ctx.epoch(),
                patience = self.patience,
                best_loss = ?self.best_loss,
                "Early stopping: validation loss stopped improving"
            );
            ctx.request_stop();
        }
        Ok(())
    }

    fn state(&self) -> Result<Value, TrainError> {
        Ok(serde_json::to_value(EarlyStoppingState {
            counter: self.counter,
            best_loss: self.best_loss,
        })?)
    }

    fn load_state(&mut self, state: Value) -> Result<(), TrainError> {
        if state.is_null() {
            return Ok(());
        }
        let state: EarlyStoppingState = serde_json::from_value(state)?;
        self.counter = state.counter;
        self.best_loss = state.best_loss;
        Ok(())
    }
}

/// Stops the run when a step loss is NaN/inf or spikes above the rolling mean.
#[derive(Debug, Clone)]
pub struct AnomalyHook {
    pub threshold: f64,
    window: VecDeque<f64>,
    window_size: usize,
}

impl AnomalyHook {
    pub fn new(threshold: f64, window_size: usize) -> Self {
        Self {
            threshold,
            window: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    pub fn observe(&mut self, loss: f64) -> CallbackAction {
        if !loss.is_finite() {
            return CallbackAction::Stop;
        }

        // Compare against the losses seen before this one.
        if self.window.len() >= 3 {
            let mean = self.window.iter().sum::<f64>() / self.window.len() as f64;
            if mean > 0.0 && loss > mean * self.threshold {
                return CallbackAction::Stop;
            }
        }

        self.window.push_back(loss);
        if self.window.len() > self.window_size {
            self.window.pop_front();
        }
        CallbackAction::Continue
    }
}

impl<B, O> Hook<B, O> for AnomalyHook {
    fn name(&self) -> &str {
        "anomaly"
    }

    fn on_batch_end(
        &mut self,
        ctx: &mut HookContext<'_>,
        _batch: &B,
        _output: &O,
        loss: f64,
    ) -> Result<(), TrainError> {
        if self.observe(loss) == CallbackAction::Stop {
            tracing::warn!(
                epoch = ctx.epoch(),
                step = ctx.step(),
                loss,
                "Loss anomaly detected, stopping"
            );
            ctx.request_stop();
        }
        Ok(())
    }
}

/// Stops before starting epoch `max_epochs + 1`.
#[derive(Debug, Clone)]
pub struct MaxEpochHook {
    pub max_epochs: u64,
}

impl MaxEpochHook {
    pub fn new(max_epochs: u64) -> Self {
        Self { max_epochs }
    }
}

impl<B, O> Hook<B, O> for MaxEpochHook {
    fn name(&self) -> &str {
        "max_epoch"
    }

    fn on_epoch_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        if ctx.epoch() > self.max_epochs {
            ctx.request_stop();
        }
        Ok(())
    }
}

/// Stops after the optimizer step that reaches `max_steps`.
#[derive(Debug, Clone)]
pub struct MaxStepHook {
    pub max_steps: u64,
}

impl MaxStepHook {
    pub fn new(max_steps: u64) -> Self {
        Self { max_steps }
    }
}

impl<B, O> Hook<B, O> for MaxStepHook {
    fn name(&self) -> &str {
        "max_step"
    }

    fn on_batch_end(
        &mut self,
        ctx: &mut HookContext<'_>,
        _batch: &B,
        _output: &O,
        _loss: f64,
    ) -> Result<(), TrainError> {
        if ctx.step() >= self.max_steps {
            ctx.request_stop();
        }
        Ok(())
    }
}

/// One structured log line per epoch.
#[derive(Debug, Clone, Default)]
pub struct LoggingHook {
    loss_sum: f64,
    windows: u64,
    val_loss: Option<f64>,
}

impl LoggingHook {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<B, O> Hook<B, O> for LoggingHook {
    fn name(&self) -> &str {
        "logging"
    }

    fn on_epoch_begin(&mut self, _ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        *self = Self::default();
        Ok(())
    }

    fn on_batch_end(
        &mut self,
        _ctx: &mut HookContext<'_>,
        _batch: &B,
        _output: &O,
        loss: f64,
    ) -> Result<(), TrainError> {
        self.loss_sum += loss;
        self.windows += 1;
        Ok(())
    }

    fn on_validation_end(&mut self, _ctx: &mut HookContext<'_>, loss: f64) -> Result<(), TrainError> {
        self.val_loss = Some(loss);
        Ok(())
    }

    fn on_epoch_end(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        let train_loss = if self.windows == 0 {
            None
        } else {
            Some(self.loss_sum / self.windows as f64)
        };
        tracing::info!(
            target: "epochal::progress",
            epoch = ctx.epoch(),
            step = ctx.step(),
            train_loss = ?train_loss,
            val_loss = ?self.val_loss,
            best_loss = ctx.best_loss(),
            ensemble = ?ctx.best_losses(),
            "epoch summary"
        );
        Ok(())
    }

    fn on_train_failed(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        tracing::error!(
            target: "epochal::progress",
            epoch = ctx.epoch(),
            step = ctx.step(),
            "run failed"
        );
        Ok(())
    }
}

/// Turns an externally set flag (e.g. a Ctrl-C handler) into a graceful stop.
#[derive(Debug, Clone)]
pub struct InterruptHook {
    flag: Arc<AtomicBool>,
}

impl InterruptHook {
    pub fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    fn poll(&self, ctx: &mut HookContext<'_>) {
        if self.flag.load(Ordering::SeqCst) && !ctx.stop_requested() {
            tracing::info!(epoch = ctx.epoch(), step = ctx.step(), "Interrupt received, stopping");
            ctx.request_stop();
        }
    }
}

impl<B, O> Hook<B, O> for InterruptHook {
    fn name(&self) -> &str {
        "interrupt"
    }

    fn on_epoch_begin(&mut self, ctx: &mut HookContext<'_>) -> Result<(), TrainError> {
        self.poll(ctx);
        Ok(())
    }

    fn on_batch_end(
        &mut self,
        ctx: &mut HookContext<'_>,
        _batch: &B,
        _output: &O,
        _loss: f64,
    ) -> Result<(), TrainError> {
        self.poll(ctx);
        Ok(())
    }
}
