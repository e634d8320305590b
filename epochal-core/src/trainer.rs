//! Training loop controller.
//!
//! Owns the epoch/batch iteration, gradient-accumulation bookkeeping, the
//! checkpoint and validation cadence, and the stop/failure protocol. Resume is
//! decided once, at construction: an existing checkpoint directory means the
//! run continues from its latest checkpoint, otherwise a fresh run is started
//! and immediately checkpointed at epoch 0.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::capability::{Batch, DataSource, Device, LossFn, Model, Optimizer, Stateful};
use crate::checkpoint::{CheckpointId, CheckpointStore};
use crate::config::TrainerConfig;
use crate::ensemble::EnsembleSmoother;
use crate::error::TrainError;
use crate::hooks::{Hook, HookRegistry};
use crate::metrics::TrainingMetrics;
use crate::selector::{BestModelSelector, SelectionPolicy};
use crate::state::RunState;
use crate::validation::Evaluator;

/// Lifecycle of a trainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerStatus {
    Idle,
    Running,
    /// A stop was requested; the loop is unwinding through validation and the
    /// final checkpoint.
    Stopping,
    Terminated,
    Failed,
}

/// Boxed hook for a model's batch and output types.
pub type BoxedHook<M> = Box<dyn Hook<<M as Model>::Batch, <M as Model>::Output>>;

/// The external collaborators a trainer drives.
pub struct Components<M: Model, O: Optimizer<M>> {
    pub model: M,
    pub optimizer: O,
    pub loss_fn: Box<dyn LossFn<M::Batch, M::Output>>,
    pub train_data: Box<dyn DataSource<M::Batch>>,
    pub validation_data: Box<dyn DataSource<M::Batch>>,
}

/// Resumable training-run orchestrator.
pub struct Trainer<M: Model, O: Optimizer<M>> {
    config: TrainerConfig,
    model: M,
    optimizer: O,
    loss_fn: Box<dyn LossFn<M::Batch, M::Output>>,
    train_data: Box<dyn DataSource<M::Batch>>,
    validation_data: Box<dyn DataSource<M::Batch>>,
    hooks: HookRegistry<M::Batch, M::Output>,
    store: CheckpointStore,
    selector: BestModelSelector,
    evaluator: Evaluator,
    state: RunState,
    status: TrainerStatus,
}

impl<M: Model, O: Optimizer<M>> Trainer<M, O> {
    /// Build a trainer, resuming from the latest checkpoint when one exists.
    ///
    /// Hooks must be registered here so their checkpointed state can be
    /// routed back to them on resume.
    pub fn new(
        config: TrainerConfig,
        components: Components<M, O>,
        hooks: Vec<BoxedHook<M>>,
    ) -> Result<Self, TrainError> {
        config.validate()?;

        let store = CheckpointStore::new(config.checkpoint_dir(), config.keep_n_checkpoints);
        let policy = if config.ensemble {
            SelectionPolicy::Ensemble {
                remember: config.remember,
            }
        } else {
            SelectionPolicy::SingleBest
        };
        let selector = BestModelSelector::new(policy, &config.model_dir);
        let smoother = config
            .ensemble
            .then(|| EnsembleSmoother::new(config.remember));
        let evaluator = Evaluator::new(config.loss_is_normalized, smoother);

        let Components {
            model,
            optimizer,
            loss_fn,
            train_data,
            validation_data,
        } = components;

        let mut trainer = Self {
            config,
            model,
            optimizer,
            loss_fn,
            train_data,
            validation_data,
            hooks: HookRegistry::from_hooks(hooks),
            store,
            selector,
            evaluator,
            state: RunState::default(),
            status: TrainerStatus::Idle,
        };

        if trainer.store.exists() {
            trainer.resume(None)?;
        } else {
            std::fs::create_dir_all(trainer.store.dir())?;
            tracing::info!(
                dir = %trainer.store.dir().display(),
                hooks = trainer.hooks.count(),
                "Starting fresh run"
            );
            trainer.checkpoint()?;
        }

        Ok(trainer)
    }

    /// Replace the live state with a stored checkpoint and hand every blob
    /// back to its owner.
    pub fn resume(&mut self, epoch: Option<u64>) -> Result<(), TrainError> {
        let mut state = self.store.restore(epoch)?;

        self.model
            .state_root_mut()
            .load_state_dict(state.model_state.clone())?;
        self.optimizer
            .load_state_dict(state.optimizer_state.clone())?;
        self.hooks.load_states(&state.hook_states)?;

        if self.config.ensemble {
            if state.best_losses.len() > self.config.remember {
                tracing::warn!(
                    stored = state.best_losses.len(),
                    remember = self.config.remember,
                    "Checkpoint tracks more ensemble slots than configured; dropping the excess"
                );
                state.best_losses.truncate(self.config.remember);
            }
            self.evaluator.set_smoother(Some(EnsembleSmoother::with_history(
                self.config.remember,
                state.prediction_history.clone(),
            )));
        }

        tracing::info!(
            epoch = state.epoch,
            step = state.step,
            best_loss = state.best_loss,
            "Resumed run"
        );
        self.state = state;
        Ok(())
    }

    /// Capture every owner's state into the run state and store it.
    pub fn checkpoint(&mut self) -> Result<CheckpointId, TrainError> {
        self.state.model_state = self.model.state_root().state_dict()?;
        self.state.optimizer_state = self.optimizer.state_dict()?;
        self.state.hook_states = self.hooks.states()?;
        self.state.prediction_history = self
            .evaluator
            .smoother()
            .map(EnsembleSmoother::history)
            .unwrap_or_default();
        self.store.store(&self.state)
    }

    /// Train for up to `max_epochs` further epochs (unbounded when `None`).
    ///
    /// Hooks may end the run earlier by requesting a stop. Any error aborts
    /// the run: every hook is told through `on_train_failed`, the trainer
    /// moves to [`TrainerStatus::Failed`], and the original error is returned.
    pub fn train(
        &mut self,
        device: &Device,
        max_epochs: Option<u64>,
    ) -> Result<TrainingMetrics, TrainError> {
        let started = Instant::now();
        self.status = TrainerStatus::Running;
        self.hooks.clear_stop();

        tracing::info!(
            device = %device,
            epoch = self.state.epoch,
            max_epochs = ?max_epochs,
            "Training started"
        );

        let mut metrics = TrainingMetrics::default();
        let result = self.run(device, max_epochs.unwrap_or(u64::MAX), &mut metrics);
        metrics.total_training_time_secs = started.elapsed().as_secs_f64();

        match result {
            Ok(()) => {
                self.status = TrainerStatus::Terminated;
                tracing::info!(
                    epoch = self.state.epoch,
                    step = self.state.step,
                    stopped_early = metrics.stopped_early,
                    duration_secs = metrics.total_training_time_secs,
                    "Training finished"
                );
                Ok(metrics)
            }
            Err(e) => {
                self.status = TrainerStatus::Failed;
                tracing::error!(
                    epoch = self.state.epoch,
                    step = self.state.step,
                    error = %e,
                    "Training failed"
                );
                self.hooks.notify_failed(&self.state);
                Err(e)
            }
        }
    }

    fn run(
        &mut self,
        device: &Device,
        max_epochs: u64,
        metrics: &mut TrainingMetrics,
    ) -> Result<(), TrainError> {
        self.model.to_device(device)?;
        self.optimizer.to_device(device)?;

        self.hooks
            .dispatch(&self.state, |hook, ctx| hook.on_train_begin(ctx))?;

        for _ in 0..max_epochs {
            self.state.epoch += 1;

            self.hooks
                .dispatch(&self.state, |hook, ctx| hook.on_epoch_begin(ctx))?;
            if self.hooks.stop_requested() {
                // The epoch never ran; it does not count.
                self.state.epoch -= 1;
                self.mark_stopping(metrics);
                break;
            }

            let (train_loss, steps) = self.train_epoch(device)?;
            metrics.record_epoch(train_loss, steps);

            if self.state.epoch % self.config.checkpoint_interval == 0 {
                self.checkpoint()?;
            }

            if self.state.epoch % self.config.validation_interval == 0
                || self.hooks.stop_requested()
            {
                let loss = self.validate(device)?;
                metrics.record_validation(self.state.epoch, loss);
            }

            self.hooks
                .dispatch(&self.state, |hook, ctx| hook.on_epoch_end(ctx))?;

            tracing::info!(
                epoch = self.state.epoch,
                step = self.state.step,
                train_loss,
                val_loss = ?metrics.last_val_loss(),
                "Epoch complete"
            );

            if self.hooks.stop_requested() {
                self.mark_stopping(metrics);
                break;
            }
        }

        self.hooks
            .dispatch(&self.state, |hook, ctx| hook.on_train_end(ctx))?;
        self.checkpoint()?;
        Ok(())
    }

    fn mark_stopping(&mut self, metrics: &mut TrainingMetrics) {
        self.status = TrainerStatus::Stopping;
        metrics.stopped_early = true;
    }

    /// One pass over the training source. Returns the mean window loss and
    /// the number of optimizer steps taken.
    fn train_epoch(&mut self, device: &Device) -> Result<(f64, u64), TrainError> {
        let window_size = self.config.accumulation_steps;
        let scale = 1.0 / window_size as f64;

        self.model.set_training(true);
        self.optimizer.zero_grad(&mut self.model)?;

        let mut window = 0usize;
        let mut window_loss = 0.0;
        let mut epoch_loss = 0.0;
        let mut steps = 0u64;

        let mut batches = self.train_data.batches()?.peekable();
        while let Some(batch) = batches.next() {
            let batch = batch?;
            window += 1;

            self.hooks
                .dispatch(&self.state, |hook, ctx| hook.on_batch_begin(ctx, &batch))?;

            let batch = batch.to_device(device)?;
            let output = self.model.forward(&batch)?;
            let loss = self.loss_fn.loss(&batch, &output)? * scale;
            self.model.backward(&batch, &output, scale)?;
            window_loss += loss;

            // A trailing partial window is still flushed.
            let last = batches.peek().is_none();
            if window == window_size || last {
                self.optimizer.step(&mut self.model)?;
                window = 0;
                self.state.step += 1;
                steps += 1;
                epoch_loss += window_loss;

                self.hooks.dispatch(&self.state, |hook, ctx| {
                    hook.on_batch_end(ctx, &batch, &output, window_loss)
                })?;
                tracing::debug!(
                    epoch = self.state.epoch,
                    step = self.state.step,
                    loss = window_loss,
                    "Optimizer step"
                );

                if self.hooks.stop_requested() {
                    self.status = TrainerStatus::Stopping;
                    break;
                }

                window_loss = 0.0;
                self.optimizer.zero_grad(&mut self.model)?;
            }
        }

        let mean = if steps == 0 {
            0.0
        } else {
            epoch_loss / steps as f64
        };
        Ok((mean, steps))
    }

    /// Validation pass, best-model selection, `on_validation_end`.
    fn validate(&mut self, device: &Device) -> Result<f64, TrainError> {
        let loss = self.evaluator.run(
            &mut self.model,
            &*self.loss_fn,
            &mut *self.validation_data,
            device,
            &mut self.hooks,
            &self.state,
        )?;

        let selection = self
            .selector
            .select(&mut self.state, loss, self.model.state_root())?;

        self.hooks
            .dispatch(&self.state, |hook, ctx| hook.on_validation_end(ctx, loss))?;
        self.evaluator.commit()?;

        tracing::debug!(epoch = self.state.epoch, loss, ?selection, "Validation complete");
        Ok(loss)
    }

    pub fn status(&self) -> TrainerStatus {
        self.status
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn checkpoints(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn selector(&self) -> &BestModelSelector {
        &self.selector
    }

    /// Hook names in registration order.
    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.names()
    }
}
