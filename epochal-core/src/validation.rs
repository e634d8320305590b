//! Validation pass: run the model over the validation source and reduce the
//! per-batch losses to one scalar.

use crate::capability::{Batch, DataSource, Device, LossFn, Model, ModelOutput};
use crate::ensemble::EnsembleSmoother;
use crate::error::TrainError;
use crate::hooks::HookRegistry;
use crate::state::RunState;

/// Running sum of batch losses for one validation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossAccumulator {
    normalized: bool,
    total: f64,
    examples: usize,
    batches: usize,
}

impl LossAccumulator {
    pub fn new(normalized: bool) -> Self {
        Self {
            normalized,
            ..Self::default()
        }
    }

    pub fn add(&mut self, batch_loss: f64, batch_size: usize) {
        if self.normalized {
            self.total += batch_loss * batch_size as f64;
        } else {
            self.total += batch_loss;
        }
        self.examples += batch_size;
        self.batches += 1;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Per-example mean when normalized, plain sum of batch losses otherwise.
    ///
    /// A normalized pass over zero examples has no mean and yields NaN.
    pub fn finish(&self) -> f64 {
        if self.normalized {
            if self.examples == 0 {
                return f64::NAN;
            }
            self.total / self.examples as f64
        } else {
            self.total
        }
    }
}

/// Runs validation passes, optionally through the ensemble smoother.
pub struct Evaluator {
    loss_is_normalized: bool,
    smoother: Option<EnsembleSmoother>,
}

impl Evaluator {
    pub fn new(loss_is_normalized: bool, smoother: Option<EnsembleSmoother>) -> Self {
        Self {
            loss_is_normalized,
            smoother,
        }
    }

    pub fn smoother(&self) -> Option<&EnsembleSmoother> {
        self.smoother.as_ref()
    }

    pub fn set_smoother(&mut self, smoother: Option<EnsembleSmoother>) {
        self.smoother = smoother;
    }

    /// One full validation pass. Returns the aggregated loss.
    ///
    /// Raw predictions of the pass are held by the smoother until
    /// [`Evaluator::commit`] records them into its history.
    pub fn run<M: Model>(
        &mut self,
        model: &mut M,
        loss_fn: &dyn LossFn<M::Batch, M::Output>,
        source: &mut dyn DataSource<M::Batch>,
        device: &Device,
        hooks: &mut HookRegistry<M::Batch, M::Output>,
        state: &RunState,
    ) -> Result<f64, TrainError> {
        hooks.dispatch(state, |hook, ctx| hook.on_validation_begin(ctx))?;

        model.set_training(false);
        if let Some(smoother) = self.smoother.as_mut() {
            smoother.begin_pass();
        }

        let mut accumulator = LossAccumulator::new(self.loss_is_normalized);
        for batch in source.batches()? {
            let batch = batch?;
            let size = batch.size();

            hooks.dispatch(state, |hook, ctx| hook.on_validation_batch_begin(ctx))?;

            let batch = batch.to_device(device)?;
            let mut output = model.forward(&batch)?;

            if let Some(smoother) = self.smoother.as_mut() {
                let smoothed = smoother.smooth(output.prediction())?;
                output.set_prediction(smoothed);
            }

            let batch_loss = loss_fn.loss(&batch, &output)?;
            accumulator.add(batch_loss, size);

            hooks.dispatch(state, |hook, ctx| {
                hook.on_validation_batch_end(ctx, &batch, &output)
            })?;
        }

        let loss = accumulator.finish();
        tracing::debug!(
            epoch = state.epoch,
            batches = accumulator.batches(),
            loss,
            "Validation pass finished"
        );
        Ok(loss)
    }

    /// Record the last pass's raw predictions in the smoother history.
    pub fn commit(&mut self) -> Result<(), TrainError> {
        match self.smoother.as_mut() {
            Some(smoother) => smoother.commit_pass(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalized_loss_is_per_example_mean() {
        let mut acc = LossAccumulator::new(true);
        acc.add(1.0, 4);
        acc.add(2.0, 6);
        assert!((acc.finish() - 1.6).abs() < 1e-12);
    }

    #[test]
    fn test_unnormalized_loss_is_batch_sum() {
        let mut acc = LossAccumulator::new(false);
        acc.add(1.0, 4);
        acc.add(2.0, 6);
        assert_eq!(acc.finish(), 3.0);
        assert_eq!(acc.batches(), 2);
    }

    #[test]
    fn test_empty_pass() {
        assert!(LossAccumulator::new(true).finish().is_nan());
        assert_eq!(LossAccumulator::new(false).finish(), 0.0);
    }
}
