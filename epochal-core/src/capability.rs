//! Capabilities the training loop consumes but does not implement.
//!
//! The controller treats the model, loss, optimizer, data sources and device
//! placement as opaque collaborators. Everything numeric lives behind these
//! traits; the loop only sequences calls and moves state blobs around.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::TrainError;

/// Target execution context for batches and model buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Device::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}

/// Something whose state can be captured into and restored from an opaque blob.
pub trait Stateful {
    fn state_dict(&self) -> Result<Value, TrainError>;

    fn load_state_dict(&mut self, state: Value) -> Result<(), TrainError>;
}

/// One batch of examples.
pub trait Batch: Sized {
    /// Number of examples in the batch, used to weight normalized losses.
    fn size(&self) -> usize;

    /// Relocate the batch's fields onto `device`.
    fn to_device(self, _device: &Device) -> Result<Self, TrainError> {
        Ok(self)
    }
}

/// The result of a forward pass.
///
/// Only the prediction field is visible to the trainer, so the ensemble
/// smoother can blend it with earlier epochs.
pub trait ModelOutput {
    fn prediction(&self) -> &[f64];

    fn set_prediction(&mut self, prediction: Vec<f64>);
}

/// A trainable model.
pub trait Model {
    type Batch: Batch;
    type Output: ModelOutput;

    fn forward(&mut self, batch: &Self::Batch) -> Result<Self::Output, TrainError>;

    /// Accumulate gradients of the loss for this batch, scaled by `scale`.
    fn backward(
        &mut self,
        batch: &Self::Batch,
        output: &Self::Output,
        scale: f64,
    ) -> Result<(), TrainError>;

    /// Switch between training and evaluation behaviour (dropout and the like).
    fn set_training(&mut self, _training: bool) {}

    fn to_device(&mut self, _device: &Device) -> Result<(), TrainError> {
        Ok(())
    }

    /// The object whose state is checkpointed.
    ///
    /// Wrappers that replicate a model across devices return the wrapped
    /// model here so checkpoints stay independent of the wrapper.
    fn state_root(&self) -> &dyn Stateful;

    fn state_root_mut(&mut self) -> &mut dyn Stateful;
}

/// Parameter update rule.
pub trait Optimizer<M: Model>: Stateful {
    fn zero_grad(&mut self, model: &mut M) -> Result<(), TrainError>;

    fn step(&mut self, model: &mut M) -> Result<(), TrainError>;

    /// Move optimizer buffers next to the model's parameters.
    fn to_device(&mut self, _device: &Device) -> Result<(), TrainError> {
        Ok(())
    }
}

/// Scalar training objective.
pub trait LossFn<B, O> {
    fn loss(&self, batch: &B, output: &O) -> Result<f64, TrainError>;
}

impl<B, O, F> LossFn<B, O> for F
where
    F: Fn(&B, &O) -> Result<f64, TrainError>,
{
    fn loss(&self, batch: &B, output: &O) -> Result<f64, TrainError> {
        self(batch, output)
    }
}

/// Iterator handed out by a [`DataSource`] for one pass.
pub type BatchIter<'a, B> = Box<dyn Iterator<Item = Result<B, TrainError>> + 'a>;

/// A finite, restartable sequence of batches.
///
/// Every call to [`DataSource::batches`] starts a fresh pass. Validation
/// sources must yield batches in the same order every pass when ensemble
/// smoothing is enabled.
pub trait DataSource<B> {
    fn batches(&mut self) -> Result<BatchIter<'_, B>, TrainError>;
}

impl<B: Clone> DataSource<B> for Vec<B> {
    fn batches(&mut self) -> Result<BatchIter<'_, B>, TrainError> {
        Ok(Box::new(self.iter().cloned().map(Ok)))
    }
}
