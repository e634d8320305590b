//! Synthetic linear-regression workload driven by `epochal train`.
//!
//! Small enough to train on a laptop in seconds, but it exercises every part
//! of the loop: stateful model and optimizer, batched data, validation and
//! resume.

use epochal_core::{Batch, Device, Model, ModelOutput, Optimizer, Stateful, TrainError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Input dimensionality of the generated problem.
pub const FEATURES: usize = 3;

const NOISE: f64 = 0.05;
const VALIDATION_FRACTION: f64 = 0.2;

#[derive(Debug, Clone, PartialEq)]
pub struct Samples {
    pub features: Vec<Vec<f64>>,
    pub targets: Vec<f64>,
}

impl Batch for Samples {
    fn size(&self) -> usize {
        self.targets.len()
    }
}

#[derive(Debug, Clone)]
pub struct Prediction(pub Vec<f64>);

impl ModelOutput for Prediction {
    fn prediction(&self) -> &[f64] {
        &self.0
    }

    fn set_prediction(&mut self, prediction: Vec<f64>) {
        self.0 = prediction;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Params {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl Params {
    fn zeros(features: usize) -> Self {
        Self {
            weights: vec![0.0; features],
            bias: 0.0,
        }
    }

    fn load(state: Value, features: usize) -> Result<Self, TrainError> {
        let params: Params = serde_json::from_value(state)?;
        if params.weights.len() != features {
            return Err(TrainError::model(format!(
                "expected {features} weights, checkpoint has {}",
                params.weights.len()
            )));
        }
        Ok(params)
    }
}

/// `y = w·x + b`.
#[derive(Debug, Clone)]
pub struct LinearRegression {
    params: Params,
    grad: Params,
}

impl LinearRegression {
    pub fn new(features: usize) -> Self {
        Self {
            params: Params::zeros(features),
            grad: Params::zeros(features),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    fn features(&self) -> usize {
        self.params.weights.len()
    }

    fn predict(&self, row: &[f64]) -> f64 {
        row.iter()
            .zip(&self.params.weights)
            .map(|(x, w)| x * w)
            .sum::<f64>()
            + self.params.bias
    }
}

impl Stateful for LinearRegression {
    fn state_dict(&self) -> Result<Value, TrainError> {
        Ok(serde_json::to_value(&self.params)?)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), TrainError> {
        self.params = Params::load(state, self.features())?;
        Ok(())
    }
}

impl Model for LinearRegression {
    type Batch = Samples;
    type Output = Prediction;

    fn forward(&mut self, batch: &Samples) -> Result<Prediction, TrainError> {
        batch
            .features
            .iter()
            .map(|row| {
                if row.len() == self.features() {
                    Ok(self.predict(row))
                } else {
                    Err(TrainError::model(format!(
                        "row has {} features, model expects {}",
                        row.len(),
                        self.features()
                    )))
                }
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Prediction)
    }

    fn backward(
        &mut self,
        batch: &Samples,
        output: &Prediction,
        scale: f64,
    ) -> Result<(), TrainError> {
        let n = batch.size() as f64;
        for ((row, target), predicted) in batch.features.iter().zip(&batch.targets).zip(&output.0) {
            let err = 2.0 * (predicted - target) / n * scale;
            for (g, x) in self.grad.weights.iter_mut().zip(row) {
                *g += err * x;
            }
            self.grad.bias += err;
        }
        Ok(())
    }

    fn to_device(&mut self, device: &Device) -> Result<(), TrainError> {
        match device {
            Device::Cpu => Ok(()),
            other => Err(TrainError::device(format!(
                "the demo model only runs on cpu, not {other}"
            ))),
        }
    }

    fn state_root(&self) -> &dyn Stateful {
        self
    }

    fn state_root_mut(&mut self) -> &mut dyn Stateful {
        self
    }
}

/// SGD with classical momentum. The velocity is part of the checkpoint.
#[derive(Debug, Clone)]
pub struct MomentumSgd {
    pub lr: f64,
    pub momentum: f64,
    velocity: Params,
}

impl MomentumSgd {
    pub fn new(features: usize, lr: f64, momentum: f64) -> Self {
        Self {
            lr,
            momentum,
            velocity: Params::zeros(features),
        }
    }

    pub fn velocity(&self) -> &Params {
        &self.velocity
    }
}

impl Stateful for MomentumSgd {
    fn state_dict(&self) -> Result<Value, TrainError> {
        Ok(serde_json::to_value(&self.velocity)?)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), TrainError> {
        self.velocity = Params::load(state, self.velocity.weights.len())
            .map_err(|e| TrainError::optimizer(e.to_string()))?;
        Ok(())
    }
}

impl Optimizer<LinearRegression> for MomentumSgd {
    fn zero_grad(&mut self, model: &mut LinearRegression) -> Result<(), TrainError> {
        model.grad = Params::zeros(model.features());
        Ok(())
    }

    fn step(&mut self, model: &mut LinearRegression) -> Result<(), TrainError> {
        for ((v, g), w) in self
            .velocity
            .weights
            .iter_mut()
            .zip(&model.grad.weights)
            .zip(model.params.weights.iter_mut())
        {
            *v = self.momentum * *v + g;
            *w -= self.lr * *v;
        }
        self.velocity.bias = self.momentum * self.velocity.bias + model.grad.bias;
        model.params.bias -= self.lr * self.velocity.bias;
        Ok(())
    }
}

/// Per-example mean squared error.
pub fn mse(batch: &Samples, output: &Prediction) -> Result<f64, TrainError> {
    if batch.targets.len() != output.0.len() {
        return Err(TrainError::loss(format!(
            "{} targets but {} predictions",
            batch.targets.len(),
            output.0.len()
        )));
    }
    if batch.targets.is_empty() {
        return Err(TrainError::loss("empty batch"));
    }
    let total: f64 = batch
        .targets
        .iter()
        .zip(&output.0)
        .map(|(y, p)| (p - y).powi(2))
        .sum();
    Ok(total / batch.targets.len() as f64)
}

/// Generated train/validation split plus the parameters that produced it.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<Samples>,
    pub validation: Vec<Samples>,
    pub truth: Params,
}

/// Draw `samples` noisy points from a random linear function.
///
/// The same `seed` always yields the same data, so a resumed run sees the
/// batches it was trained on.
pub fn synthetic(samples: usize, batch_size: usize, seed: u64) -> Result<Dataset, TrainError> {
    if batch_size == 0 {
        return Err(TrainError::data("batch size must be at least 1"));
    }
    if samples < 2 {
        return Err(TrainError::data("need at least 2 samples for a train/validation split"));
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let truth = Params {
        weights: (0..FEATURES).map(|_| rng.gen_range(-2.0..2.0)).collect(),
        bias: rng.gen_range(-1.0..1.0),
    };

    let mut rows = Vec::with_capacity(samples);
    let mut targets = Vec::with_capacity(samples);
    for _ in 0..samples {
        let row: Vec<f64> = (0..FEATURES).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let clean: f64 = row.iter().zip(&truth.weights).map(|(x, w)| x * w).sum::<f64>() + truth.bias;
        targets.push(clean + rng.gen_range(-NOISE..NOISE));
        rows.push(row);
    }

    let n_validation = ((samples as f64 * VALIDATION_FRACTION).ceil() as usize).clamp(1, samples - 1);
    let split = samples - n_validation;

    Ok(Dataset {
        train: into_batches(&rows[..split], &targets[..split], batch_size),
        validation: into_batches(&rows[split..], &targets[split..], batch_size),
        truth,
    })
}

fn into_batches(rows: &[Vec<f64>], targets: &[f64], batch_size: usize) -> Vec<Samples> {
    rows.chunks(batch_size)
        .zip(targets.chunks(batch_size))
        .map(|(features, targets)| Samples {
            features: features.to_vec(),
            targets: targets.to_vec(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn batch() -> Samples {
        Samples {
            features: vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]],
            targets: vec![1.0, 2.0],
        }
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = synthetic(50, 8, 7).unwrap();
        let b = synthetic(50, 8, 7).unwrap();
        assert_eq!(a.train, b.train);
        assert_eq!(a.validation, b.validation);
        assert_eq!(a.truth, b.truth);

        let c = synthetic(50, 8, 8).unwrap();
        assert_ne!(a.truth, c.truth);
    }

    #[test]
    fn test_synthetic_split_and_batching() {
        let data = synthetic(50, 8, 1).unwrap();
        let train: usize = data.train.iter().map(Batch::size).sum();
        let validation: usize = data.validation.iter().map(Batch::size).sum();
        assert_eq!(train, 40);
        assert_eq!(validation, 10);
        assert_eq!(data.train.len(), 5);
        assert_eq!(data.validation.len(), 2);
    }

    #[test]
    fn test_synthetic_rejects_bad_sizes() {
        assert!(matches!(synthetic(10, 0, 1), Err(TrainError::Data(_))));
        assert!(matches!(synthetic(1, 4, 1), Err(TrainError::Data(_))));
    }

    #[test]
    fn test_mse() {
        let loss = mse(&batch(), &Prediction(vec![0.0, 4.0])).unwrap();
        assert_eq!(loss, 2.5);
        assert!(mse(&batch(), &Prediction(vec![0.0])).is_err());
    }

    #[test]
    fn test_backward_scales_gradient() {
        let mut model = LinearRegression::new(FEATURES);
        let output = model.forward(&batch()).unwrap();
        model.backward(&batch(), &output, 0.5).unwrap();

        // d/dw of mean (w·x - y)^2 at w = 0 is -y_i * x_i, halved by the scale.
        assert_eq!(model.grad.weights, vec![-0.5, -1.0, 0.0]);
        assert_eq!(model.grad.bias, -1.5);
    }

    #[test]
    fn test_momentum_step_and_state() {
        let mut model = LinearRegression::new(FEATURES);
        let mut sgd = MomentumSgd::new(FEATURES, 0.1, 0.9);
        model.grad.weights = vec![1.0, 0.0, -1.0];
        model.grad.bias = 2.0;

        sgd.step(&mut model).unwrap();
        sgd.step(&mut model).unwrap();

        let v = &sgd.velocity().weights;
        assert!((v[0] - 1.9).abs() < 1e-12);
        assert_eq!(v[1], 0.0);
        assert!((v[2] + 1.9).abs() < 1e-12);
        assert!((model.params().weights[0] + 0.29).abs() < 1e-12);

        let mut restored = MomentumSgd::new(FEATURES, 0.1, 0.9);
        restored.load_state_dict(sgd.state_dict().unwrap()).unwrap();
        assert_eq!(restored.velocity(), sgd.velocity());
    }

    #[test]
    fn test_model_is_cpu_only() {
        let mut model = LinearRegression::new(FEATURES);
        assert!(model.to_device(&Device::Cpu).is_ok());
        assert!(matches!(
            model.to_device(&Device::Cuda(0)),
            Err(TrainError::Device(_))
        ));
    }

    #[test]
    fn test_load_rejects_wrong_width() {
        let mut model = LinearRegression::new(FEATURES);
        let state = serde_json::json!({ "weights": [1.0], "bias": 0.0 });
        assert!(matches!(model.load_state_dict(state), Err(TrainError::Model(_))));
    }
}
