//! Ensemble prediction smoothing.
//!
//! Blends each validation batch's prediction with the raw predictions the
//! model produced for the same batch position in recent validation passes.
//! History is keyed by position, so the validation source must yield the same
//! batches in the same order every pass; a pass whose shape disagrees with the
//! recorded history is rejected rather than mixed.

use std::collections::VecDeque;

use crate::error::TrainError;

/// Raw predictions of one validation pass, indexed by batch position.
pub type PassPredictions = Vec<Vec<f64>>;

/// Rolling per-position prediction history.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsembleSmoother {
    remember: usize,
    history: VecDeque<PassPredictions>,
    current: PassPredictions,
}

impl EnsembleSmoother {
    pub fn new(remember: usize) -> Self {
        Self {
            remember,
            history: VecDeque::with_capacity(remember),
            current: Vec::new(),
        }
    }

    /// Rebuild from a checkpointed history (oldest pass first).
    pub fn with_history(remember: usize, history: Vec<PassPredictions>) -> Self {
        let mut smoother = Self::new(remember);
        smoother.history = history.into();
        smoother.trim();
        smoother
    }

    pub fn remember(&self) -> usize {
        self.remember
    }

    /// Number of completed passes currently remembered.
    pub fn depth(&self) -> usize {
        self.history.len()
    }

    /// Snapshot of the history for checkpointing, oldest pass first.
    pub fn history(&self) -> Vec<PassPredictions> {
        self.history.iter().cloned().collect()
    }

    /// Start a validation pass, discarding anything left by an aborted one.
    pub fn begin_pass(&mut self) {
        self.current.clear();
    }

    /// Smooth the prediction for the next batch position of the current pass.
    ///
    /// Returns the arithmetic mean of `raw` and the remembered predictions at
    /// this position. With no history, `raw` comes back unchanged. The raw
    /// value is kept for [`EnsembleSmoother::commit_pass`].
    ///
    /// Non-finite predictions are rejected: the history is checkpointed as
    /// JSON, which cannot carry NaN or infinities.
    pub fn smooth(&mut self, raw: &[f64]) -> Result<Vec<f64>, TrainError> {
        let position = self.current.len();
        if let Some(index) = raw.iter().position(|value| !value.is_finite()) {
            return Err(TrainError::ensemble(format!(
                "prediction at batch {position} has non-finite value {} at index {index}",
                raw[index]
            )));
        }
        let mut sum = raw.to_vec();

        for (age, pass) in self.history.iter().enumerate() {
            let past = pass.get(position).ok_or_else(|| {
                TrainError::ensemble(format!(
                    "validation pass has more batches than remembered pass {age} ({})",
                    pass.len()
                ))
            })?;
            if past.len() != raw.len() {
                return Err(TrainError::ensemble(format!(
                    "prediction at batch {position} has {} values, remembered pass {age} has {}",
                    raw.len(),
                    past.len()
                )));
            }
            for (acc, value) in sum.iter_mut().zip(past) {
                *acc += value;
            }
        }

        let members = (self.history.len() + 1) as f64;
        for value in sum.iter_mut() {
            *value /= members;
        }

        self.current.push(raw.to_vec());
        Ok(sum)
    }

    /// Append the finished pass to the history and drop passes beyond `remember`.
    pub fn commit_pass(&mut self) -> Result<(), TrainError> {
        let pass = std::mem::take(&mut self.current);
        if let Some(last) = self.history.back() {
            if last.len() != pass.len() {
                return Err(TrainError::ensemble(format!(
                    "validation pass produced {} batches, previous pass produced {}",
                    pass.len(),
                    last.len()
                )));
            }
        }
        self.history.push_back(pass);
        self.trim();
        Ok(())
    }

    fn trim(&mut self) {
        while self.history.len() > self.remember {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn run_pass(smoother: &mut EnsembleSmoother, raws: &[Vec<f64>]) -> Vec<Vec<f64>> {
        smoother.begin_pass();
        let smoothed = raws.iter().map(|r| smoother.smooth(r).unwrap()).collect();
        smoother.commit_pass().unwrap();
        smoothed
    }

    #[test]
    fn test_first_pass_is_unchanged() {
        let mut smoother = EnsembleSmoother::new(2);
        let out = run_pass(&mut smoother, &[vec![1.0, 2.0], vec![3.0]]);
        assert_eq!(out, vec![vec![1.0, 2.0], vec![3.0]]);
        assert_eq!(smoother.depth(), 1);
    }

    #[test]
    fn test_second_pass_averages_with_first() {
        let mut smoother = EnsembleSmoother::new(2);
        run_pass(&mut smoother, &[vec![2.0]]);
        let out = run_pass(&mut smoother, &[vec![4.0]]);
        assert_eq!(out, vec![vec![3.0]]);
    }

    #[test]
    fn test_history_is_raw_not_smoothed() {
        let mut smoother = EnsembleSmoother::new(3);
        run_pass(&mut smoother, &[vec![0.0]]);
        run_pass(&mut smoother, &[vec![6.0]]);
        assert_eq!(smoother.history(), vec![vec![vec![0.0]], vec![vec![6.0]]]);
        let out = run_pass(&mut smoother, &[vec![3.0]]);
        assert_eq!(out, vec![vec![3.0]]);
    }

    #[test]
    fn test_history_bounded_by_remember() {
        let mut smoother = EnsembleSmoother::new(2);
        for value in [1.0, 2.0, 3.0, 4.0] {
            run_pass(&mut smoother, &[vec![value]]);
        }
        assert_eq!(smoother.depth(), 2);
        assert_eq!(smoother.history(), vec![vec![vec![3.0]], vec![vec![4.0]]]);

        // mean of {current, 3, 4}
        let out = run_pass(&mut smoother, &[vec![8.0]]);
        assert_eq!(out, vec![vec![5.0]]);
    }

    #[test]
    fn test_extra_batch_is_rejected() {
        let mut smoother = EnsembleSmoother::new(2);
        run_pass(&mut smoother, &[vec![1.0]]);

        smoother.begin_pass();
        smoother.smooth(&[1.0]).unwrap();
        assert!(matches!(
            smoother.smooth(&[1.0]),
            Err(TrainError::Ensemble(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let mut smoother = EnsembleSmoother::new(2);
        run_pass(&mut smoother, &[vec![1.0, 2.0]]);

        smoother.begin_pass();
        assert!(smoother.smooth(&[1.0]).is_err());
    }

    #[test]
    fn test_non_finite_prediction_is_rejected() {
        let mut smoother = EnsembleSmoother::new(2);
        smoother.begin_pass();
        assert!(matches!(
            smoother.smooth(&[1.0, f64::NAN]),
            Err(TrainError::Ensemble(_))
        ));
        assert!(smoother.smooth(&[f64::INFINITY]).is_err());
    }

    #[test]
    fn test_short_pass_is_rejected_on_commit() {
        let mut smoother = EnsembleSmoother::new(2);
        run_pass(&mut smoother, &[vec![1.0], vec![2.0]]);

        smoother.begin_pass();
        smoother.smooth(&[1.0]).unwrap();
        assert!(smoother.commit_pass().is_err());
    }

    #[test]
    fn test_with_history_trims() {
        let history = vec![vec![vec![1.0]], vec![vec![2.0]], vec![vec![3.0]]];
        let smoother = EnsembleSmoother::with_history(2, history);
        assert_eq!(smoother.history(), vec![vec![vec![2.0]], vec![vec![3.0]]]);
    }
}
