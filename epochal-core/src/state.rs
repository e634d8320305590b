//! Run state, the unit of persistence and resume.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Everything needed to continue a run exactly where it stopped.
///
/// `epoch`, `step`, `best_loss` and `best_losses` are live counters owned by
/// the trainer. The opaque blobs (`optimizer_state`, `model_state`,
/// `hook_states`, `prediction_history`) are refreshed from their owners each
/// time a checkpoint is written and routed back to them on resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Completed epochs.
    pub epoch: u64,
    /// Completed optimizer updates.
    pub step: u64,
    /// Lowest validation loss seen so far; `+inf` until a validation pass completes.
    #[serde(with = "infinite_as_null")]
    pub best_loss: f64,
    /// Losses of the retained ensemble members, indexed by slot.
    #[serde(default)]
    pub best_losses: Vec<f64>,
    #[serde(default)]
    pub optimizer_state: Value,
    /// One blob per registered hook, in registration order.
    #[serde(default)]
    pub hook_states: Vec<Value>,
    #[serde(default)]
    pub model_state: Value,
    /// Raw validation predictions of recent passes, oldest first, indexed by
    /// batch position.
    #[serde(default)]
    pub prediction_history: Vec<Vec<Vec<f64>>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            epoch: 0,
            step: 0,
            best_loss: f64::INFINITY,
            best_losses: Vec::new(),
            optimizer_state: Value::Null,
            hook_states: Vec::new(),
            model_state: Value::Null,
            prediction_history: Vec::new(),
        }
    }
}

impl RunState {
    /// True until the first validation pass has produced a loss.
    pub fn is_unvalidated(&self) -> bool {
        self.best_loss.is_infinite() && self.best_losses.is_empty()
    }
}

/// JSON has no infinity; `+inf` travels as `null`.
mod infinite_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_finite() {
            serializer.serialize_f64(*value)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::INFINITY))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_fresh_state() {
        let state = RunState::default();
        assert_eq!(state.epoch, 0);
        assert_eq!(state.step, 0);
        assert!(state.best_loss.is_infinite());
        assert!(state.is_unvalidated());
    }

    #[test]
    fn test_infinite_best_loss_roundtrip() {
        let state = RunState::default();
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"best_loss\":null"));
        let restored: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_full_state_roundtrip() {
        let state = RunState {
            epoch: 12,
            step: 480,
            best_loss: 0.123_456_789,
            best_losses: vec![0.3, 0.1, 0.2],
            optimizer_state: json!({"lr": 1e-4, "velocity": [0.1, -0.2]}),
            hook_states: vec![json!({"counter": 2}), Value::Null],
            model_state: json!({"weights": [1.0 / 3.0, 2.0 / 7.0], "bias": -0.5}),
            prediction_history: vec![vec![vec![1.0, 2.0]], vec![vec![1.5, 2.5]]],
        };
        let json = serde_json::to_string(&state).unwrap();
        let restored: RunState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let restored: RunState =
            serde_json::from_str(r#"{"epoch": 3, "step": 9, "best_loss": 0.5}"#).unwrap();
        assert_eq!(restored.epoch, 3);
        assert!(restored.best_losses.is_empty());
        assert!(restored.prediction_history.is_empty());
        assert_eq!(restored.model_state, Value::Null);
    }
}
