//! Error types for the epochal-core crate.

use thiserror::Error;

/// Top-level error type for training-run orchestration.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Loss error: {0}")]
    Loss(String),

    #[error("Optimizer error: {0}")]
    Optimizer(String),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("Ensemble error: {0}")]
    Ensemble(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl TrainError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptCheckpoint(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    pub fn loss(msg: impl Into<String>) -> Self {
        Self::Loss(msg.into())
    }

    pub fn optimizer(msg: impl Into<String>) -> Self {
        Self::Optimizer(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device(msg.into())
    }

    pub fn hook(hook: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.into(),
            message: message.into(),
        }
    }

    pub fn ensemble(msg: impl Into<String>) -> Self {
        Self::Ensemble(msg.into())
    }
}

