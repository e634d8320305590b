//! # epochal-core: Resumable Training-Run Orchestration
//!
//! Drives an iterative optimization loop (epochs of batches) against a
//! pluggable model, loss and optimizer, persists progress so a run can be
//! killed and resumed without losing state, and exposes hooks so logging,
//! scheduling and early stopping can be injected without touching the loop.
//!
//! ## Components
//!
//! - [`hooks`]: lifecycle callbacks and the shared stop flag
//! - [`callbacks`]: built-in hooks (early stopping, limits, logging, interrupts)
//! - [`checkpoint`]: epoch-tagged snapshots with bounded retention
//! - [`validation`]: validation pass and loss aggregation
//! - [`selector`]: single-best or top-K ensemble model retention
//! - [`ensemble`]: per-position prediction smoothing across passes
//! - [`trainer`]: the controller tying everything together
//!
//! The model, loss, optimizer, data sources and device placement stay
//! external; [`capability`] lists what the loop expects of them.

// Foundation
pub mod capability;
pub mod config;
pub mod error;
pub mod persistence;
pub mod state;

// Orchestration
pub mod callbacks;
pub mod checkpoint;
pub mod ensemble;
pub mod hooks;
pub mod metrics;
pub mod selector;
pub mod trainer;
pub mod validation;

// Re-exports
pub use callbacks::{
    AnomalyHook, EarlyStoppingHook, InterruptHook, LoggingHook, MaxEpochHook, MaxStepHook,
};
pub use capability::{Batch, DataSource, Device, LossFn, Model, ModelOutput, Optimizer, Stateful};
pub use checkpoint::{CheckpointId, CheckpointStore};
pub use config::{TrainerConfig, load_config};
pub use ensemble::EnsembleSmoother;
pub use error::TrainError;
pub use hooks::{Hook, HookContext, HookRegistry};
pub use metrics::TrainingMetrics;
pub use selector::{BestModelSelector, Selection, SelectionPolicy};
pub use state::RunState;
pub use trainer::{BoxedHook, Components, Trainer, TrainerStatus};
