//! Checkpoint store: epoch-tagged run-state snapshots with bounded retention.
//!
//! Layout: `<dir>/checkpoint-<epoch>.json`, one file per epoch. Each file is an
//! envelope carrying the SHA-256 of the exact serialized state so a truncated or
//! edited checkpoint is rejected on restore instead of silently resuming from
//! garbage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::TrainError;
use crate::persistence::atomic_write_json;
use crate::state::RunState;

const PREFIX: &str = "checkpoint-";
const SUFFIX: &str = ".json";

/// Identifies a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointId {
    pub epoch: u64,
    pub path: PathBuf,
}

/// On-disk envelope around a serialized [`RunState`].
#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    epoch: u64,
    created_at: DateTime<Utc>,
    sha256: String,
    state: Box<RawValue>,
}

/// Summary of a stored checkpoint, read without restoring it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub epoch: u64,
    pub created_at: DateTime<Utc>,
    pub sha256: String,
    pub size_bytes: u64,
}

/// Versioned persistence of run state.
pub struct CheckpointStore {
    dir: PathBuf,
    keep_n: usize,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, keep_n: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_n: keep_n.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn keep_n(&self) -> usize {
        self.keep_n
    }

    /// Whether a previous run left a checkpoint directory behind.
    pub fn exists(&self) -> bool {
        self.dir.is_dir()
    }

    fn path_for(&self, epoch: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{epoch}{SUFFIX}"))
    }

    /// Write `state` tagged with `state.epoch`, then prune old checkpoints.
    ///
    /// The new file is fully written and renamed into place before anything is
    /// deleted.
    pub fn store(&self, state: &RunState) -> Result<CheckpointId, TrainError> {
        std::fs::create_dir_all(&self.dir)?;

        let serialized = serde_json::to_string(state)?;
        let sha256 = hex_digest(serialized.as_bytes());
        let file = CheckpointFile {
            epoch: state.epoch,
            created_at: Utc::now(),
            sha256,
            state: RawValue::from_string(serialized)?,
        };

        let path = self.path_for(state.epoch);
        atomic_write_json(&path, &file)?;

        tracing::info!(
            epoch = state.epoch,
            step = state.step,
            path = %path.display(),
            "Stored checkpoint"
        );

        self.prune()?;

        Ok(CheckpointId {
            epoch: state.epoch,
            path,
        })
    }

    /// Restore the checkpoint for `epoch`, or the latest one when `None`.
    pub fn restore(&self, epoch: Option<u64>) -> Result<RunState, TrainError> {
        let epochs = self.list()?;
        let epoch = match epoch {
            Some(epoch) => epoch,
            None => *epochs.last().ok_or_else(|| {
                TrainError::not_found(format!("no checkpoints in {}", self.dir.display()))
            })?,
        };
        if !epochs.contains(&epoch) {
            return Err(TrainError::not_found(format!(
                "checkpoint for epoch {epoch} in {}",
                self.dir.display()
            )));
        }

        let path = self.path_for(epoch);
        let file = self.read_file(&path)?;
        if file.epoch != epoch {
            return Err(TrainError::corrupt(format!(
                "{} is tagged with epoch {}",
                path.display(),
                file.epoch
            )));
        }

        let raw = file.state.get();
        if hex_digest(raw.as_bytes()) != file.sha256 {
            return Err(TrainError::corrupt(format!(
                "digest mismatch in {}",
                path.display()
            )));
        }
        let state: RunState = serde_json::from_str(raw)
            .map_err(|e| TrainError::corrupt(format!("{}: {e}", path.display())))?;

        tracing::info!(epoch, step = state.step, "Restored checkpoint");
        Ok(state)
    }

    /// Stored epochs, ascending.
    pub fn list(&self) -> Result<Vec<u64>, TrainError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut epochs = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(epoch) = entry.file_name().to_str().and_then(parse_epoch) {
                epochs.push(epoch);
            }
        }
        epochs.sort_unstable();
        Ok(epochs)
    }

    /// Metadata for one stored checkpoint.
    pub fn info(&self, epoch: u64) -> Result<CheckpointInfo, TrainError> {
        let path = self.path_for(epoch);
        if !path.exists() {
            return Err(TrainError::not_found(format!("checkpoint for epoch {epoch}")));
        }
        let file = self.read_file(&path)?;
        Ok(CheckpointInfo {
            epoch: file.epoch,
            created_at: file.created_at,
            sha256: file.sha256,
            size_bytes: std::fs::metadata(&path)?.len(),
        })
    }

    fn read_file(&self, path: &Path) -> Result<CheckpointFile, TrainError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| TrainError::corrupt(format!("{}: {e}", path.display())))
    }

    /// Delete the oldest epochs until at most `keep_n` remain.
    fn prune(&self) -> Result<(), TrainError> {
        let epochs = self.list()?;
        if epochs.len() <= self.keep_n {
            return Ok(());
        }

        let excess = epochs.len() - self.keep_n;
        for epoch in &epochs[..excess] {
            std::fs::remove_file(self.path_for(*epoch))?;
        }

        tracing::info!(
            deleted = excess,
            kept = self.keep_n,
            "Pruned old checkpoints"
        );
        Ok(())
    }
}

fn parse_epoch(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(PREFIX)?
        .strip_suffix(SUFFIX)?
        .parse()
        .ok()
}

fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
