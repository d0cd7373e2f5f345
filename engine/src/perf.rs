//! Reads the score an evaluation run leaves in its prediction directory.

use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PERF_FILENAME: &str = "perf.json";
pub const SCORE_KEY: &str = "all";

/// A stage finished but its output does not honour the artifact contract.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Model {} doesn't exist", .path.display())]
    ModelMissing { path: PathBuf },
    #[error("Performance file {} could not be read: {source}", .path.display())]
    PerfUnreadable { path: PathBuf, source: io::Error },
    #[error("Performance file {} is not valid JSON: {source}", .path.display())]
    PerfInvalid {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Performance file {} has no numeric 'all' score", .path.display())]
    ScoreMissing { path: PathBuf },
}

/// Parse `pred_dir/perf.json` and return its `all` score. Other keys are ignored.
pub fn read_performance(pred_dir: &Path) -> Result<f64, ArtifactError> {
    let path = pred_dir.join(PERF_FILENAME);

    let raw = fs::read(&path).map_err(|source| ArtifactError::PerfUnreadable {
        path: path.clone(),
        source,
    })?;
    let perf: Value = serde_json::from_slice(&raw).map_err(|source| ArtifactError::PerfInvalid {
        path: path.clone(),
        source,
    })?;

    perf.get(SCORE_KEY)
        .and_then(Value::as_f64)
        .ok_or(ArtifactError::ScoreMissing { path })
}
