use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A container whose own process exited non-zero.
///
/// This is the actionable case: the algorithm, opener or metrics code inside
/// the image is broken, and the captured stderr says why.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error(
    "Command '{command}' in image '{image}' returned non-zero exit status {exit_status}:\n{stderr}"
)]
pub struct ProcessFailure {
    pub command: String,
    pub image: String,
    pub exit_status: i32,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn container runtime '{runtime}': {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error(
        "Building image '{tag}' from {} failed ({}): {}",
        .source_dir.display(),
        describe_status(.status),
        .stderr.trim()
    )]
    BuildFailed {
        tag: String,
        source_dir: PathBuf,
        status: Option<i32>,
        stderr: String,
    },
    /// Infrastructure failure reported by the runtime itself, or a process
    /// failure whose stderr could not be decoded. Stderr is kept as raw bytes.
    #[error(
        "Container runtime failed for image '{image}' ({}): {}",
        describe_status(.status),
        String::from_utf8_lossy(.stderr).trim()
    )]
    Runtime {
        image: String,
        status: Option<i32>,
        stderr: Vec<u8>,
    },
    #[error(transparent)]
    Process(#[from] ProcessFailure),
    #[error("Image '{image}' exceeded the stage timeout of {limit:?}")]
    Timeout { image: String, limit: Duration },
    #[error("Stage for image '{image}' was cancelled")]
    Cancelled { image: String },
    #[error("I/O error while supervising container runtime: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// The structured process failure, when the container itself exited non-zero.
    pub fn process_failure(&self) -> Option<&ProcessFailure> {
        match self {
            EngineError::Process(failure) => Some(failure),
            _ => None,
        }
    }

    pub fn exit_status(&self) -> Option<i32> {
        match self {
            EngineError::BuildFailed { status, .. } | EngineError::Runtime { status, .. } => {
                *status
            }
            EngineError::Process(failure) => Some(failure.exit_status),
            _ => None,
        }
    }
}

fn describe_status(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {}", code),
        None => "terminated by signal".to_string(),
    }
}
