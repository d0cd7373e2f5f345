use crate::models::LinkError;
use crate::perf::ArtifactError;
use crate::sandbox::SandboxError;
use container_exec::{EngineError, ProcessFailure};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ResolvePaths,
    ResetSandbox,
    BuildAlgo,
    LinkModels,
    Train,
    VerifyModel,
    BuildMetrics,
    EvaluateTrain,
    BuildTestImage,
    Test,
    RebuildMetrics,
    EvaluateTest,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::ResolvePaths => "resolve_paths",
            Stage::ResetSandbox => "reset_sandbox",
            Stage::BuildAlgo => "build_algo",
            Stage::LinkModels => "link_models",
            Stage::Train => "train",
            Stage::VerifyModel => "verify_model",
            Stage::BuildMetrics => "build_metrics",
            Stage::EvaluateTrain => "evaluate_train",
            Stage::BuildTestImage => "build_test_image",
            Stage::Test => "test",
            Stage::RebuildMetrics => "rebuild_metrics",
            Stage::EvaluateTest => "evaluate_test",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad combination of inputs; nothing was touched.
    #[error("{0}")]
    Usage(String),

    #[error("Stage '{stage}' failed: {source}")]
    Sandbox {
        stage: Stage,
        source: SandboxError,
    },

    #[error("Stage '{stage}' failed: {source}")]
    Link { stage: Stage, source: LinkError },

    #[error("Stage '{stage}' failed to build image: {source}")]
    Build { stage: Stage, source: EngineError },

    #[error("Stage '{stage}' failed: {source}")]
    Run { stage: Stage, source: EngineError },

    #[error("Stage '{stage}' produced an invalid artifact: {source}")]
    Artifact { stage: Stage, source: ArtifactError },

    #[error("Pipeline cancelled before stage '{stage}'")]
    Cancelled { stage: Stage },
}

impl PipelineError {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Usage(_) => None,
            PipelineError::Sandbox { stage, .. }
            | PipelineError::Link { stage, .. }
            | PipelineError::Build { stage, .. }
            | PipelineError::Run { stage, .. }
            | PipelineError::Artifact { stage, .. }
            | PipelineError::Cancelled { stage } => Some(*stage),
        }
    }

    pub fn is_usage(&self) -> bool {
        matches!(self, PipelineError::Usage(_))
    }

    /// The failing container's own exit details, if that is what went wrong.
    pub fn process_failure(&self) -> Option<&ProcessFailure> {
        match self {
            PipelineError::Run { source, .. } => source.process_failure(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_exposes_process_failure_and_stage() {
        let err = PipelineError::Run {
            stage: Stage::EvaluateTest,
            source: EngineError::Process(ProcessFailure {
                command: "--fake-data-mode DISABLED".to_string(),
                image: "metrics_run_local".to_string(),
                exit_status: 3,
                stderr: "KeyError: 'y'".to_string(),
            }),
        };
        assert_eq!(err.stage(), Some(Stage::EvaluateTest));
        assert_eq!(err.process_failure().map(|f| f.exit_status), Some(3));
        let message = err.to_string();
        assert!(message.starts_with("Stage 'evaluate_test' failed: Command '--fake-data-mode DISABLED'"));
    }

    #[test]
    fn usage_error_has_no_stage() {
        let err = PipelineError::Usage("Missing option --train-data-samples".to_string());
        assert!(err.is_usage());
        assert_eq!(err.stage(), None);
        assert_eq!(err.to_string(), "Missing option --train-data-samples");
    }
}
