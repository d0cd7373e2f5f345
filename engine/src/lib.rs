//! Local compute pipeline: builds the algorithm and metrics images, trains,
//! predicts and scores inside containers, and exchanges every artifact
//! through a sandbox directory on the host.

pub mod command;
pub mod error;
pub mod models;
pub mod perf;
pub mod pipeline;
pub mod sandbox;

pub use error::{PipelineError, Stage};
pub use models::{InputModelRef, LinkError};
pub use perf::{read_performance, ArtifactError};
pub use pipeline::{Pipeline, PipelineInputs, PipelineOptions, PipelineReport, StageTiming};
pub use sandbox::{SandboxError, SandboxLayout};
