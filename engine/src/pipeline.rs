//! Train, evaluate, test, evaluate: the full local compute pipeline.
//!
//! Stages run strictly in order and every failure aborts the run. The
//! sandbox is left as-is on failure so it can be inspected. Only one pipeline
//! may use a given sandbox root at a time; the reset at the start of a run
//! destroys whatever another run on the same root has produced.

use crate::command::{metrics_command, predict_command, train_command, with_model_keys};
use crate::error::{PipelineError, Stage};
use crate::models::link_input_models;
use crate::perf::{read_performance, ArtifactError};
use crate::sandbox::{self, absolute_path, SandboxError, SandboxLayout};
use chrono::{DateTime, Utc};
use config_loader::{ModelKeyMode, RunnerConfig};
use container_exec::{
    CommandSpec, ContainerRunner, EngineError, ImageBuilder, ImageHandle, RunIdentity,
    VolumeBinding, Volumes,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

pub const MOUNT_OUTPUT_MODEL: &str = "/sandbox/model";
pub const MOUNT_OPENER: &str = "/sandbox/opener/__init__.py";
pub const MOUNT_PRED: &str = "/sandbox/pred";
pub const MOUNT_DATA: &str = "/sandbox/data";
pub const MOUNT_LOCAL: &str = "/sandbox/local";

/// Everything the caller supplies for one run.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub algo_dir: PathBuf,
    pub train_opener_file: PathBuf,
    pub test_opener_file: PathBuf,
    pub metrics_dir: PathBuf,
    pub train_data_dir: Option<PathBuf>,
    pub test_data_dir: Option<PathBuf>,
    pub rank: Option<u32>,
    pub inmodels: Vec<PathBuf>,
    pub fake_data_samples: bool,
}

impl PipelineInputs {
    /// Exactly one of: synthetic mode, or both real data directories.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let train = self.train_data_dir.is_some();
        let test = self.test_data_dir.is_some();

        let message = match (self.fake_data_samples, train, test) {
            (true, false, false) | (false, true, true) => return Ok(()),
            (true, _, _) => {
                "Options --train-data-samples and --test-data-samples cannot be used if \
                 --fake-data-samples is activated"
            }
            (false, false, false) => {
                "Missing option --fake-data-samples or --test-data-samples and \
                 --train-data-samples"
            }
            (false, true, false) => "Missing option --test-data-samples",
            (false, false, true) => "Missing option --train-data-samples",
        };
        Err(PipelineError::Usage(message.to_string()))
    }
}

/// Runner-side settings, normally derived from [`RunnerConfig`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub sandbox_root: PathBuf,
    pub algo_tag: String,
    pub metrics_tag: String,
    pub model_key_mode: ModelKeyMode,
    pub identity: RunIdentity,
    pub cancel: Option<Arc<AtomicBool>>,
}

impl PipelineOptions {
    pub fn from_config(config: &RunnerConfig, identity: RunIdentity) -> Self {
        Self {
            sandbox_root: config.sandbox_root.clone(),
            algo_tag: config.algo_tag.clone(),
            metrics_tag: config.metrics_tag.clone(),
            model_key_mode: config.model_key_mode,
            identity: identity.with_host_userns(config.host_userns),
            cancel: None,
        }
    }

    /// Checked before every stage. A call already running inside the engine
    /// only stops if the engine was given the same flag.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default(), RunIdentity::current())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_secs: f64,
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub sandbox: SandboxLayout,
    pub model_keys: Vec<String>,
    pub train_score: f64,
    pub test_score: f64,
    pub stages: Vec<StageTiming>,
}

#[derive(Debug, Clone)]
struct ResolvedInputs {
    algo_dir: PathBuf,
    train_opener_file: PathBuf,
    test_opener_file: PathBuf,
    metrics_dir: PathBuf,
    train_data_dir: Option<PathBuf>,
    test_data_dir: Option<PathBuf>,
}

/// One side of the workflow: where its data, opener and predictions live.
struct Phase<'a> {
    pred_dir: &'a Path,
    opener_file: &'a Path,
    data_dir: Option<&'a Path>,
}

pub struct Pipeline<E> {
    engine: E,
    options: PipelineOptions,
}

impl<E> Pipeline<E>
where
    E: ImageBuilder + ContainerRunner,
{
    pub fn new(engine: E, options: PipelineOptions) -> Self {
        Self { engine, options }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn options(&self) -> &PipelineOptions {
        &self.options
    }

    pub fn run(&self, inputs: &PipelineInputs) -> Result<PipelineReport, PipelineError> {
        inputs.validate()?;

        let started_at = Utc::now();
        let mut timings = Vec::new();
        let fake = inputs.fake_data_samples;

        let (resolved, layout) = self.stage(&mut timings, Stage::ResolvePaths, || {
            let resolved = resolve_inputs(inputs).map_err(|source| PipelineError::Sandbox {
                stage: Stage::ResolvePaths,
                source,
            })?;
            let layout = SandboxLayout::resolve(&self.options.sandbox_root).map_err(|source| {
                PipelineError::Sandbox {
                    stage: Stage::ResolvePaths,
                    source,
                }
            })?;
            Ok((resolved, layout))
        })?;
        info!(
            sandbox = %layout.compute_root.display(),
            "Run local results will be in sandbox"
        );

        self.stage(&mut timings, Stage::ResetSandbox, || {
            sandbox::reset(&layout).map_err(|source| PipelineError::Sandbox {
                stage: Stage::ResetSandbox,
                source,
            })
        })?;

        // Training
        info!("Training starts");
        let algo_image = self.stage(&mut timings, Stage::BuildAlgo, || {
            self.build(
                Stage::BuildAlgo,
                &resolved.algo_dir,
                &self.options.algo_tag,
                false,
            )
        })?;

        let models = self.stage(&mut timings, Stage::LinkModels, || {
            link_input_models(
                &inputs.inmodels,
                &layout.outmodel_dir,
                self.options.model_key_mode,
            )
            .map_err(|source| PipelineError::Link {
                stage: Stage::LinkModels,
                source,
            })
        })?;

        let mut command = train_command(fake, inputs.rank);
        with_model_keys(&mut command, &models);
        match &resolved.train_data_dir {
            Some(dir) => info!("Training algo on {}", dir.display()),
            None => info!("Training algo fake data samples"),
        }

        let mut volumes = Volumes::new();
        volumes.insert(
            layout.outmodel_dir.clone(),
            VolumeBinding::read_write(MOUNT_OUTPUT_MODEL),
        );
        volumes.insert(
            layout.train_pred_dir.clone(),
            VolumeBinding::read_write(MOUNT_PRED),
        );
        volumes.insert(
            layout.local_dir.clone(),
            VolumeBinding::read_write(MOUNT_LOCAL),
        );
        volumes.insert(
            resolved.train_opener_file.clone(),
            VolumeBinding::read_only(MOUNT_OPENER),
        );
        if let Some(dir) = &resolved.train_data_dir {
            volumes.insert(dir.clone(), VolumeBinding::read_only(MOUNT_DATA));
        }

        self.stage(&mut timings, Stage::Train, || {
            self.run_container(Stage::Train, &algo_image, &command, &volumes)
        })?;

        self.stage(&mut timings, Stage::VerifyModel, || {
            if layout.outmodel_file.exists() {
                Ok(())
            } else {
                Err(PipelineError::Artifact {
                    stage: Stage::VerifyModel,
                    source: ArtifactError::ModelMissing {
                        path: layout.outmodel_file.clone(),
                    },
                })
            }
        })?;

        let metrics_image = self.stage(&mut timings, Stage::BuildMetrics, || {
            self.build(
                Stage::BuildMetrics,
                &resolved.metrics_dir,
                &self.options.metrics_tag,
                true,
            )
        })?;

        info!(
            "Evaluating performance - compute metrics with {} predictions against {} labels",
            layout.train_pred_dir.display(),
            describe_data(resolved.train_data_dir.as_deref())
        );
        let train_phase = Phase {
            pred_dir: &layout.train_pred_dir,
            opener_file: &resolved.train_opener_file,
            data_dir: resolved.train_data_dir.as_deref(),
        };
        let train_score = self.stage(&mut timings, Stage::EvaluateTrain, || {
            self.evaluate(Stage::EvaluateTrain, &metrics_image, &train_phase, fake)
        })?;
        info!(
            score = train_score,
            "Successfully train model {} with a score of {} on train data",
            layout.outmodel_file.display(),
            train_score
        );

        // Testing
        info!("Testing starts");
        // The metrics tag is rebuilt from the *algorithm* directory here and
        // then rebuilt from the metrics directory before evaluation. This
        // sequence is kept as-is until the intent of the first build is known;
        // `pipeline_spec::build_sequence_is_preserved` pins it.
        self.stage(&mut timings, Stage::BuildTestImage, || {
            self.build(
                Stage::BuildTestImage,
                &resolved.algo_dir,
                &self.options.metrics_tag,
                false,
            )
        })?;

        info!(
            "Testing model on {} labels with {} saved in {}",
            describe_data(resolved.test_data_dir.as_deref()),
            sandbox::MODEL_FILENAME,
            layout.test_pred_dir.display()
        );
        let mut volumes = Volumes::new();
        volumes.insert(
            layout.outmodel_dir.clone(),
            VolumeBinding::read_write(MOUNT_OUTPUT_MODEL),
        );
        volumes.insert(
            layout.test_pred_dir.clone(),
            VolumeBinding::read_write(MOUNT_PRED),
        );
        volumes.insert(
            resolved.test_opener_file.clone(),
            VolumeBinding::read_only(MOUNT_OPENER),
        );
        if let Some(dir) = &resolved.test_data_dir {
            volumes.insert(dir.clone(), VolumeBinding::read_only(MOUNT_DATA));
        }
        let command = predict_command(fake);
        self.stage(&mut timings, Stage::Test, || {
            self.run_container(Stage::Test, &algo_image, &command, &volumes)
        })?;

        let metrics_image = self.stage(&mut timings, Stage::RebuildMetrics, || {
            self.build(
                Stage::RebuildMetrics,
                &resolved.metrics_dir,
                &self.options.metrics_tag,
                false,
            )
        })?;

        info!(
            "Evaluating performance - compute metric with {} predictions against {} labels",
            layout.test_pred_dir.display(),
            describe_data(resolved.test_data_dir.as_deref())
        );
        let test_phase = Phase {
            pred_dir: &layout.test_pred_dir,
            opener_file: &resolved.test_opener_file,
            data_dir: resolved.test_data_dir.as_deref(),
        };
        let test_score = self.stage(&mut timings, Stage::EvaluateTest, || {
            self.evaluate(Stage::EvaluateTest, &metrics_image, &test_phase, fake)
        })?;
        info!(
            score = test_score,
            "Successfully test model {} with a score of {} on test data",
            layout.outmodel_file.display(),
            test_score
        );

        Ok(PipelineReport {
            started_at,
            sandbox: layout,
            model_keys: models.into_iter().map(|model| model.key).collect(),
            train_score,
            test_score,
            stages: timings,
        })
    }

    fn stage<T, F>(
        &self,
        timings: &mut Vec<StageTiming>,
        stage: Stage,
        body: F,
    ) -> Result<T, PipelineError>
    where
        F: FnOnce() -> Result<T, PipelineError>,
    {
        if self.cancelled() {
            return Err(PipelineError::Cancelled { stage });
        }

        info!(%stage, "stage.start");
        let start = Instant::now();
        let value = body()?;
        let elapsed = start.elapsed().as_secs_f64();
        info!(%stage, duration = %format!("{:.2} s", elapsed), "stage.done");

        timings.push(StageTiming {
            stage,
            duration_secs: elapsed,
        });
        Ok(value)
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn build(
        &self,
        stage: Stage,
        source_dir: &Path,
        tag: &str,
        remove_intermediate: bool,
    ) -> Result<ImageHandle, PipelineError> {
        self.engine
            .build(source_dir, tag, remove_intermediate)
            .map_err(|source| PipelineError::Build { stage, source })
    }

    fn run_container(
        &self,
        stage: Stage,
        image: &ImageHandle,
        command: &CommandSpec,
        volumes: &Volumes,
    ) -> Result<(), PipelineError> {
        self.engine
            .run(image, command, volumes, &self.options.identity)
            .map_err(|source: EngineError| PipelineError::Run { stage, source })
    }

    fn evaluate(
        &self,
        stage: Stage,
        metrics_image: &ImageHandle,
        phase: &Phase<'_>,
        fake_data_samples: bool,
    ) -> Result<f64, PipelineError> {
        let mut volumes = Volumes::new();
        volumes.insert(
            phase.pred_dir.to_path_buf(),
            VolumeBinding::read_write(MOUNT_PRED),
        );
        volumes.insert(
            phase.opener_file.to_path_buf(),
            VolumeBinding::read_only(MOUNT_OPENER),
        );
        if let Some(dir) = phase.data_dir {
            volumes.insert(dir.to_path_buf(), VolumeBinding::read_only(MOUNT_DATA));
        }

        let command = metrics_command(fake_data_samples);
        self.run_container(stage, metrics_image, &command, &volumes)?;

        read_performance(phase.pred_dir).map_err(|source| PipelineError::Artifact { stage, source })
    }
}

fn resolve_inputs(inputs: &PipelineInputs) -> Result<ResolvedInputs, SandboxError> {
    let abs = |path: &Path| {
        absolute_path(path).map_err(|source| SandboxError {
            path: path.to_path_buf(),
            source,
        })
    };
    let abs_opt = |path: &Option<PathBuf>| path.as_deref().map(abs).transpose();

    Ok(ResolvedInputs {
        algo_dir: abs(&inputs.algo_dir)?,
        train_opener_file: abs(&inputs.train_opener_file)?,
        test_opener_file: abs(&inputs.test_opener_file)?,
        metrics_dir: abs(&inputs.metrics_dir)?,
        train_data_dir: abs_opt(&inputs.train_data_dir)?,
        test_data_dir: abs_opt(&inputs.test_data_dir)?,
    })
}

fn describe_data(dir: Option<&Path>) -> String {
    dir.map(|dir| dir.display().to_string())
        .unwrap_or_else(|| "fake".to_string())
}
