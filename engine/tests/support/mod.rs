#![allow(dead_code)]

use container_exec::{
    CommandSpec, ContainerRunner, EngineError, ImageBuilder, ImageHandle, ProcessFailure,
    RunIdentity, Volumes,
};
use engine::pipeline::{MOUNT_OUTPUT_MODEL, MOUNT_PRED};
use engine::{PipelineInputs, PipelineOptions};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const ALGO_TAG: &str = "algo_run_local";
pub const METRICS_TAG: &str = "metrics_run_local";

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Build {
        source_dir: PathBuf,
        tag: String,
        remove_intermediate: bool,
    },
    Run {
        tag: String,
        command: String,
        volumes: Volumes,
        identity: RunIdentity,
    },
}

/// What the simulated containers do when run.
#[derive(Debug, Clone)]
pub struct Behaviour {
    pub write_model: bool,
    pub perf_json: String,
    pub fail_tag: Option<(String, i32, String)>,
}

impl Default for Behaviour {
    fn default() -> Self {
        Self {
            write_model: true,
            perf_json: r#"{"all": 1.0}"#.to_string(),
            fail_tag: None,
        }
    }
}

/// Stands in for the container engine: records every call and writes the
/// artifacts a well-behaved algorithm and metrics image would.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    pub calls: RefCell<Vec<Call>>,
    pub behaviour: Behaviour,
}

impl RecordingEngine {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            calls: RefCell::new(Vec::new()),
            behaviour,
        }
    }

    pub fn builds(&self) -> Vec<(PathBuf, String, bool)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Build {
                    source_dir,
                    tag,
                    remove_intermediate,
                } => Some((source_dir.clone(), tag.clone(), *remove_intermediate)),
                _ => None,
            })
            .collect()
    }

    pub fn runs(&self) -> Vec<(String, String, Volumes)> {
        self.calls
            .borrow()
            .iter()
            .filter_map(|call| match call {
                Call::Run {
                    tag,
                    command,
                    volumes,
                    ..
                } => Some((tag.clone(), command.clone(), volumes.clone())),
                _ => None,
            })
            .collect()
    }
}

fn host_for(volumes: &Volumes, bind: &str) -> Option<PathBuf> {
    volumes
        .iter()
        .find(|(_, binding)| binding.bind == bind)
        .map(|(host, _)| host.clone())
}

impl ImageBuilder for RecordingEngine {
    fn build(
        &self,
        source_dir: &Path,
        tag: &str,
        remove_intermediate: bool,
    ) -> Result<ImageHandle, EngineError> {
        self.calls.borrow_mut().push(Call::Build {
            source_dir: source_dir.to_path_buf(),
            tag: tag.to_string(),
            remove_intermediate,
        });
        Ok(ImageHandle::new(tag))
    }
}

impl ContainerRunner for RecordingEngine {
    fn run(
        &self,
        image: &ImageHandle,
        command: &CommandSpec,
        volumes: &Volumes,
        identity: &RunIdentity,
    ) -> Result<(), EngineError> {
        self.calls.borrow_mut().push(Call::Run {
            tag: image.tag().to_string(),
            command: command.to_string(),
            volumes: volumes.clone(),
            identity: *identity,
        });

        if let Some((tag, status, stderr)) = &self.behaviour.fail_tag {
            if tag == image.tag() {
                return Err(ProcessFailure {
                    command: command.to_string(),
                    image: tag.clone(),
                    exit_status: *status,
                    stderr: stderr.clone(),
                }
                .into());
            }
        }

        let pred_dir = host_for(volumes, MOUNT_PRED).expect("pred dir mounted");
        match command.args()[0].as_str() {
            "train" => {
                if self.behaviour.write_model {
                    let model_dir = host_for(volumes, MOUNT_OUTPUT_MODEL).expect("model mounted");
                    fs::write(model_dir.join("model"), b"trained").unwrap();
                }
                fs::write(pred_dir.join("pred"), b"train predictions").unwrap();
            }
            "predict" => {
                fs::write(pred_dir.join("pred"), b"test predictions").unwrap();
            }
            "--fake-data-mode" => {
                fs::write(pred_dir.join("perf.json"), &self.behaviour.perf_json).unwrap();
            }
            other => panic!("unexpected command verb {other}"),
        }
        Ok(())
    }
}

/// Scratch workspace with algo/metrics dirs, openers and data dirs.
pub struct Workspace {
    pub temp: TempDir,
}

impl Workspace {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        for dir in ["algo", "metrics", "train", "test", "train_data", "test_data"] {
            fs::create_dir_all(temp.path().join(dir)).unwrap();
        }
        fs::write(temp.path().join("algo/Dockerfile"), "FROM scratch\n").unwrap();
        fs::write(temp.path().join("metrics/Dockerfile"), "FROM scratch\n").unwrap();
        fs::write(temp.path().join("train/opener.py"), "").unwrap();
        fs::write(temp.path().join("test/opener.py"), "").unwrap();
        Self { temp }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.temp.path().join(rel)
    }

    pub fn sandbox(&self) -> PathBuf {
        self.path("sandbox")
    }

    pub fn fake_inputs(&self) -> PipelineInputs {
        PipelineInputs {
            algo_dir: self.path("algo"),
            train_opener_file: self.path("train/opener.py"),
            test_opener_file: self.path("test/opener.py"),
            metrics_dir: self.path("metrics"),
            train_data_dir: None,
            test_data_dir: None,
            rank: None,
            inmodels: vec![],
            fake_data_samples: true,
        }
    }

    pub fn real_inputs(&self) -> PipelineInputs {
        PipelineInputs {
            train_data_dir: Some(self.path("train_data")),
            test_data_dir: Some(self.path("test_data")),
            fake_data_samples: false,
            rank: Some(0),
            ..self.fake_inputs()
        }
    }

    pub fn options(&self) -> PipelineOptions {
        PipelineOptions {
            sandbox_root: self.sandbox(),
            algo_tag: ALGO_TAG.to_string(),
            metrics_tag: METRICS_TAG.to_string(),
            model_key_mode: Default::default(),
            identity: RunIdentity::new(4242),
            cancel: None,
        }
    }
}
