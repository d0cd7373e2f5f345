//! Container engine capabilities used by the local compute pipeline.
//!
//! The pipeline only needs two things from a container engine: build an image
//! from a directory under a fixed tag, and run a tagged image with a command,
//! bind mounts and the caller's identity. Both are modelled as synchronous
//! traits so the coordinator can be driven by [`ContainerCli`] in production
//! and by a recording fake in tests.

mod cli;
mod error;

pub use cli::{ContainerCli, DEFAULT_RUNTIME, RUNTIME_AMBIGUOUS_STATUSES, RUNTIME_ERROR_STATUS};
pub use error::{EngineError, ProcessFailure};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Access mode of a bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MountMode {
    #[serde(rename = "ro")]
    ReadOnly,
    #[serde(rename = "rw")]
    ReadWrite,
}

impl MountMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::ReadOnly => "ro",
            MountMode::ReadWrite => "rw",
        }
    }
}

/// Container-side target of a host path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeBinding {
    pub bind: String,
    pub mode: MountMode,
}

impl VolumeBinding {
    pub fn read_only(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            mode: MountMode::ReadOnly,
        }
    }

    pub fn read_write(bind: impl Into<String>) -> Self {
        Self {
            bind: bind.into(),
            mode: MountMode::ReadWrite,
        }
    }
}

/// Host path -> container binding. Keyed by host path so a path is mounted once.
pub type Volumes = BTreeMap<PathBuf, VolumeBinding>;

/// A built image, addressed by its symbolic tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageHandle {
    tag: String,
}

impl ImageHandle {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl fmt::Display for ImageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)
    }
}

/// Numeric identity the container process runs as.
///
/// Running as the invoking user keeps files written into bind-mounted host
/// directories owned by that user. `host_userns` disables user-namespace
/// remapping so the numeric ids mean the same thing on both sides of the mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub uid: u32,
    pub gid: Option<u32>,
    pub host_userns: bool,
}

impl RunIdentity {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            gid: None,
            host_userns: true,
        }
    }

    /// Identity of the current process.
    pub fn current() -> Self {
        #[cfg(unix)]
        {
            let uid = unsafe { libc::geteuid() };
            let gid = unsafe { libc::getegid() };
            Self {
                uid,
                gid: Some(gid),
                host_userns: true,
            }
        }
        #[cfg(not(unix))]
        {
            Self {
                uid: 65534,
                gid: Some(65534),
                host_userns: true,
            }
        }
    }

    pub fn with_host_userns(mut self, host_userns: bool) -> Self {
        self.host_userns = host_userns;
        self
    }

    /// Value for the runtime's `--user` flag.
    pub fn user_arg(&self) -> String {
        match self.gid {
            Some(gid) => format!("{}:{}", self.uid, gid),
            None => self.uid.to_string(),
        }
    }
}

/// Argument words handed to the image entrypoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(verb: impl Into<String>) -> Self {
        Self {
            args: vec![verb.into()],
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    pub fn extend<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.args.join(" "))
    }
}

/// Builds images from a directory holding a build descriptor.
pub trait ImageBuilder {
    /// Build `source_dir` under `tag`, replacing any image already tagged so.
    fn build(
        &self,
        source_dir: &Path,
        tag: &str,
        remove_intermediate: bool,
    ) -> Result<ImageHandle, EngineError>;
}

/// Runs a tagged image to completion. The container never outlives the call.
pub trait ContainerRunner {
    fn run(
        &self,
        image: &ImageHandle,
        command: &CommandSpec,
        volumes: &Volumes,
        identity: &RunIdentity,
    ) -> Result<(), EngineError>;
}
