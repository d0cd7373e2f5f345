//! Sandbox directory tree shared between pipeline stages and containers.

use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const LOCAL_DIR_NAME: &str = "local";
pub const OUTMODEL_DIR_NAME: &str = "model";
pub const TRAIN_PRED_DIR_NAME: &str = "pred_train";
pub const TEST_PRED_DIR_NAME: &str = "pred_test";
pub const MODEL_FILENAME: &str = "model";

#[derive(Debug, Error)]
#[error("Sandbox path {}: {source}", .path.display())]
pub struct SandboxError {
    pub path: PathBuf,
    pub source: io::Error,
}

/// Absolute paths of every directory in the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxLayout {
    pub compute_root: PathBuf,
    pub local_dir: PathBuf,
    pub outmodel_dir: PathBuf,
    pub train_pred_dir: PathBuf,
    pub test_pred_dir: PathBuf,
    pub outmodel_file: PathBuf,
}

impl SandboxLayout {
    /// Lay the sandbox out under `root`, made absolute against the working directory.
    pub fn resolve(root: &Path) -> Result<Self, SandboxError> {
        let compute_root = absolute_path(root).map_err(|source| SandboxError {
            path: root.to_path_buf(),
            source,
        })?;
        Ok(Self::under(compute_root))
    }

    fn under(compute_root: PathBuf) -> Self {
        let outmodel_dir = compute_root.join(OUTMODEL_DIR_NAME);
        Self {
            local_dir: compute_root.join(LOCAL_DIR_NAME),
            train_pred_dir: compute_root.join(TRAIN_PRED_DIR_NAME),
            test_pred_dir: compute_root.join(TEST_PRED_DIR_NAME),
            outmodel_file: outmodel_dir.join(MODEL_FILENAME),
            outmodel_dir,
            compute_root,
        }
    }

    /// Directories in creation order, root first.
    pub fn directories(&self) -> [&Path; 5] {
        [
            &self.compute_root,
            &self.local_dir,
            &self.train_pred_dir,
            &self.test_pred_dir,
            &self.outmodel_dir,
        ]
    }
}

/// Remove the sandbox root and recreate the empty tree.
///
/// A missing root is fine. Any other failure is returned as-is: later stages
/// rely on the tree being exactly what this function leaves behind. A root
/// that is the filesystem root, the working directory or one of its
/// ancestors is refused before anything is removed.
pub fn reset(layout: &SandboxLayout) -> Result<(), SandboxError> {
    let cwd = std::env::current_dir().map_err(|source| SandboxError {
        path: layout.compute_root.clone(),
        source,
    })?;
    ensure_removable(&layout.compute_root, &cwd)?;

    info!(root = %layout.compute_root.display(), "Clean run local sandbox");

    match fs::remove_dir_all(&layout.compute_root) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(SandboxError {
                path: layout.compute_root.clone(),
                source,
            })
        }
    }

    for dir in layout.directories() {
        create_directory(dir)?;
    }
    Ok(())
}

fn ensure_removable(root: &Path, cwd: &Path) -> Result<(), SandboxError> {
    let reason = if root.parent().is_none() {
        "is the filesystem root"
    } else if cwd.starts_with(root) {
        "contains the working directory"
    } else {
        return Ok(());
    };
    Err(SandboxError {
        path: root.to_path_buf(),
        source: io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to clean sandbox root that {reason}"),
        ),
    })
}

fn create_directory(dir: &Path) -> Result<(), SandboxError> {
    if !dir.exists() {
        debug!(path = %dir.display(), "Create path");
    }
    fs::create_dir_all(dir).map_err(|source| SandboxError {
        path: dir.to_path_buf(),
        source,
    })
}

/// Make `path` absolute against the current directory and normalize `.` and
/// `..` lexically. Symlinks are not resolved and the path need not exist.
pub fn absolute_path(path: &Path) -> io::Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            Component::Normal(part) => normalized.push(part),
        }
    }
    Ok(normalized)
}
