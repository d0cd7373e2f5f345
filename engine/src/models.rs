//! Input model linking.
//!
//! Each caller-supplied model file is hard-linked into the output-model
//! directory under a derived key, and the keys are handed to the training
//! command so the algorithm can find them under its model mount.
//!
//! By default the key is the SHA-256 of the absolute path *string*. Two
//! different files seen at the same path at different times get the same key,
//! and nothing checks for collisions between distinct paths.
//! [`ModelKeyMode::Content`] hashes the file bytes instead.

use crate::sandbox::absolute_path;
use config_loader::ModelKeyMode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Failed to resolve input model path {}: {source}", .path.display())]
    Resolve { path: PathBuf, source: io::Error },
    #[error("Failed to hash input model {}: {source}", .path.display())]
    Hash { path: PathBuf, source: io::Error },
    #[error(
        "Failed to link input model {} to {}: {source}",
        .source_path.display(),
        .dest.display()
    )]
    Link {
        source_path: PathBuf,
        dest: PathBuf,
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputModelRef {
    pub source: PathBuf,
    pub key: String,
}

/// Derive the link key for an absolute model path.
pub fn model_key(source: &Path, mode: ModelKeyMode) -> Result<String, LinkError> {
    match mode {
        ModelKeyMode::Path => {
            let digest = Sha256::digest(path_bytes(source)?);
            Ok(hex::encode(digest))
        }
        ModelKeyMode::Content => {
            let hash_err = |err| LinkError::Hash {
                path: source.to_path_buf(),
                source: err,
            };
            let mut file = File::open(source).map_err(hash_err)?;
            let mut hasher = Sha256::new();
            io::copy(&mut file, &mut hasher).map_err(hash_err)?;
            Ok(hex::encode(hasher.finalize()))
        }
    }
}

/// Raw bytes of the path; identical to its UTF-8 text when it has one.
#[cfg(unix)]
fn path_bytes(path: &Path) -> Result<&[u8], LinkError> {
    use std::os::unix::ffi::OsStrExt;
    Ok(path.as_os_str().as_bytes())
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Result<&[u8], LinkError> {
    path.to_str()
        .map(str::as_bytes)
        .ok_or_else(|| LinkError::Resolve {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8"),
        })
}

/// Hard-link every input model into `outmodel_dir`, preserving order.
///
/// An empty `inmodels` links nothing. Linking the same path twice fails on
/// the second link since both resolve to the same key.
pub fn link_input_models(
    inmodels: &[PathBuf],
    outmodel_dir: &Path,
    mode: ModelKeyMode,
) -> Result<Vec<InputModelRef>, LinkError> {
    let mut refs = Vec::with_capacity(inmodels.len());

    for inmodel in inmodels {
        let src = absolute_path(inmodel).map_err(|source| LinkError::Resolve {
            path: inmodel.clone(),
            source,
        })?;
        let key = model_key(&src, mode)?;
        let dst = outmodel_dir.join(&key);

        fs::hard_link(&src, &dst).map_err(|source| LinkError::Link {
            source_path: src.clone(),
            dest: dst.clone(),
            source,
        })?;
        info!(
            "Creating model link from {} to {}",
            src.display(),
            dst.display()
        );

        refs.push(InputModelRef { source: src, key });
    }

    Ok(refs)
}
