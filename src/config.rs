//! Run configuration and the sequential batch driver.
//!
//! A [`RunConfig`] is built once by the caller and passed by reference to
//! every build; nothing here keeps process-wide state.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
#[cfg(feature = "serde")]
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::extract::SourceFile;
use crate::packer::{build, BuildError};
use crate::targets::{resolve, FirmwareSpec, TargetError, TargetTable};

/// Immutable settings shared by every build in a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Root of the unpacked driver source tree (contains `src/nvidia/generated`).
    pub source_root: PathBuf,
    /// Output root; files land in `<output_dir>/<gpu>/gsp/`.
    pub output_dir: PathBuf,
    /// Firmware revision used in output file names, e.g. `535.113.01`.
    pub revision: String,
}

impl RunConfig {
    /// `<output_dir>/<gpu>/gsp/<stem>-<revision>.bin`.
    #[must_use]
    pub fn output_path(&self, gpu: &str, spec: &FirmwareSpec) -> PathBuf {
        self.output_dir
            .join(gpu)
            .join("gsp")
            .join(format!("{}-{}.bin", spec.stem(), self.revision))
    }
}

/// Errors produced by a batch run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Targets(#[from] TargetError),
    #[error("unknown gpu {0:?}")]
    UnknownGpu(String),
    #[error("revision must be non-empty and contain no path separators: {0:?}")]
    InvalidRevision(String),
    #[error("{gpu} {stem}: {source}")]
    Build {
        gpu: String,
        stem: &'static str,
        #[source]
        source: BuildError,
    },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One file written by [`run`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct OutputRecord {
    pub gpu: String,
    pub kind: &'static str,
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

/// Everything a run produced, in build order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct BuildReport {
    pub revision: String,
    pub outputs: Vec<OutputRecord>,
}

/// Build every firmware file in `table` (restricted to `gpus` if non-empty),
/// one after another. Stops at the first failure.
pub fn run(config: &RunConfig, table: &TargetTable, gpus: &[String]) -> Result<BuildReport, RunError> {
    let revision = &config.revision;
    if revision.is_empty() || revision.contains(['/', '\\']) {
        return Err(RunError::InvalidRevision(revision.clone()));
    }
    table.validate()?;
    if let Some(unknown) = gpus.iter().find(|g| !table.targets.iter().any(|t| &t.gpu == *g)) {
        return Err(RunError::UnknownGpu(unknown.clone()));
    }

    let mut report = BuildReport {
        revision: revision.clone(),
        outputs: Vec::new(),
    };
    for target in table.select(gpus) {
        for spec in &target.firmware {
            let record = build_one(config, &target.gpu, spec)?;
            info!(
                "wrote {} ({} bytes)",
                record.path.display(),
                record.size
            );
            report.outputs.push(record);
        }
    }
    Ok(report)
}

/// Build a single firmware file for `gpu` and write it under the output directory.
pub fn build_one(config: &RunConfig, gpu: &str, spec: &FirmwareSpec) -> Result<OutputRecord, RunError> {
    let naming = resolve(gpu, spec)?;
    let source = SourceFile::new(config.source_root.join(&naming.file));
    let path = config.output_path(gpu, spec);
    debug!("{gpu} {}: reading {}", spec.stem(), source.path().display());

    let build_err = |source| RunError::Build {
        gpu: gpu.to_string(),
        stem: spec.stem(),
        source,
    };
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| RunError::Io { path, source }
    };

    // The output file is only created once the whole image is assembled.
    let mut bytes = Vec::new();
    build(&source, &naming.arrays, &mut bytes).map_err(build_err)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    fs::write(&path, &bytes).map_err(io_err(&path))?;

    Ok(OutputRecord {
        gpu: gpu.to_string(),
        kind: spec.stem(),
        size: bytes.len() as u64,
        sha256: hex(&Sha256::digest(&bytes)),
        path,
    })
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}
