use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("executable not found: {0}")]
    NotFound(PathBuf),
    #[error("cannot inspect {path}: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("not a regular file: {0}")]
    NotAFile(PathBuf),
    #[error("{executable} is not inside bundle {bundle_root}")]
    NotInBundle {
        executable: PathBuf,
        bundle_root: PathBuf,
    },
    #[error("unexpected executable location (wanted <App>.app/Contents/MacOS/<exe>): {0}")]
    UnexpectedLayout(PathBuf),
}

/// The bundle root and the one executable inside it that gets re-signed.
#[derive(Debug, Clone, Serialize)]
pub struct SigningTarget {
    bundle_root: PathBuf,
    executable: PathBuf,
}

impl SigningTarget {
    pub fn new(
        bundle_root: impl Into<PathBuf>,
        executable: impl Into<PathBuf>,
    ) -> Result<Self, TargetError> {
        let bundle_root = bundle_root.into();
        let executable = executable.into();
        let meta = match std::fs::metadata(&executable) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TargetError::NotFound(executable));
            }
            Err(source) => {
                return Err(TargetError::Inaccessible {
                    path: executable,
                    source,
                });
            }
        };
        if !meta.is_file() {
            return Err(TargetError::NotAFile(executable));
        }
        if executable == bundle_root || !executable.starts_with(&bundle_root) {
            return Err(TargetError::NotInBundle {
                executable,
                bundle_root,
            });
        }
        Ok(Self {
            bundle_root,
            executable,
        })
    }

    /// Derives the bundle root from `<App>.app/Contents/MacOS/<exe>`.
    pub fn from_executable(executable: impl Into<PathBuf>) -> Result<Self, TargetError> {
        let executable = executable.into();
        let bundle_root = bundle_root_from_exe(&executable)?;
        Self::new(bundle_root, executable)
    }

    pub fn bundle_root(&self) -> &Path {
        &self.bundle_root
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

pub fn bundle_root_from_exe(exe: &Path) -> Result<PathBuf, TargetError> {
    let macos_dir = exe
        .parent()
        .filter(|p| p.file_name().is_some_and(|n| n == "MacOS"))
        .ok_or_else(|| TargetError::UnexpectedLayout(exe.to_path_buf()))?;
    let contents_dir = macos_dir
        .parent()
        .filter(|p| p.file_name().is_some_and(|n| n == "Contents"))
        .ok_or_else(|| TargetError::UnexpectedLayout(exe.to_path_buf()))?;
    let app_root = contents_dir
        .parent()
        .filter(|p| p.file_name().is_some())
        .ok_or_else(|| TargetError::UnexpectedLayout(exe.to_path_buf()))?;
    Ok(app_root.to_path_buf())
}
