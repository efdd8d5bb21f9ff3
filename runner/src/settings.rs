//! Persistent home of the "force reapply" flag.
//!
//! The reconciliation only reads the flag and reports when the obligation is
//! discharged; clearing it is the store's job.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("HOME not set; pass --settings")]
    NoHome,
    #[error("failed to read settings {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse settings {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to write settings {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub trait SettingsStore {
    fn force_reapply(&self) -> Result<bool, SettingsError>;

    fn set_force_reapply(&mut self, value: bool) -> Result<(), SettingsError>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub force_entitlement_reapplication: bool,
    /// Keys written by other tools sharing the file survive a save.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct JsonSettings {
    path: PathBuf,
}

impl JsonSettings {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, SettingsError> {
        let home = std::env::var("HOME").map_err(|_| SettingsError::NoHome)?;
        if home.is_empty() {
            return Err(SettingsError::NoHome);
        }
        Ok(PathBuf::from(home)
            .join("Library")
            .join("Application Support")
            .join("loader-entitlements")
            .join("settings.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Settings, SettingsError> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Settings::default());
            }
            Err(source) => {
                return Err(SettingsError::Read {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_str(&data).map_err(|source| SettingsError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    /// Writes through a sibling temp file and a rename so readers never see a
    /// half-written file.
    pub fn save(&self, settings: &Settings) -> Result<(), SettingsError> {
        let write_err = |source| SettingsError::Write {
            path: self.path.clone(),
            source,
        };
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(write_err)?;
        let text = serde_json::to_string_pretty(settings).map_err(|e| write_err(e.into()))?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
        tmp.write_all(text.as_bytes()).map_err(write_err)?;
        tmp.write_all(b"\n").map_err(write_err)?;
        tmp.persist(&self.path).map_err(|e| write_err(e.error))?;
        Ok(())
    }
}

impl SettingsStore for JsonSettings {
    fn force_reapply(&self) -> Result<bool, SettingsError> {
        Ok(self.load()?.force_entitlement_reapplication)
    }

    fn set_force_reapply(&mut self, value: bool) -> Result<(), SettingsError> {
        let mut settings = self.load()?;
        settings.force_entitlement_reapplication = value;
        self.save(&settings)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    pub force: bool,
}

impl SettingsStore for MemorySettings {
    fn force_reapply(&self) -> Result<bool, SettingsError> {
        Ok(self.force)
    }

    fn set_force_reapply(&mut self, value: bool) -> Result<(), SettingsError> {
        self.force = value;
        Ok(())
    }
}
