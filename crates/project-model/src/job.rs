//! Export job description and media references.
//!
//! An export job names the primary recording, the optional camera overlay and
//! the retained trim ranges. Jobs are stored as JSON; file references inside a
//! job are resolved relative to the job file.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::camera::CameraExportConfig;
use crate::trim::TrimRange;

/// Where a recorded track lives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaRef {
    /// A media file on disk.
    File { path: PathBuf },

    /// An in-process blob. Never written to job files.
    #[serde(skip)]
    Memory { name: String, data: Bytes },
}

impl MediaRef {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File { path: path.into() }
    }

    pub fn memory(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self::Memory {
            name: name.into(),
            data: data.into(),
        }
    }

    /// Resolve a relative file path against `base`.
    pub fn resolved_against(&self, base: &Path) -> Self {
        match self {
            Self::File { path } if path.is_relative() => Self::File {
                path: base.join(path),
            },
            other => other.clone(),
        }
    }
}

impl fmt::Display for MediaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File { path } => write!(f, "{}", path.display()),
            Self::Memory { name, data } => write!(f, "memory:{name} ({} bytes)", data.len()),
        }
    }
}

/// One export request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    /// Human-readable job name.
    pub name: String,

    /// Screen/window recording.
    pub primary: MediaRef,

    /// Camera overlay settings.
    #[serde(default)]
    pub camera: CameraExportConfig,

    /// Retained source ranges. Empty keeps the whole recording.
    #[serde(default)]
    pub trim: Vec<TrimRange>,
}

impl ExportJob {
    /// Job exporting `primary` untrimmed and without a camera overlay.
    pub fn new(name: impl Into<String>, primary: MediaRef) -> Self {
        Self {
            name: name.into(),
            primary,
            camera: CameraExportConfig::default(),
            trim: vec![],
        }
    }

    /// Load a job file, resolving relative media paths against its directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, JobError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| JobError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut job: ExportJob = serde_json::from_str(&json).map_err(|e| JobError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        job.primary = job.primary.resolved_against(base);
        job.camera.source = job
            .camera
            .source
            .as_ref()
            .map(|source| source.resolved_against(base));

        job.validate()?;
        Ok(job)
    }

    /// Save the job as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), JobError> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).map_err(|e| JobError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        std::fs::write(path, json).map_err(|e| JobError::IoError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Check settings that serde cannot express.
    pub fn validate(&self) -> Result<(), JobError> {
        self.camera
            .validate()
            .map_err(|message| JobError::ValidationError { message })?;
        if let Some(range) = self.trim.iter().find(|r| r.start_us < 0) {
            return Err(JobError::ValidationError {
                message: format!("trim range starts at negative time {}us", range.start_us),
            });
        }
        if let Some(range) = self.trim.iter().find(|r| r.end_us <= r.start_us) {
            return Err(JobError::ValidationError {
                message: format!(
                    "trim range {}us..{}us is empty",
                    range.start_us, range.end_us
                ),
            });
        }
        Ok(())
    }
}

/// Errors that can occur when working with job files.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("I/O error at {path}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid job: {message}")]
    ValidationError { message: String },
}
