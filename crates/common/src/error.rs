//! Error types shared across Recast crates.

use std::path::PathBuf;

/// Top-level error type for Recast operations.
#[derive(Debug, thiserror::Error)]
pub enum RecastError {
    #[error("Demux error: {message}")]
    Demux { message: String },

    #[error("Decode error: {message}")]
    Decode { message: String },

    #[error("Seek to {target_us}us did not settle within {timeout_ms}ms")]
    SeekTimeout { target_us: i64, timeout_ms: u64 },

    #[error("Camera init error: {message}")]
    CameraInit { message: String },

    #[error("Trim error: {message}")]
    Trim { message: String },

    #[error("Render error: {message}")]
    Render { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    /// User-initiated abort. Not a failure; callers report it as its own outcome.
    #[error("Operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using RecastError.
pub type RecastResult<T> = Result<T, RecastError>;

impl RecastError {
    pub fn demux(msg: impl Into<String>) -> Self {
        Self::Demux {
            message: msg.into(),
        }
    }

    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode {
            message: msg.into(),
        }
    }

    pub fn camera_init(msg: impl Into<String>) -> Self {
        Self::CameraInit {
            message: msg.into(),
        }
    }

    pub fn trim(msg: impl Into<String>) -> Self {
        Self::Trim {
            message: msg.into(),
        }
    }

    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    /// Whether this is the cancellation outcome rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seek_timeout_reports_target() {
        let err = RecastError::SeekTimeout {
            target_us: 1_500_000,
            timeout_ms: 5000,
        };
        let msg = err.to_string();
        assert!(msg.contains("1500000us"));
        assert!(msg.contains("5000ms"));
    }

    #[test]
    fn test_cancelled_is_not_a_failure_kind() {
        assert!(RecastError::Cancelled.is_cancelled());
        assert!(!RecastError::decode("boom").is_cancelled());
    }
}
