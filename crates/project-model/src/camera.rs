//! Camera picture-in-picture export settings.

use serde::{Deserialize, Serialize};

use crate::job::MediaRef;

/// Corner placement for the camera overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PipPosition {
    TopLeft,
    TopRight,
    BottomLeft,
    #[default]
    BottomRight,
}

/// Overlay size preset, relative to canvas width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PipSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl PipSize {
    /// Overlay side length as a fraction of canvas width.
    pub fn width_ratio(self) -> f64 {
        match self {
            PipSize::Small => 0.15,
            PipSize::Medium => 0.22,
            PipSize::Large => 0.30,
        }
    }
}

/// Camera overlay configuration for one export job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraExportConfig {
    /// Whether the overlay is composited at all.
    pub enabled: bool,

    pub position: PipPosition,

    pub size: PipSize,

    /// Corner rounding in percent: 0 is square, 100 is a full circle.
    pub border_radius: u8,

    /// Flip the camera image horizontally.
    pub mirrored: bool,

    /// Camera recording to overlay.
    pub source: Option<MediaRef>,
}

impl Default for CameraExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            position: PipPosition::default(),
            size: PipSize::default(),
            border_radius: 100,
            mirrored: true,
            source: None,
        }
    }
}

impl CameraExportConfig {
    /// Check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        if self.border_radius > 100 {
            return Err(format!(
                "border_radius must be within [0, 100], got {}",
                self.border_radius
            ));
        }
        if self.enabled && self.source.is_none() {
            return Err("camera overlay is enabled but has no source".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_presets() {
        assert!((PipSize::Small.width_ratio() - 0.15).abs() < 1e-9);
        assert!((PipSize::Medium.width_ratio() - 0.22).abs() < 1e-9);
        assert!((PipSize::Large.width_ratio() - 0.30).abs() < 1e-9);
    }

    #[test]
    fn test_config_deserializes_kebab_case_positions() {
        let json = r#"{
            "enabled": true,
            "position": "top-left",
            "size": "large",
            "border_radius": 40,
            "mirrored": false,
            "source": { "kind": "file", "path": "camera.mp4" }
        }"#;
        let config: CameraExportConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.position, PipPosition::TopLeft);
        assert_eq!(config.size, PipSize::Large);
        assert_eq!(config.border_radius, 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_out_of_range_radius() {
        let config = CameraExportConfig {
            border_radius: 150,
            ..CameraExportConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_source_when_enabled() {
        let config = CameraExportConfig {
            enabled: true,
            ..CameraExportConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
