//! Camera picture-in-picture renderer.
//!
//! The camera track is read through a [`PrefetchManager`], so sequential
//! output frames find the next camera frame already seeked. Failures while
//! opening the camera, or later while reading it, disable the overlay for the
//! rest of the job instead of failing the export.

use image::RgbaImage;
use recast_common::clock::{ms_to_us, us_to_ms};
use recast_common::config::PipelineConfig;
use recast_common::error::{RecastError, RecastResult};
use recast_decode_engine::{ElementFactory, FramePool, PrefetchManager, PrefetchStats, TrackMetadata};
use recast_project_model::CameraExportConfig;
use tokio_util::sync::CancellationToken;

use crate::compositor::{composite_overlay, fill_center_crop, PipPlacement};

/// Overlay telemetry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipStats {
    pub frames_drawn: u64,
    /// Frames skipped because the camera recording had already ended.
    pub frames_past_end: u64,
    pub prefetch: Option<PrefetchStats>,
}

/// Composites the camera recording into a corner of each output frame.
pub struct CameraPipRenderer {
    config: CameraExportConfig,
    pipeline: PipelineConfig,
    prefetch: Option<PrefetchManager>,
    metadata: Option<TrackMetadata>,
    placement: Option<(u32, u32, PipPlacement)>,
    /// Camera pixels for the current frame; only touched by `render`.
    scratch: RgbaImage,
    pool: FramePool,
    disabled: bool,
    stats: PipStats,
    cancel: CancellationToken,
}

impl CameraPipRenderer {
    pub fn new(config: CameraExportConfig, pipeline: &PipelineConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            pipeline: pipeline.clone(),
            prefetch: None,
            metadata: None,
            placement: None,
            scratch: RgbaImage::new(0, 0),
            pool: FramePool::with_retained(2),
            disabled: false,
            stats: PipStats::default(),
            cancel,
        }
    }

    pub fn config(&self) -> &CameraExportConfig {
        &self.config
    }

    /// Open the camera source and size the scratch canvas.
    ///
    /// Returns `false` (and logs why) when the camera cannot be used; the
    /// export continues without an overlay.
    pub async fn initialize(
        &mut self,
        factory: &dyn ElementFactory,
        canvas_width: u32,
        canvas_height: u32,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }
        match self.open(factory, canvas_width, canvas_height).await {
            Ok(()) => true,
            Err(e) => {
                let e = match e {
                    RecastError::CameraInit { .. } | RecastError::Cancelled => e,
                    other => RecastError::camera_init(other.to_string()),
                };
                tracing::warn!(error = %e, "Camera overlay disabled");
                self.destroy().await;
                false
            }
        }
    }

    async fn open(
        &mut self,
        factory: &dyn ElementFactory,
        canvas_width: u32,
        canvas_height: u32,
    ) -> RecastResult<()> {
        let media = self
            .config
            .source
            .clone()
            .ok_or_else(|| RecastError::camera_init("camera overlay has no source"))?;
        let placement = PipPlacement::compute(&self.config, canvas_width, canvas_height)
            .ok_or_else(|| {
                RecastError::camera_init(format!(
                    "canvas {canvas_width}x{canvas_height} has no room for the overlay"
                ))
            })?;

        let prefetch = PrefetchManager::open(
            factory,
            &media,
            self.pipeline.seek_timeout(),
            self.pipeline.prefetch_hit_target,
            self.cancel.child_token(),
        )
        .await?;
        let metadata = prefetch.metadata().clone();
        if metadata.frame_timestamps.is_empty() {
            let mut prefetch = prefetch;
            prefetch.abort().await;
            return Err(RecastError::camera_init("camera track has no frames"));
        }

        tracing::info!(
            media = %media,
            width = metadata.width,
            height = metadata.height,
            duration_ms = us_to_ms(metadata.duration_us),
            size = placement.size,
            "Camera overlay ready"
        );
        self.scratch = RgbaImage::new(placement.size, placement.size);
        self.placement = Some((canvas_width, canvas_height, placement));
        self.metadata = Some(metadata);
        self.prefetch = Some(prefetch);
        Ok(())
    }

    /// Initialized, enabled and not degraded.
    pub fn is_ready(&self) -> bool {
        self.config.enabled && self.prefetch.is_some() && !self.disabled
    }

    /// Camera recording length in milliseconds; 0 before initialization.
    pub fn duration_ms(&self) -> f64 {
        self.metadata
            .as_ref()
            .map(|m| us_to_ms(m.duration_us))
            .unwrap_or(0.0)
    }

    pub fn stats(&self) -> PipStats {
        PipStats {
            prefetch: self.prefetch.as_ref().map(PrefetchManager::stats),
            ..self.stats.clone()
        }
    }

    /// Draw the camera frame for `time_ms` onto `target`.
    ///
    /// Returns whether anything was drawn. Only cancellation is reported as
    /// an error; read failures disable the overlay.
    pub async fn render(
        &mut self,
        target: &mut RgbaImage,
        canvas_width: u32,
        canvas_height: u32,
        time_ms: f64,
    ) -> RecastResult<bool> {
        if !self.is_ready() {
            return Ok(false);
        }
        let time_us = ms_to_us(time_ms);
        let Some(metadata) = self.metadata.as_ref() else {
            return Ok(false);
        };
        if time_us < 0 || time_us > metadata.duration_us {
            self.stats.frames_past_end += 1;
            return Ok(false);
        }
        let next_hint = time_us + metadata.frame_duration_us();

        let placement = self.placement_for(canvas_width, canvas_height)?;
        let Some(prefetch) = self.prefetch.as_mut() else {
            return Ok(false);
        };
        let camera = match prefetch.frame_at(time_us, Some(next_hint), &self.pool).await {
            Ok(frame) => frame,
            Err(RecastError::Cancelled) => return Err(RecastError::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, time_ms, "Camera read failed, dropping overlay");
                self.disabled = true;
                prefetch.abort().await;
                return Ok(false);
            }
        };

        fill_center_crop(&mut self.scratch, camera.image(), self.config.mirrored);
        drop(camera);
        composite_overlay(target, &self.scratch, &placement);
        self.stats.frames_drawn += 1;
        Ok(true)
    }

    /// Cached placement, recomputed when the canvas size changes.
    fn placement_for(&mut self, canvas_width: u32, canvas_height: u32) -> RecastResult<PipPlacement> {
        if let Some((w, h, placement)) = self.placement {
            if w == canvas_width && h == canvas_height {
                return Ok(placement);
            }
        }
        let placement = PipPlacement::compute(&self.config, canvas_width, canvas_height)
            .ok_or_else(|| RecastError::render("canvas has no room for the camera overlay"))?;
        if self.scratch.width() != placement.size {
            self.scratch = RgbaImage::new(placement.size, placement.size);
        }
        self.placement = Some((canvas_width, canvas_height, placement));
        Ok(placement)
    }

    /// Close the camera elements. Idempotent; safe after a failed init.
    pub async fn destroy(&mut self) {
        if let Some(mut prefetch) = self.prefetch.take() {
            prefetch.abort().await;
            tracing::debug!(
                frames_drawn = self.stats.frames_drawn,
                "Camera overlay destroyed"
            );
        }
        self.scratch = RgbaImage::new(0, 0);
    }
}

#[cfg(test)]
mod tests {
    use image::Rgba;
    use recast_decode_engine::testing::Mp4Builder;
    use recast_decode_engine::DecodingElementFactory;
    use recast_project_model::{MediaRef, PipPosition, PipSize};

    use super::*;

    fn camera_config(source: Option<MediaRef>) -> CameraExportConfig {
        CameraExportConfig {
            enabled: true,
            position: PipPosition::TopLeft,
            size: PipSize::Large,
            border_radius: 0,
            mirrored: false,
            source,
        }
    }

    async fn renderer(frames: u32) -> CameraPipRenderer {
        let media = Mp4Builder::raw_rgb(8, 8, 10).frames(frames).build_media("camera");
        let mut pip = CameraPipRenderer::new(
            camera_config(Some(media)),
            &PipelineConfig::default(),
            CancellationToken::new(),
        );
        assert!(pip.initialize(&DecodingElementFactory::default(), 100, 100).await);
        pip
    }

    #[tokio::test]
    async fn test_draws_camera_into_corner() {
        let mut pip = renderer(10).await;
        assert!(pip.is_ready());
        assert!((pip.duration_ms() - 1000.0).abs() < 1e-6);

        let mut canvas = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        assert!(pip.render(&mut canvas, 100, 100, 0.0).await.unwrap());
        // Large = 30px at (2, 2); the far corner stays untouched.
        assert_ne!(canvas.get_pixel(16, 16).0, [0, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(60, 60).0, [0, 0, 0, 255]);

        for i in 1..10 {
            pip.render(&mut canvas, 100, 100, i as f64 * 100.0).await.unwrap();
        }
        let stats = pip.stats();
        assert_eq!(stats.frames_drawn, 10);
        assert!(stats.prefetch.unwrap().hits >= 8);
        pip.destroy().await;
        pip.destroy().await;
    }

    #[tokio::test]
    async fn test_no_drawing_past_camera_duration() {
        let mut pip = renderer(5).await;
        let mut canvas = RgbaImage::from_pixel(100, 100, Rgba([0, 0, 0, 255]));
        let drawn = pip.render(&mut canvas, 100, 100, 900.0).await.unwrap();
        assert!(!drawn);
        assert!(canvas.pixels().all(|p| p.0 == [0, 0, 0, 255]));
        assert_eq!(pip.stats().frames_past_end, 1);
    }

    #[tokio::test]
    async fn test_missing_source_degrades_to_no_overlay() {
        let mut pip = CameraPipRenderer::new(
            camera_config(Some(MediaRef::file("/nonexistent/recast/camera.mp4"))),
            &PipelineConfig::default(),
            CancellationToken::new(),
        );
        assert!(!pip.initialize(&DecodingElementFactory::default(), 100, 100).await);
        assert!(!pip.is_ready());
        assert_eq!(pip.duration_ms(), 0.0);

        let mut canvas = RgbaImage::new(100, 100);
        assert!(!pip.render(&mut canvas, 100, 100, 0.0).await.unwrap());
        pip.destroy().await;
    }

    #[tokio::test]
    async fn test_disabled_config_is_never_ready() {
        let media = Mp4Builder::raw_rgb(4, 4, 10).frames(2).build_media("camera");
        let mut config = camera_config(Some(media));
        config.enabled = false;
        let mut pip = CameraPipRenderer::new(config, &PipelineConfig::default(), CancellationToken::new());
        assert!(!pip.initialize(&DecodingElementFactory::default(), 100, 100).await);
        assert!(!pip.is_ready());
    }
}
