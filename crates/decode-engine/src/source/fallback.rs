//! Seek-per-frame source over a pair of playback elements.

use async_trait::async_trait;
use recast_common::config::PipelineConfig;
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::{MediaRef, TrimRange, TrimTimeMapper};
use tokio_util::sync::CancellationToken;

use super::{build_mapper, retained_frames, FrameSource, FrameSourceKind, SourceStats};
use crate::element::ElementFactory;
use crate::frame::{DecodedFrame, FramePool};
use crate::prefetch::PrefetchManager;
use crate::track::TrackMetadata;

/// Walks the retained frame timestamps, seeking for every frame and
/// prefetching the next one on the standby element.
pub struct FallbackFrameSource {
    prefetch: PrefetchManager,
    metadata: TrackMetadata,
    mapper: TrimTimeMapper,
    timestamps: Vec<i64>,
    cursor: usize,
    pool: FramePool,
    stats: SourceStats,
    destroyed: bool,
}

impl FallbackFrameSource {
    pub async fn open(
        elements: &dyn ElementFactory,
        media: &MediaRef,
        trim: &[TrimRange],
        config: &PipelineConfig,
        pool: FramePool,
        cancel: CancellationToken,
    ) -> RecastResult<Self> {
        let mut prefetch = PrefetchManager::open(
            elements,
            media,
            config.seek_timeout(),
            config.prefetch_hit_target,
            cancel,
        )
        .await?;
        let metadata = prefetch.metadata().clone();
        let mapper = match build_mapper(&metadata, trim) {
            Ok(mapper) => mapper,
            Err(e) => {
                prefetch.abort().await;
                return Err(e);
            }
        };
        let timestamps = retained_frames(&metadata, &mapper);

        Ok(Self {
            prefetch,
            metadata,
            mapper,
            timestamps,
            cursor: 0,
            pool,
            stats: SourceStats::new(FrameSourceKind::Fallback),
            destroyed: false,
        })
    }
}

#[async_trait]
impl FrameSource for FallbackFrameSource {
    fn kind(&self) -> FrameSourceKind {
        FrameSourceKind::Fallback
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    fn mapper(&self) -> &TrimTimeMapper {
        &self.mapper
    }

    fn total_frames(&self) -> u64 {
        self.timestamps.len() as u64
    }

    async fn next_frame(&mut self) -> RecastResult<Option<DecodedFrame>> {
        if self.destroyed {
            return Ok(None);
        }
        let Some(&source_us) = self.timestamps.get(self.cursor) else {
            return Ok(None);
        };
        let next = self.timestamps.get(self.cursor + 1).copied();
        let frame = self.prefetch.frame_at(source_us, next, &self.pool).await?;
        let effective_us = self
            .mapper
            .source_to_effective(source_us)
            .map_err(|e| RecastError::trim(e.to_string()))?;
        self.cursor += 1;
        self.stats.frames_delivered += 1;
        Ok(Some(frame.with_timestamp(effective_us)))
    }

    async fn seek(&mut self, effective_us: i64) -> RecastResult<()> {
        let source_us = self
            .mapper
            .effective_to_source(effective_us)
            .map_err(|e| RecastError::trim(e.to_string()))?;
        let floor = self
            .metadata
            .frame_at_or_before(source_us)
            .unwrap_or(source_us);
        self.cursor = self.timestamps.partition_point(|&ts| ts < floor);
        self.stats.seeks += 1;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            prefetch: Some(self.prefetch.stats()),
            ..self.stats.clone()
        }
    }

    async fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.prefetch.abort().await;
        tracing::debug!(
            delivered = self.stats.frames_delivered,
            "Fallback frame source destroyed"
        );
    }
}
