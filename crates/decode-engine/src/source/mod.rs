//! Frame sources: the decoded, trimmed frame stream of one media track.
//!
//! A [`FrameSourceFactory`] picks one implementation per job. The
//! accelerated source drives the demuxer and decoder service ahead of the
//! consumer; the fallback source walks the retained frames through a
//! [`PrefetchManager`](crate::prefetch::PrefetchManager). Both emit frames
//! stamped with effective-timeline timestamps.
//!
//! The fallback path is only as capable as its [`ElementFactory`]. The
//! default [`DecodingElementFactory`] reuses the demuxer and the decoder
//! registry, so it cannot open a container or codec the accelerated path
//! rejected; it differs only in access pattern. Media outside the built-in
//! demuxer and decoders needs the `gstreamer` feature and
//! `GstElementFactory` passed through [`FrameSourceFactory::with_elements`].

use std::sync::Arc;

use async_trait::async_trait;
use recast_common::config::{DecodePath, PipelineConfig};
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::{MediaRef, TrimRange, TrimTimeMapper};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::codec::DecoderRegistry;
use crate::decoder::DecoderStats;
use crate::demux::VideoDemuxer;
use crate::element::{DecodingElementFactory, ElementFactory};
use crate::frame::{DecodedFrame, FramePool};
use crate::prefetch::PrefetchStats;
use crate::track::TrackMetadata;

mod accelerated;
mod fallback;

pub use accelerated::AcceleratedFrameSource;
pub use fallback::FallbackFrameSource;

/// Which implementation backs a [`FrameSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameSourceKind {
    Accelerated,
    Fallback,
}

impl std::fmt::Display for FrameSourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Accelerated => write!(f, "accelerated"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Frame source telemetry.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceStats {
    pub kind: FrameSourceKind,
    pub frames_delivered: u64,
    /// Decoded frames discarded as trimmed or ahead of a seek target.
    pub frames_dropped: u64,
    pub seeks: u64,
    pub decoder: Option<DecoderStats>,
    pub prefetch: Option<PrefetchStats>,
}

impl SourceStats {
    fn new(kind: FrameSourceKind) -> Self {
        Self {
            kind,
            frames_delivered: 0,
            frames_dropped: 0,
            seeks: 0,
            decoder: None,
            prefetch: None,
        }
    }
}

/// Ordered stream of decoded frames on the effective timeline.
#[async_trait]
pub trait FrameSource: Send {
    fn kind(&self) -> FrameSourceKind;

    fn metadata(&self) -> &TrackMetadata;

    fn mapper(&self) -> &TrimTimeMapper;

    /// Frames the source emits when read from the start.
    fn total_frames(&self) -> u64;

    /// Next frame, or `None` at the end of the retained timeline. The
    /// caller owns the returned frame.
    async fn next_frame(&mut self) -> RecastResult<Option<DecodedFrame>>;

    /// Continue from the frame displayed at `effective_us`.
    async fn seek(&mut self, effective_us: i64) -> RecastResult<()>;

    fn stats(&self) -> SourceStats;

    /// Release decoders, elements and buffered frames. Idempotent.
    async fn destroy(&mut self);
}

/// Source timestamps of every frame inside a retained segment.
pub fn retained_frames(metadata: &TrackMetadata, mapper: &TrimTimeMapper) -> Vec<i64> {
    metadata
        .frame_timestamps
        .iter()
        .copied()
        .filter(|&ts| mapper.contains_source(ts))
        .collect()
}

/// Result of probing a media reference.
#[derive(Debug, Clone)]
pub struct SourceProbe {
    pub metadata: TrackMetadata,
    pub kind: FrameSourceKind,
    /// Decoder backend the accelerated path would use.
    pub backend: Option<&'static str>,
}

/// Builds the frame source for a job.
#[derive(Clone)]
pub struct FrameSourceFactory {
    registry: DecoderRegistry,
    elements: Arc<dyn ElementFactory>,
    config: PipelineConfig,
    pool: FramePool,
    cancel: CancellationToken,
}

impl FrameSourceFactory {
    /// Factory with the built-in decoders and decoding elements.
    ///
    /// The fallback path then shares the accelerated path's demuxer and
    /// decoders; see the module docs.
    pub fn new(config: PipelineConfig, pool: FramePool, cancel: CancellationToken) -> Self {
        let registry = DecoderRegistry::with_defaults();
        Self {
            elements: Arc::new(DecodingElementFactory::new(registry.clone())),
            registry,
            config,
            pool,
            cancel,
        }
    }

    pub fn with_registry(mut self, registry: DecoderRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_elements(mut self, elements: Arc<dyn ElementFactory>) -> Self {
        self.elements = elements;
        self
    }

    pub fn registry(&self) -> &DecoderRegistry {
        &self.registry
    }

    pub fn elements(&self) -> &Arc<dyn ElementFactory> {
        &self.elements
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Read track metadata and report which source `initialize` would pick.
    pub async fn probe(&self, media: &MediaRef) -> RecastResult<SourceProbe> {
        match VideoDemuxer::initialize(media) {
            Ok(mut demuxer) => {
                let metadata = demuxer.metadata().clone();
                demuxer.destroy();
                let backend = self.registry.probe(&metadata.codec).map(|b| b.name());
                let kind = match self.config.decode_path {
                    DecodePath::Fallback => FrameSourceKind::Fallback,
                    DecodePath::Accelerated => FrameSourceKind::Accelerated,
                    DecodePath::Auto if backend.is_some() => FrameSourceKind::Accelerated,
                    DecodePath::Auto => FrameSourceKind::Fallback,
                };
                Ok(SourceProbe {
                    metadata,
                    kind,
                    backend,
                })
            }
            Err(e @ RecastError::FileNotFound { .. }) => Err(e),
            Err(e) if self.config.decode_path == DecodePath::Accelerated => Err(e),
            Err(e) => {
                tracing::debug!(media = %media, error = %e, "Demux probe failed, trying elements");
                let mut element = self.elements.open(media, self.cancel.child_token()).await?;
                let metadata = element.metadata().clone();
                element.close().await;
                Ok(SourceProbe {
                    metadata,
                    kind: FrameSourceKind::Fallback,
                    backend: None,
                })
            }
        }
    }

    /// Open the source for `media` with `trim` applied.
    ///
    /// The implementation is chosen here once and never changes for the
    /// lifetime of the returned source.
    pub async fn initialize(
        &self,
        media: &MediaRef,
        trim: &[TrimRange],
    ) -> RecastResult<Box<dyn FrameSource>> {
        let cancel = self.cancel.child_token();
        let source: Box<dyn FrameSource> = match self.config.decode_path {
            DecodePath::Accelerated => {
                let demuxer = VideoDemuxer::initialize(media)?;
                Box::new(self.accelerated(demuxer, trim, cancel)?)
            }
            DecodePath::Fallback => Box::new(self.fallback(media, trim, cancel).await?),
            DecodePath::Auto => match VideoDemuxer::initialize(media) {
                Ok(demuxer) if self.registry.probe(&demuxer.metadata().codec).is_some() => {
                    Box::new(self.accelerated(demuxer, trim, cancel)?)
                }
                Ok(mut demuxer) => {
                    tracing::info!(
                        codec = %demuxer.metadata().codec.codec,
                        "No decoder backend for codec, using fallback frame source"
                    );
                    demuxer.destroy();
                    Box::new(self.fallback(media, trim, cancel).await?)
                }
                Err(e @ RecastError::FileNotFound { .. }) => return Err(e),
                Err(e) => {
                    tracing::info!(error = %e, "Container not demuxable, using fallback frame source");
                    Box::new(self.fallback(media, trim, cancel).await?)
                }
            },
        };

        tracing::info!(
            media = %media,
            kind = %source.kind(),
            codec = %source.metadata().codec.codec,
            width = source.metadata().width,
            height = source.metadata().height,
            frames = source.total_frames(),
            trimmed = source.mapper().is_trimmed(),
            "Frame source initialized"
        );
        Ok(source)
    }

    fn accelerated(
        &self,
        demuxer: VideoDemuxer,
        trim: &[TrimRange],
        cancel: CancellationToken,
    ) -> RecastResult<AcceleratedFrameSource> {
        let mapper = build_mapper(demuxer.metadata(), trim)?;
        AcceleratedFrameSource::start(
            demuxer,
            mapper,
            &self.registry,
            &self.config,
            self.pool.clone(),
            cancel,
        )
    }

    async fn fallback(
        &self,
        media: &MediaRef,
        trim: &[TrimRange],
        cancel: CancellationToken,
    ) -> RecastResult<FallbackFrameSource> {
        FallbackFrameSource::open(
            self.elements.as_ref(),
            media,
            trim,
            &self.config,
            self.pool.clone(),
            cancel,
        )
        .await
    }
}

/// Trim mapping for `metadata`; fails when nothing would be emitted.
pub(crate) fn build_mapper(
    metadata: &TrackMetadata,
    trim: &[TrimRange],
) -> RecastResult<TrimTimeMapper> {
    let mapper = TrimTimeMapper::from_ranges(trim, metadata.duration_us)
        .map_err(|e| RecastError::trim(e.to_string()))?;
    if retained_frames(metadata, &mapper).is_empty() {
        return Err(RecastError::trim("trim ranges retain no frames of the source"));
    }
    Ok(mapper)
}
