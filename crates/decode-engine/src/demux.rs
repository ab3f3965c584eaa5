//! Video demuxer: encoded chunks in decode order from an MP4/MOV container.

use std::sync::Arc;

use recast_common::error::{RecastError, RecastResult};
use recast_project_model::MediaRef;

use crate::media::{open_media, ByteSource};
use crate::mp4::{read_video_track, Sample, VideoTrack};
use crate::track::{EncodedChunk, SeekPoint, TrackMetadata};

/// Reads the first video track of a container.
///
/// Chunks come out as a lazy, finite sequence starting at the last seek
/// point. Once exhausted the demuxer keeps reporting end of stream until the
/// next seek.
pub struct VideoDemuxer {
    source: Option<Arc<dyn ByteSource>>,
    track: VideoTrack,
    metadata: TrackMetadata,
    /// Presentation index of each sample, in decode order.
    presentation_index: Vec<u64>,
    cursor: usize,
}

impl std::fmt::Debug for VideoDemuxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoDemuxer")
            .field("codec", &self.metadata.codec.codec)
            .field("frames", &self.metadata.frame_count)
            .field("cursor", &self.cursor)
            .field("destroyed", &self.source.is_none())
            .finish()
    }
}

impl VideoDemuxer {
    /// Open `media` and select its first video track.
    pub fn initialize(media: &MediaRef) -> RecastResult<Self> {
        let source = open_media(media)?;
        let demuxer = Self::from_source(source)?;
        tracing::debug!(
            media = %media,
            codec = %demuxer.metadata.codec.codec,
            width = demuxer.metadata.width,
            height = demuxer.metadata.height,
            frames = demuxer.metadata.frame_count,
            "Demuxer initialized"
        );
        Ok(demuxer)
    }

    pub fn from_source(source: Arc<dyn ByteSource>) -> RecastResult<Self> {
        let track = read_video_track(source.as_ref())?;

        let mut order: Vec<usize> = (0..track.samples.len()).collect();
        order.sort_by_key(|&i| track.samples[i].pts_us);
        let mut presentation_index = vec![0u64; track.samples.len()];
        for (rank, &i) in order.iter().enumerate() {
            presentation_index[i] = rank as u64;
        }

        let metadata = build_metadata(&track, &order);
        Ok(Self {
            source: Some(source),
            track,
            metadata,
            presentation_index,
            cursor: 0,
        })
    }

    pub fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    /// Reposition to the keyframe at or before `t_us`.
    ///
    /// A time before the first keyframe lands on the first keyframe.
    pub fn seek_to_keyframe(&mut self, t_us: i64) -> RecastResult<SeekPoint> {
        self.ensure_open()?;

        let samples = &self.track.samples;
        let candidate = samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_keyframe && s.pts_us <= t_us)
            .max_by_key(|(_, s)| s.pts_us)
            .or_else(|| {
                samples
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.is_keyframe)
                    .min_by_key(|(_, s)| s.pts_us)
            })
            .map(|(i, _)| i)
            .unwrap_or(0);

        self.cursor = candidate;
        Ok(SeekPoint {
            timestamp_us: samples[candidate].pts_us,
            decode_index: candidate as u64,
            presentation_index: self.presentation_index[candidate],
        })
    }

    /// Next chunk in decode order, or `None` at end of stream.
    pub fn next_chunk(&mut self) -> RecastResult<Option<EncodedChunk>> {
        let source = self.ensure_open()?;
        let Some(sample) = self.track.samples.get(self.cursor).copied() else {
            return Ok(None);
        };
        let data = source.read_at(sample.offset, sample.size as usize)?;
        let chunk = chunk_from(&sample, data, self.cursor, &self.presentation_index);
        self.cursor += 1;
        Ok(Some(chunk))
    }

    /// Iterate the remaining chunks.
    pub fn chunks(&mut self) -> Chunks<'_> {
        Chunks { demuxer: self }
    }

    /// Release the byte source. Later reads fail.
    pub fn destroy(&mut self) {
        if self.source.take().is_some() {
            tracing::debug!("Demuxer destroyed");
        }
    }

    fn ensure_open(&self) -> RecastResult<Arc<dyn ByteSource>> {
        self.source
            .clone()
            .ok_or_else(|| RecastError::demux("demuxer has been destroyed"))
    }
}

fn chunk_from(
    sample: &Sample,
    data: bytes::Bytes,
    decode_index: usize,
    presentation_index: &[u64],
) -> EncodedChunk {
    EncodedChunk {
        timestamp_us: sample.pts_us,
        duration_us: sample.duration_us,
        is_keyframe: sample.is_keyframe,
        data,
        decode_index: decode_index as u64,
        presentation_index: presentation_index[decode_index],
    }
}

fn build_metadata(track: &VideoTrack, presentation_order: &[usize]) -> TrackMetadata {
    let samples = &track.samples;
    let frame_timestamps: Vec<i64> = presentation_order
        .iter()
        .map(|&i| samples[i].pts_us)
        .collect();
    let mut keyframe_timestamps: Vec<i64> = samples
        .iter()
        .filter(|s| s.is_keyframe)
        .map(|s| s.pts_us)
        .collect();
    keyframe_timestamps.sort_unstable();

    let duration_us = samples
        .iter()
        .map(|s| s.pts_us + s.duration_us)
        .max()
        .unwrap_or(0);
    let frame_count = samples.len() as u64;
    let frame_rate = if duration_us > 0 {
        frame_count as f64 * 1_000_000.0 / duration_us as f64
    } else {
        0.0
    };

    TrackMetadata {
        codec: track.codec.clone(),
        width: track.codec.coded_width,
        height: track.codec.coded_height,
        duration_us,
        frame_rate,
        frame_count,
        keyframe_timestamps,
        frame_timestamps,
    }
}

/// Iterator over the demuxer's remaining chunks.
pub struct Chunks<'a> {
    demuxer: &'a mut VideoDemuxer,
}

impl Iterator for Chunks<'_> {
    type Item = RecastResult<EncodedChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.demuxer.next_chunk().transpose()
    }
}
