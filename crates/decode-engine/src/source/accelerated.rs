//! Decode-ahead frame source.
//!
//! A spawned task owns the demuxer and the decoder's producer half. It keeps
//! submitting chunks whenever the decoder has spare capacity, independent of
//! how fast the consumer pulls frames, and handles seek commands between
//! submissions. The consumer side filters decoded frames against the trim
//! and maps them onto the effective timeline.

use async_trait::async_trait;
use recast_common::config::PipelineConfig;
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::TrimTimeMapper;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{retained_frames, FrameSource, FrameSourceKind, SourceStats};
use crate::codec::DecoderRegistry;
use crate::decoder::{DecodedFrames, DecoderGate, DecoderOptions, DecoderOutput, VideoDecoderService};
use crate::demux::VideoDemuxer;
use crate::frame::{DecodedFrame, FramePool};
use crate::track::TrackMetadata;

enum Control {
    /// Restart decoding at the keyframe preceding `source_us`.
    Seek {
        source_us: i64,
        ack: oneshot::Sender<RecastResult<u64>>,
    },
}

/// Demuxer + decoder service + reorder buffer, decoding ahead of the consumer.
pub struct AcceleratedFrameSource {
    metadata: TrackMetadata,
    mapper: TrimTimeMapper,
    total_frames: u64,
    frames: Option<DecodedFrames>,
    gate: DecoderGate,
    control: Option<mpsc::UnboundedSender<Control>>,
    task: Option<JoinHandle<()>>,
    /// Frames below this source time precede the last seek target.
    min_source_us: i64,
    last_effective_us: Option<i64>,
    ended: bool,
    stats: SourceStats,
    cancel: CancellationToken,
}

impl AcceleratedFrameSource {
    /// Configure the decoder and start the decode-ahead task.
    pub fn start(
        mut demuxer: VideoDemuxer,
        mapper: TrimTimeMapper,
        registry: &DecoderRegistry,
        config: &PipelineConfig,
        pool: FramePool,
        cancel: CancellationToken,
    ) -> RecastResult<Self> {
        let metadata = demuxer.metadata().clone();
        let (mut service, frames) = VideoDecoderService::configure(
            &metadata.codec,
            DecoderOptions::from_config(config),
            registry,
            pool,
            cancel.clone(),
        )?;

        // Start at the first retained segment rather than the top of the file.
        if let Some(first) = mapper.segments().first() {
            if first.source_start_us > metadata.first_frame_us().unwrap_or(0) {
                let point = demuxer.seek_to_keyframe(first.source_start_us)?;
                service.reset(point.presentation_index)?;
            }
        }

        let total_frames = retained_frames(&metadata, &mapper).len() as u64;
        let gate = service.gate();
        let (control, commands) = mpsc::unbounded_channel();
        let task = tokio::spawn(decode_ahead(demuxer, service, commands, cancel.clone()));

        Ok(Self {
            metadata,
            mapper,
            total_frames,
            frames: Some(frames),
            gate,
            control: Some(control),
            task: Some(task),
            min_source_us: i64::MIN,
            last_effective_us: None,
            ended: false,
            stats: SourceStats::new(FrameSourceKind::Accelerated),
            cancel,
        })
    }

    /// Ask the decode-ahead task to restart at `source_us` and wait for it.
    async fn reposition(&mut self, source_us: i64) -> RecastResult<()> {
        let control = self
            .control
            .as_ref()
            .ok_or_else(|| RecastError::decode("frame source is destroyed"))?;
        let (ack, settled) = oneshot::channel();
        control
            .send(Control::Seek { source_us, ack })
            .map_err(|_| RecastError::decode("decode-ahead task has stopped"))?;
        let generation = tokio::select! {
            result = settled => result
                .map_err(|_| RecastError::decode("decode-ahead task dropped a seek"))??,
            _ = self.cancel.cancelled() => return Err(RecastError::Cancelled),
        };

        self.min_source_us = self
            .metadata
            .frame_at_or_before(source_us)
            .unwrap_or(source_us);
        self.ended = false;
        self.stats.seeks += 1;
        tracing::debug!(source_us, generation, "Decode-ahead repositioned");
        Ok(())
    }

    async fn pull(&mut self) -> RecastResult<Option<DecodedFrame>> {
        loop {
            if self.ended {
                return Ok(None);
            }
            let frames = self
                .frames
                .as_mut()
                .ok_or_else(|| RecastError::decode("frame source is destroyed"))?;
            let frame = match frames.recv().await? {
                Some(DecoderOutput::Frame(frame)) => frame,
                Some(DecoderOutput::Flushed { .. }) | None => {
                    self.ended = true;
                    return Ok(None);
                }
            };

            let source_us = frame.source_timestamp_us();
            if source_us < self.min_source_us {
                self.stats.frames_dropped += 1;
                continue;
            }

            match self.mapper.source_to_effective(source_us) {
                Ok(effective_us) => {
                    if self.last_effective_us.is_some_and(|last| effective_us <= last) {
                        tracing::debug!(source_us, effective_us, "Dropping non-increasing frame");
                        self.stats.frames_dropped += 1;
                        continue;
                    }
                    self.last_effective_us = Some(effective_us);
                    self.stats.frames_delivered += 1;
                    return Ok(Some(frame.with_timestamp(effective_us)));
                }
                Err(_) => {
                    self.stats.frames_dropped += 1;
                    let Some(next_start) = self
                        .mapper
                        .next_segment_after(source_us)
                        .map(|segment| segment.source_start_us)
                    else {
                        // Past the last retained segment.
                        self.ended = true;
                        return Ok(None);
                    };
                    drop(frame);
                    let keyframe = self.metadata.keyframe_at_or_before(next_start);
                    if keyframe.is_some_and(|k| k > source_us) {
                        self.reposition(next_start).await?;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl FrameSource for AcceleratedFrameSource {
    fn kind(&self) -> FrameSourceKind {
        FrameSourceKind::Accelerated
    }

    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    fn mapper(&self) -> &TrimTimeMapper {
        &self.mapper
    }

    fn total_frames(&self) -> u64 {
        self.total_frames
    }

    async fn next_frame(&mut self) -> RecastResult<Option<DecodedFrame>> {
        let result = self.pull().await;
        if result.is_err() {
            // The decoder reports a failure once; later pulls would wait forever.
            self.ended = true;
        }
        result
    }

    async fn seek(&mut self, effective_us: i64) -> RecastResult<()> {
        let source_us = self
            .mapper
            .effective_to_source(effective_us)
            .map_err(|e| RecastError::trim(e.to_string()))?;
        self.reposition(source_us).await?;
        self.last_effective_us = None;
        Ok(())
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            decoder: Some(self.gate.stats()),
            ..self.stats.clone()
        }
    }

    async fn destroy(&mut self) {
        self.control = None;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
            tracing::debug!(
                delivered = self.stats.frames_delivered,
                dropped = self.stats.frames_dropped,
                "Accelerated frame source destroyed"
            );
        }
        // Frames still queued in the channel are released here.
        self.frames = None;
        self.ended = true;
    }
}

impl Drop for AcceleratedFrameSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Keep the decoder fed until cancelled or the control channel closes.
async fn decode_ahead(
    mut demuxer: VideoDemuxer,
    mut service: VideoDecoderService,
    mut commands: mpsc::UnboundedReceiver<Control>,
    cancel: CancellationToken,
) {
    let gate = service.gate();
    // Set once the stream is exhausted or the decoder has failed; a seek
    // clears it.
    let mut halted = false;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(Control::Seek { source_us, ack }) => {
                    let result = demuxer
                        .seek_to_keyframe(source_us)
                        .and_then(|point| service.reset(point.presentation_index));
                    halted = result.is_err();
                    let _ = ack.send(result);
                }
                None => break,
            },
            space = gate.wait_for_space(), if !halted => {
                if space.is_err() {
                    halted = true;
                    continue;
                }
                match demuxer.next_chunk() {
                    Ok(Some(chunk)) => {
                        if service.submit(chunk).is_err() {
                            halted = true;
                        }
                    }
                    Ok(None) => {
                        halted = true;
                        if let Err(e) = service.flush().await {
                            if !e.is_cancelled() {
                                tracing::warn!(error = %e, "Decoder flush failed");
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Demux failed during decode-ahead");
                        service.abort(&e);
                        halted = true;
                    }
                }
            }
        }
    }

    service.close();
    demuxer.destroy();
}
