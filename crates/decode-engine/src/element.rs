//! Seekable playback elements used by the prefetching frame path.
//!
//! An element wraps a synchronous seek-and-capture backend that lives on its
//! own OS thread and is driven through a command channel, so slow seeks never
//! block the async runtime.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::MediaRef;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::codec::{DecoderRegistry, FrameDecoder};
use crate::demux::VideoDemuxer;
use crate::frame::{DecodedFrame, FramePool};
use crate::track::TrackMetadata;

/// A media element that can be positioned and asked for its current frame.
#[async_trait]
pub trait PlaybackElement: Send {
    fn metadata(&self) -> &TrackMetadata;

    /// Position on the frame displayed at `source_us`.
    async fn seek(&mut self, source_us: i64) -> RecastResult<()>;

    /// Timestamp of the frame the element currently shows.
    fn current_time_us(&self) -> Option<i64>;

    /// Copy the current frame into a frame leased from `pool`.
    async fn capture_frame(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame>;

    /// Release the element. Idempotent.
    async fn close(&mut self);
}

/// Creates playback elements for a media reference.
#[async_trait]
pub trait ElementFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn open(
        &self,
        media: &MediaRef,
        cancel: CancellationToken,
    ) -> RecastResult<Box<dyn PlaybackElement>>;
}

/// Synchronous backend driven by a [`ThreadedElement`].
pub trait ElementBackend {
    fn metadata(&self) -> TrackMetadata;

    /// Seek to the frame displayed at `source_us`; returns its timestamp.
    fn seek(&mut self, source_us: i64) -> RecastResult<i64>;

    fn capture(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame>;
}

enum Command {
    Seek {
        source_us: i64,
        reply: oneshot::Sender<RecastResult<i64>>,
    },
    Capture {
        pool: FramePool,
        reply: oneshot::Sender<RecastResult<DecodedFrame>>,
    },
}

/// Thread actor around an [`ElementBackend`].
pub struct ThreadedElement {
    name: String,
    metadata: TrackMetadata,
    commands: Option<mpsc::UnboundedSender<Command>>,
    current_us: Option<i64>,
    cancel: CancellationToken,
}

impl ThreadedElement {
    /// Build the backend on a fresh thread and wait until it is ready.
    pub async fn spawn<B, F>(name: String, build: F, cancel: CancellationToken) -> RecastResult<Self>
    where
        B: ElementBackend + 'static,
        F: FnOnce() -> RecastResult<B> + Send + 'static,
    {
        let (commands, mut rx) = mpsc::unbounded_channel::<Command>();
        let (ready_tx, ready_rx) = oneshot::channel();
        let thread_cancel = cancel.clone();

        std::thread::Builder::new()
            .name(format!("recast-element-{name}"))
            .spawn(move || {
                let mut backend = match build() {
                    Ok(backend) => {
                        let _ = ready_tx.send(Ok(backend.metadata()));
                        backend
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while let Some(command) = rx.blocking_recv() {
                    match command {
                        Command::Seek { source_us, reply } => {
                            let result = if thread_cancel.is_cancelled() {
                                Err(RecastError::Cancelled)
                            } else {
                                backend.seek(source_us)
                            };
                            let _ = reply.send(result);
                        }
                        Command::Capture { pool, reply } => {
                            let _ = reply.send(backend.capture(&pool));
                        }
                    }
                }
            })?;

        let metadata = tokio::select! {
            ready = ready_rx => ready
                .map_err(|_| RecastError::decode(format!("element {name} exited during startup")))??,
            _ = cancel.cancelled() => return Err(RecastError::Cancelled),
        };

        Ok(Self {
            name,
            metadata,
            commands: Some(commands),
            current_us: None,
            cancel,
        })
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<RecastResult<T>>) -> Command,
    ) -> RecastResult<T> {
        let commands = self
            .commands
            .as_ref()
            .ok_or_else(|| RecastError::decode(format!("element {} is closed", self.name)))?;
        let (reply, rx) = oneshot::channel();
        commands
            .send(command(reply))
            .map_err(|_| RecastError::decode(format!("element {} has stopped", self.name)))?;
        tokio::select! {
            result = rx => result
                .map_err(|_| RecastError::decode(format!("element {} dropped a request", self.name)))?,
            _ = self.cancel.cancelled() => Err(RecastError::Cancelled),
        }
    }
}

#[async_trait]
impl PlaybackElement for ThreadedElement {
    fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    async fn seek(&mut self, source_us: i64) -> RecastResult<()> {
        self.current_us = None;
        let landed = self
            .request(|reply| Command::Seek { source_us, reply })
            .await?;
        self.current_us = Some(landed);
        Ok(())
    }

    fn current_time_us(&self) -> Option<i64> {
        self.current_us
    }

    async fn capture_frame(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame> {
        let pool = pool.clone();
        self.request(|reply| Command::Capture { pool, reply }).await
    }

    async fn close(&mut self) {
        if self.commands.take().is_some() {
            tracing::debug!(element = %self.name, "Element closed");
        }
    }
}

/// Elements backed by the demuxer and a software decoder.
///
/// Supports exactly the containers and codecs the accelerated frame path
/// does.
#[derive(Debug, Clone)]
pub struct DecodingElementFactory {
    registry: DecoderRegistry,
}

impl DecodingElementFactory {
    pub fn new(registry: DecoderRegistry) -> Self {
        Self { registry }
    }
}

impl Default for DecodingElementFactory {
    fn default() -> Self {
        Self::new(DecoderRegistry::with_defaults())
    }
}

#[async_trait]
impl ElementFactory for DecodingElementFactory {
    fn name(&self) -> &'static str {
        "decoding"
    }

    async fn open(
        &self,
        media: &MediaRef,
        cancel: CancellationToken,
    ) -> RecastResult<Box<dyn PlaybackElement>> {
        let registry = self.registry.clone();
        let target = media.clone();
        let element = ThreadedElement::spawn(
            media.to_string(),
            move || DecodingElement::open(&target, &registry),
            cancel,
        )
        .await?;
        Ok(Box::new(element))
    }
}

/// Demuxer + decoder positioned on one frame.
struct DecodingElement {
    demuxer: VideoDemuxer,
    decoder: Box<dyn FrameDecoder>,
    pool: FramePool,
    /// Last decoded frame; its timestamp is the decode position.
    current: Option<DecodedFrame>,
    /// Pictures the decoder released at end of stream.
    tail: VecDeque<DecodedFrame>,
}

impl DecodingElement {
    fn open(media: &MediaRef, registry: &DecoderRegistry) -> RecastResult<Self> {
        let demuxer = VideoDemuxer::initialize(media)?;
        let codec = &demuxer.metadata().codec;
        let backend: Arc<_> = registry.probe(codec).ok_or_else(|| {
            RecastError::unsupported(format!("no decoder backend for codec '{}'", codec.codec))
        })?;
        let decoder = backend.create(codec)?;
        Ok(Self {
            demuxer,
            decoder,
            pool: FramePool::with_retained(2),
            current: None,
            tail: VecDeque::new(),
        })
    }

    fn decode_until(&mut self, target_us: i64) -> RecastResult<()> {
        loop {
            let frame = match self.tail.pop_front() {
                Some(frame) => frame,
                None => match self.demuxer.next_chunk()? {
                    Some(chunk) => match self.decoder.decode(&chunk, &self.pool)? {
                        Some(picture) => picture.frame,
                        None => continue,
                    },
                    None => {
                        self.tail = self
                            .decoder
                            .flush(&self.pool)?
                            .into_iter()
                            .map(|picture| picture.frame)
                            .collect();
                        if self.tail.is_empty() {
                            return Err(RecastError::decode(format!(
                                "end of stream before frame at {target_us}us"
                            )));
                        }
                        continue;
                    }
                },
            };
            let ts = frame.source_timestamp_us();
            self.current = Some(frame);
            if ts >= target_us {
                return Ok(());
            }
        }
    }
}

impl ElementBackend for DecodingElement {
    fn metadata(&self) -> TrackMetadata {
        self.demuxer.metadata().clone()
    }

    fn seek(&mut self, source_us: i64) -> RecastResult<i64> {
        let metadata = self.demuxer.metadata();
        let target = metadata
            .frame_at_or_before(source_us)
            .or_else(|| metadata.first_frame_us())
            .ok_or_else(|| RecastError::decode("track has no frames"))?;
        let keyframe = metadata.keyframe_at_or_before(target).unwrap_or(target);

        let position = self.current.as_ref().map(|f| f.source_timestamp_us());
        match position {
            Some(p) if p == target => return Ok(target),
            // Same keyframe group and ahead of us: decode forward.
            Some(p) if p < target && keyframe <= p => {}
            _ => {
                self.demuxer.seek_to_keyframe(target)?;
                self.decoder.reset()?;
                self.current = None;
                self.tail.clear();
            }
        }

        self.decode_until(target)?;
        Ok(target)
    }

    fn capture(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| RecastError::decode("capture before seek"))?;
        Ok(pool.lease_copy(
            current.image(),
            current.source_timestamp_us(),
            current.duration_us(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_pixel, Mp4Builder};

    async fn open(builder: &Mp4Builder) -> Box<dyn PlaybackElement> {
        DecodingElementFactory::default()
            .open(&builder.build_media("clip"), CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_seek_and_capture() {
        let builder = Mp4Builder::raw_rgb(4, 4, 10).frames(10).keyframe_interval(3);
        let mut element = open(&builder).await;
        let pool = FramePool::new();

        element.seek(450_000).await.unwrap();
        assert_eq!(element.current_time_us(), Some(400_000));

        let frame = element.capture_frame(&pool).await.unwrap();
        assert_eq!(frame.source_timestamp_us(), 400_000);
        let [r, g, b] = fixture_pixel(4, 2, 1);
        assert_eq!(frame.image().get_pixel(2, 1).0, [r, g, b, 255]);
    }

    #[tokio::test]
    async fn test_backward_seek_restarts_from_keyframe() {
        let builder = Mp4Builder::raw_rgb(2, 2, 10).frames(8).keyframe_interval(4);
        let mut element = open(&builder).await;
        let pool = FramePool::new();

        element.seek(700_000).await.unwrap();
        element.seek(100_000).await.unwrap();
        let frame = element.capture_frame(&pool).await.unwrap();
        assert_eq!(frame.source_timestamp_us(), 100_000);
        let [r, g, b] = fixture_pixel(1, 0, 0);
        assert_eq!(frame.image().get_pixel(0, 0).0, [r, g, b, 255]);
    }

    #[tokio::test]
    async fn test_capture_before_seek_fails() {
        let builder = Mp4Builder::raw_rgb(2, 2, 10).frames(2);
        let mut element = open(&builder).await;
        assert!(element.capture_frame(&FramePool::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_element_rejects_requests() {
        let builder = Mp4Builder::raw_rgb(2, 2, 10).frames(2);
        let mut element = open(&builder).await;
        element.close().await;
        element.close().await;
        assert!(element.seek(0).await.is_err());
    }

    #[tokio::test]
    async fn test_open_fails_for_unsupported_codec() {
        let media = Mp4Builder::raw_rgb(2, 2, 10)
            .frames(1)
            .depth(32)
            .build_media("argb");
        let factory = DecodingElementFactory::new(DecoderRegistry::empty());
        let result = factory.open(&media, CancellationToken::new()).await;
        assert!(matches!(result, Err(RecastError::Unsupported { .. })));
    }
}
