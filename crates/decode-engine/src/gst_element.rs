//! GStreamer-backed playback elements.
//!
//! Each element runs a paused `uridecodebin ! videoconvert ! appsink`
//! pipeline and answers seeks with flushing, accurate seeks followed by a
//! preroll pull. Decoding goes through whatever plugins GStreamer has, which
//! covers codecs the built-in decoder registry does not.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use gst::prelude::*;
use gstreamer as gst;
use recast_common::error::{RecastError, RecastResult};
use recast_project_model::MediaRef;
use tokio_util::sync::CancellationToken;

use crate::element::{ElementBackend, ElementFactory, PlaybackElement, ThreadedElement};
use crate::frame::{DecodedFrame, FramePool};
use crate::track::{CodecConfig, TrackMetadata};

/// State changes and prerolls must settle within this window.
const STATE_TIMEOUT_SECS: u64 = 10;

const FALLBACK_FRAME_RATE: f64 = 30.0;

#[derive(Debug, Clone, Copy, Default)]
pub struct GstElementFactory;

#[async_trait]
impl ElementFactory for GstElementFactory {
    fn name(&self) -> &'static str {
        "gstreamer"
    }

    async fn open(
        &self,
        media: &MediaRef,
        cancel: CancellationToken,
    ) -> RecastResult<Box<dyn PlaybackElement>> {
        let path: PathBuf = match media {
            MediaRef::File { path } => path.clone(),
            MediaRef::Memory { .. } => {
                return Err(RecastError::unsupported(
                    "GStreamer elements need a file-backed media reference",
                ))
            }
        };
        if !path.exists() {
            return Err(RecastError::FileNotFound { path });
        }
        let element = ThreadedElement::spawn(
            media.to_string(),
            move || GstElement::open(&path),
            cancel,
        )
        .await?;
        Ok(Box::new(element))
    }
}

fn gst_err(err: impl std::fmt::Display) -> RecastError {
    RecastError::decode(format!("gstreamer: {err}"))
}

struct GstElement {
    pipeline: gst::Pipeline,
    sink: gst::Element,
    metadata: TrackMetadata,
    pool: FramePool,
    current: Option<DecodedFrame>,
}

impl GstElement {
    fn open(path: &Path) -> RecastResult<Self> {
        init_gstreamer()?;

        let uri = gst::glib::filename_to_uri(path, None).map_err(gst_err)?;
        let description = format!(
            "uridecodebin uri={uri} ! videoconvert ! video/x-raw,format=RGBA ! \
             appsink name=sink sync=false"
        );
        let pipeline = gst::parse::launch(&description)
            .map_err(gst_err)?
            .dynamic_cast::<gst::Pipeline>()
            .map_err(|_| gst_err("launch description is not a pipeline"))?;
        let sink = pipeline
            .by_name("sink")
            .ok_or_else(|| gst_err("appsink missing from pipeline"))?;

        pipeline.set_state(gst::State::Paused).map_err(gst_err)?;
        wait_for_preroll(&pipeline)?;

        let sample = pull_preroll(&sink)?;
        let (width, height, frame_rate) = caps_info(&sample)?;
        let duration_us = pipeline
            .query_duration::<gst::ClockTime>()
            .map(|d| d.useconds() as i64)
            .ok_or_else(|| gst_err("stream duration unknown"))?;

        let metadata = frame_grid(width, height, frame_rate, duration_us);
        tracing::debug!(
            path = %path.display(),
            width,
            height,
            frame_rate,
            duration_us,
            "GStreamer element prerolled"
        );

        Ok(Self {
            pipeline,
            sink,
            metadata,
            pool: FramePool::with_retained(2),
            current: None,
        })
    }
}

impl ElementBackend for GstElement {
    fn metadata(&self) -> TrackMetadata {
        self.metadata.clone()
    }

    fn seek(&mut self, source_us: i64) -> RecastResult<i64> {
        let target = self
            .metadata
            .frame_at_or_before(source_us)
            .unwrap_or(0);
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
                gst::ClockTime::from_useconds(target.max(0) as u64),
            )
            .map_err(gst_err)?;
        wait_for_preroll(&self.pipeline)?;

        let sample = pull_preroll(&self.sink)?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| gst_err("preroll sample has no buffer"))?;
        let map = buffer.map_readable().map_err(gst_err)?;

        let mut frame = self.pool.lease(
            self.metadata.width,
            self.metadata.height,
            target,
            self.metadata.frame_duration_us(),
        );
        let dst: &mut [u8] = frame.image_mut();
        if map.as_slice().len() < dst.len() {
            return Err(gst_err(format!(
                "buffer of {} bytes is smaller than a {}x{} RGBA frame",
                map.as_slice().len(),
                self.metadata.width,
                self.metadata.height
            )));
        }
        let len = dst.len();
        dst.copy_from_slice(&map.as_slice()[..len]);
        self.current = Some(frame);
        Ok(target)
    }

    fn capture(&mut self, pool: &FramePool) -> RecastResult<DecodedFrame> {
        let current = self
            .current
            .as_ref()
            .ok_or_else(|| gst_err("capture before seek"))?;
        Ok(pool.lease_copy(
            current.image(),
            current.source_timestamp_us(),
            current.duration_us(),
        ))
    }
}

impl Drop for GstElement {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

fn init_gstreamer() -> RecastResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    GST_INIT
        .get_or_init(|| gst::init().map_err(|e| e.to_string()))
        .clone()
        .map_err(gst_err)
}

fn wait_for_preroll(pipeline: &gst::Pipeline) -> RecastResult<()> {
    let (result, _, _) = pipeline.state(gst::ClockTime::from_seconds(STATE_TIMEOUT_SECS));
    result.map(|_| ()).map_err(gst_err)
}

fn pull_preroll(sink: &gst::Element) -> RecastResult<gst::Sample> {
    sink.emit_by_name::<Option<gst::Sample>>("pull-preroll", &[])
        .ok_or_else(|| gst_err("no preroll sample"))
}

fn caps_info(sample: &gst::Sample) -> RecastResult<(u32, u32, f64)> {
    let caps = sample.caps().ok_or_else(|| gst_err("sample has no caps"))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| gst_err("caps have no structure"))?;
    let width = structure.get::<i32>("width").map_err(gst_err)?;
    let height = structure.get::<i32>("height").map_err(gst_err)?;
    let frame_rate = structure
        .get::<gst::Fraction>("framerate")
        .ok()
        .filter(|f| f.numer() > 0 && f.denom() > 0)
        .map(|f| f.numer() as f64 / f.denom() as f64)
        .unwrap_or(FALLBACK_FRAME_RATE);
    Ok((width.max(0) as u32, height.max(0) as u32, frame_rate))
}

/// Metadata for a constant-rate stream: every frame is seekable.
fn frame_grid(width: u32, height: u32, frame_rate: f64, duration_us: i64) -> TrackMetadata {
    let frame_count = ((duration_us as f64 * frame_rate / 1_000_000.0).floor() as u64).max(1);
    let frame_timestamps: Vec<i64> = (0..frame_count)
        .map(|i| (i as f64 * 1_000_000.0 / frame_rate).round() as i64)
        .collect();
    TrackMetadata {
        codec: CodecConfig {
            codec: "gst".to_string(),
            coded_width: width,
            coded_height: height,
            depth: 32,
            description: None,
        },
        width,
        height,
        duration_us,
        frame_rate,
        frame_count,
        keyframe_timestamps: frame_timestamps.clone(),
        frame_timestamps,
    }
}
