//! Encoder sinks: consumers of the composited frame stream.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use recast_common::error::{RecastError, RecastResult};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::queue::QueueEntry;

/// Receives composited frames in presentation order.
#[async_trait]
pub trait EncoderSink: Send {
    fn name(&self) -> &str;

    /// Consume one frame. The entry's frame is released when dropped.
    async fn write_frame(&mut self, entry: QueueEntry) -> RecastResult<()>;

    /// Called once after the last frame.
    async fn finish(&mut self) -> RecastResult<()>;
}

/// Writes packed RGBA frames back to back, e.g. into a pipe feeding an
/// external encoder.
pub struct RawVideoSink<W> {
    writer: BufWriter<W>,
    dimensions: Option<(u32, u32)>,
    frames_written: u64,
    bytes_written: u64,
    finished: bool,
}

impl<W: AsyncWrite + Unpin + Send> RawVideoSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            dimensions: None,
            frames_written: 0,
            bytes_written: 0,
            finished: false,
        }
    }

    /// Frame size, fixed by the first frame written.
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.dimensions
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl RawVideoSink<tokio::fs::File> {
    /// Sink writing to a new file at `path`.
    pub async fn create(path: &Path) -> RecastResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(path).await?;
        Ok(Self::new(file))
    }
}

impl RawVideoSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> EncoderSink for RawVideoSink<W> {
    fn name(&self) -> &str {
        "rawvideo"
    }

    async fn write_frame(&mut self, entry: QueueEntry) -> RecastResult<()> {
        if self.finished {
            return Err(RecastError::render("raw video sink already finished"));
        }
        let size = (entry.frame.width(), entry.frame.height());
        match self.dimensions {
            None => self.dimensions = Some(size),
            Some(expected) if expected != size => {
                return Err(RecastError::render(format!(
                    "frame {} is {}x{}, stream is {}x{}",
                    entry.index, size.0, size.1, expected.0, expected.1
                )));
            }
            Some(_) => {}
        }
        let bytes = entry.frame.image().as_raw();
        self.writer.write_all(bytes).await?;
        self.frames_written += 1;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    async fn finish(&mut self) -> RecastResult<()> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        self.writer.flush().await?;
        self.writer.shutdown().await?;
        if let Some((width, height)) = self.dimensions {
            tracing::info!(
                frames = self.frames_written,
                bytes = self.bytes_written,
                width,
                height,
                "Raw video written"
            );
        }
        Ok(())
    }
}

/// Discards frames; counts them and optionally simulates encoder latency.
#[derive(Debug, Default)]
pub struct NullSink {
    delay: Option<Duration>,
    frames: u64,
    last_timestamp_us: Option<i64>,
    finished: bool,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep for `delay` per frame.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn last_timestamp_us(&self) -> Option<i64> {
        self.last_timestamp_us
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

#[async_trait]
impl EncoderSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn write_frame(&mut self, entry: QueueEntry) -> RecastResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.frames += 1;
        self.last_timestamp_us = Some(entry.timestamp_us);
        Ok(())
    }

    async fn finish(&mut self) -> RecastResult<()> {
        self.finished = true;
        Ok(())
    }
}
