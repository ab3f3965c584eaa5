//! Export orchestration.
//!
//! An [`ExportPipeline`] runs one job through
//! `Idle → Initializing → Streaming → Draining → {Completed | Failed | Cancelled}`.
//! Frames are pulled from the frame source, composited with the camera
//! overlay and pushed into the [`EncodeQueue`]; a separate pump task feeds
//! the queue's consumer half into the [`EncoderSink`]. The two sides share
//! nothing but the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use recast_common::clock::{us_to_ms, JobClock};
use recast_common::config::PipelineConfig;
use recast_common::error::{RecastError, RecastResult};
use recast_decode_engine::{
    DecoderRegistry, DecodingElementFactory, ElementFactory, FramePool, FrameSource,
    FrameSourceFactory, FrameSourceKind, PoolStats, SourceStats,
};
use recast_project_model::ExportJob;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::pip::{CameraPipRenderer, PipStats};
use crate::queue::{EncodeQueue, QueueEntry, QueueStats};
use crate::sink::EncoderSink;

/// Lifecycle of one export job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    /// Demuxer, decoder and camera setup.
    Initializing,
    /// Decode-ahead, composite and enqueue loop.
    Streaming,
    /// Waiting for the encoder to take the remaining frames.
    Draining,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Initializing)
                | (Initializing, Streaming)
                | (Initializing, Failed)
                | (Streaming, Draining)
                | (Streaming, Failed)
                | (Streaming, Cancelled)
                | (Draining, Completed)
                | (Draining, Failed)
                | (Draining, Cancelled)
        )
    }

    /// Whether a cancel request takes effect in this state.
    pub fn accepts_cancel(self) -> bool {
        matches!(self, Self::Streaming | Self::Draining)
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Streaming => "streaming",
            Self::Draining => "draining",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Terminal result of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Completed,
    Failed,
    /// User-initiated abort; not a failure.
    Cancelled,
}

/// Progress callback for export rendering.
pub type ProgressCallback = Box<dyn Fn(ExportProgress) + Send>;

/// Export progress report.
#[derive(Debug, Clone)]
pub struct ExportProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames produced so far.
    pub frames_rendered: u64,

    /// Total frames to render.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,

    pub state: PipelineState,
}

/// Job telemetry.
#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    pub source_kind: Option<FrameSourceKind>,
    pub total_frames: u64,
    /// Wall-clock start of the run (RFC 3339).
    pub started_at: Option<String>,
    /// Frames pushed into the encode queue.
    pub frames_rendered: u64,
    /// Frames the sink accepted.
    pub frames_written: u64,
    pub elapsed: Duration,
    pub source: Option<SourceStats>,
    pub queue: Option<QueueStats>,
    pub pip: Option<PipStats>,
    pub pool: PoolStats,
}

impl ExportStats {
    /// Average wall time per written frame.
    pub fn ms_per_frame(&self) -> f64 {
        if self.frames_written == 0 {
            return 0.0;
        }
        self.elapsed.as_secs_f64() * 1_000.0 / self.frames_written as f64
    }
}

/// How a job ended.
#[derive(Debug)]
pub struct ExportOutcome {
    pub status: JobStatus,
    pub error: Option<RecastError>,
    pub stats: ExportStats,
}

impl ExportOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == JobStatus::Completed
    }

    /// `Ok` for a completed job; the failure or `Cancelled` otherwise.
    pub fn into_result(self) -> RecastResult<ExportStats> {
        match self.status {
            JobStatus::Completed => Ok(self.stats),
            JobStatus::Cancelled => Err(RecastError::Cancelled),
            JobStatus::Failed => Err(self
                .error
                .unwrap_or_else(|| RecastError::render("export failed"))),
        }
    }
}

/// Requests cancellation of a running export.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Cancel the job. Takes effect once the pipeline is streaming.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Pluggable decoding components.
#[derive(Clone)]
pub struct ExportOptions {
    pub registry: DecoderRegistry,
    /// Elements for the fallback frame path.
    pub elements: Arc<dyn ElementFactory>,
    /// Elements for the camera overlay.
    pub camera_elements: Arc<dyn ElementFactory>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        let registry = DecoderRegistry::with_defaults();
        let elements: Arc<dyn ElementFactory> =
            Arc::new(DecodingElementFactory::new(registry.clone()));
        Self {
            registry,
            camera_elements: elements.clone(),
            elements,
        }
    }
}

/// Runs one export job.
pub struct ExportPipeline {
    job: ExportJob,
    config: PipelineConfig,
    options: ExportOptions,
    state: watch::Sender<PipelineState>,
    cancel_request: CancellationToken,
    stats: Mutex<ExportStats>,
}

impl ExportPipeline {
    pub fn new(job: ExportJob, config: PipelineConfig, options: ExportOptions) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            job,
            config,
            options,
            state,
            cancel_request: CancellationToken::new(),
            stats: Mutex::new(ExportStats::default()),
        }
    }

    pub fn job(&self) -> &ExportJob {
        &self.job
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel_request.clone(),
        }
    }

    pub fn stats(&self) -> ExportStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn update_stats(&self, update: impl FnOnce(&mut ExportStats)) {
        update(&mut self.stats.lock().unwrap_or_else(|p| p.into_inner()));
    }

    fn transition(&self, next: PipelineState) -> RecastResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(RecastError::render(format!(
                "invalid pipeline transition {current} -> {next}"
            )));
        }
        self.state.send_replace(next);
        tracing::debug!(from = %current, to = %next, "Pipeline state");
        Ok(())
    }

    /// Run the job to completion, feeding `sink`.
    pub async fn run(
        &self,
        sink: Box<dyn EncoderSink>,
        progress: Option<ProgressCallback>,
    ) -> ExportOutcome {
        if let Err(e) = self.transition(PipelineState::Initializing) {
            return ExportOutcome {
                status: JobStatus::Failed,
                error: Some(e),
                stats: self.stats(),
            };
        }

        let clock = JobClock::start();
        tracing::info!(
            job = %self.job.name,
            primary = %self.job.primary,
            segments = self.job.trim.len(),
            camera = self.job.camera.enabled,
            started_at = clock.started_wall(),
            "Starting export"
        );
        self.update_stats(|s| s.started_at = Some(clock.started_wall().to_string()));
        let job_cancel = CancellationToken::new();
        let pool = FramePool::new();
        let report = |frames_rendered: u64, total_frames: u64, state: PipelineState| {
            if let Some(cb) = &progress {
                cb(progress_report(
                    frames_rendered,
                    total_frames,
                    clock.elapsed().as_secs_f64(),
                    state,
                ));
            }
        };
        report(0, 0, PipelineState::Initializing);

        let mut session = match self.initialize(&pool, &job_cancel).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(error = %e, "Export initialization failed");
                let _ = self.transition(PipelineState::Failed);
                self.update_stats(|s| {
                    s.elapsed = clock.elapsed();
                    s.pool = pool.stats();
                });
                return ExportOutcome {
                    status: JobStatus::Failed,
                    error: Some(e),
                    stats: self.stats(),
                };
            }
        };
        let total_frames = session.source.total_frames();
        self.update_stats(|s| {
            s.total_frames = total_frames;
            s.source_kind = Some(session.source.kind());
        });

        let queue = EncodeQueue::new(self.config.encode_queue_capacity, job_cancel.child_token());
        let written = Arc::new(AtomicU64::new(0));
        let pump = tokio::spawn(pump(queue.clone(), sink, written.clone()));

        // Cancel requests made before streaming are applied here.
        let _ = self.transition(PipelineState::Streaming);
        if self.cancel_request.is_cancelled() {
            job_cancel.cancel();
        }
        let forward = {
            let request = self.cancel_request.clone();
            let job_cancel = job_cancel.clone();
            tokio::spawn(async move {
                request.cancelled().await;
                tracing::info!("Export cancel requested");
                job_cancel.cancel();
            })
        };
        report(0, total_frames, PipelineState::Streaming);

        let streamed = self
            .stream(&mut session, &queue, |rendered| {
                self.update_stats(|s| s.frames_rendered = rendered);
                report(rendered, total_frames, PipelineState::Streaming);
            })
            .await;

        let result = match streamed {
            Ok(rendered) => {
                let _ = self.transition(PipelineState::Draining);
                report(rendered, total_frames, PipelineState::Draining);
                queue.close();
                join_pump(pump).await
            }
            Err(e) => {
                queue.cancel();
                // A sink failure surfaces here as a cancelled enqueue.
                match join_pump(pump).await {
                    Err(pump_err) if !pump_err.is_cancelled() => Err(pump_err),
                    _ => Err(e),
                }
            }
        };

        let source_stats = session.source.stats();
        let pip_stats = session.pip.as_ref().map(CameraPipRenderer::stats);
        session.source.destroy().await;
        if let Some(pip) = session.pip.as_mut() {
            pip.destroy().await;
        }
        forward.abort();

        let (status, error) = match result {
            Ok(()) => (JobStatus::Completed, None),
            Err(_) if self.cancel_request.is_cancelled() => (JobStatus::Cancelled, None),
            Err(RecastError::Cancelled) => (JobStatus::Cancelled, None),
            Err(e) => (JobStatus::Failed, Some(e)),
        };
        let final_state = match status {
            JobStatus::Completed => PipelineState::Completed,
            JobStatus::Failed => PipelineState::Failed,
            JobStatus::Cancelled => PipelineState::Cancelled,
        };
        let _ = self.transition(final_state);

        let queue_stats = queue.stats();
        self.update_stats(|s| {
            s.frames_written = written.load(Ordering::Relaxed);
            s.elapsed = clock.elapsed();
            s.source = Some(source_stats);
            s.queue = Some(queue_stats.clone());
            s.pip = pip_stats;
            s.pool = pool.stats();
        });
        let stats = self.stats();
        report(stats.frames_rendered, total_frames, final_state);

        match &error {
            Some(e) => tracing::error!(error = %e, frames = stats.frames_written, "Export failed"),
            None => tracing::info!(
                status = ?status,
                frames = stats.frames_written,
                elapsed_ms = stats.elapsed.as_millis() as u64,
                ms_per_frame = stats.ms_per_frame(),
                peak_queue = queue_stats.peak_occupancy,
                bottleneck = ?queue_stats.bottleneck(),
                live_frames = stats.pool.live(),
                "Export finished"
            ),
        }

        ExportOutcome {
            status,
            error,
            stats,
        }
    }

    async fn initialize(
        &self,
        pool: &FramePool,
        job_cancel: &CancellationToken,
    ) -> RecastResult<Session> {
        self.job
            .validate()
            .map_err(|e| RecastError::config(e.to_string()))?;
        self.config.validate()?;

        let factory = FrameSourceFactory::new(self.config.clone(), pool.clone(), job_cancel.clone())
            .with_registry(self.options.registry.clone())
            .with_elements(self.options.elements.clone());
        let mut source = factory.initialize(&self.job.primary, &self.job.trim).await?;

        let pip = if self.job.camera.enabled {
            let mut pip =
                CameraPipRenderer::new(self.job.camera.clone(), &self.config, job_cancel.clone());
            let (width, height) = (source.metadata().width, source.metadata().height);
            if !pip
                .initialize(self.options.camera_elements.as_ref(), width, height)
                .await
            {
                tracing::warn!("Continuing export without camera overlay");
            }
            if job_cancel.is_cancelled() {
                pip.destroy().await;
                source.destroy().await;
                return Err(RecastError::Cancelled);
            }
            Some(pip)
        } else {
            None
        };

        Ok(Session { source, pip })
    }

    /// Pull, composite and enqueue until the source ends. Returns the number
    /// of frames enqueued.
    async fn stream(
        &self,
        session: &mut Session,
        queue: &EncodeQueue<QueueEntry>,
        mut on_frame: impl FnMut(u64),
    ) -> RecastResult<u64> {
        let mut index = 0u64;
        let mut last_timestamp_us: Option<i64> = None;

        while let Some(mut frame) = session.source.next_frame().await? {
            debug_assert!(last_timestamp_us.map_or(true, |last| frame.timestamp_us() > last));
            last_timestamp_us = Some(frame.timestamp_us());

            if let Some(pip) = session.pip.as_mut() {
                let (width, height) = (frame.width(), frame.height());
                let camera_ms = us_to_ms(frame.source_timestamp_us());
                pip.render(frame.image_mut(), width, height, camera_ms).await?;
            }

            queue.enqueue(QueueEntry::new(index, frame)).await?;
            index += 1;
            on_frame(index);
        }
        Ok(index)
    }
}

struct Session {
    source: Box<dyn FrameSource>,
    pip: Option<CameraPipRenderer>,
}

/// Feed queued frames into the sink until the queue is closed and drained.
async fn pump(
    queue: EncodeQueue<QueueEntry>,
    mut sink: Box<dyn EncoderSink>,
    written: Arc<AtomicU64>,
) -> RecastResult<()> {
    let result = async {
        while let Some(entry) = queue.dequeue().await? {
            sink.write_frame(entry).await?;
            written.fetch_add(1, Ordering::Relaxed);
        }
        sink.finish().await
    }
    .await;

    if let Err(e) = &result {
        if !e.is_cancelled() {
            tracing::error!(sink = sink.name(), error = %e, "Encoder sink failed");
        }
        queue.cancel();
    }
    result
}

async fn join_pump(pump: tokio::task::JoinHandle<RecastResult<()>>) -> RecastResult<()> {
    pump.await
        .map_err(|e| RecastError::render(format!("encoder task failed: {e}")))?
}

fn progress_report(
    frames_rendered: u64,
    total_frames: u64,
    elapsed_secs: f64,
    state: PipelineState,
) -> ExportProgress {
    let progress = if total_frames == 0 {
        0.0
    } else {
        (frames_rendered as f64 / total_frames as f64).clamp(0.0, 1.0)
    };

    let eta_secs = if progress > 0.0 {
        (elapsed_secs / progress) - elapsed_secs
    } else {
        0.0
    }
    .max(0.0);

    ExportProgress {
        progress: if state == PipelineState::Completed {
            1.0
        } else {
            progress
        },
        frames_rendered,
        total_frames,
        eta_secs,
        state,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Initializing));
        assert!(Streaming.can_transition_to(Cancelled));
        assert!(Draining.can_transition_to(Cancelled));
        assert!(!Initializing.can_transition_to(Cancelled));
        assert!(!Idle.can_transition_to(Streaming));
        assert!(!Completed.can_transition_to(Failed));
        assert!(Completed.is_terminal());
        assert!(Streaming.accepts_cancel());
        assert!(!Initializing.accepts_cancel());
    }

    #[test]
    fn test_progress_report_eta() {
        let report = progress_report(25, 100, 10.0, PipelineState::Streaming);
        assert!((report.progress - 0.25).abs() < 1e-9);
        assert!((report.eta_secs - 30.0).abs() < 1e-9);

        let report = progress_report(0, 0, 1.0, PipelineState::Initializing);
        assert_eq!(report.progress, 0.0);
        assert_eq!(report.eta_secs, 0.0);

        let report = progress_report(99, 100, 1.0, PipelineState::Completed);
        assert_eq!(report.progress, 1.0);
    }

    #[test]
    fn test_outcome_into_result() {
        let cancelled = ExportOutcome {
            status: JobStatus::Cancelled,
            error: None,
            stats: ExportStats::default(),
        };
        assert!(matches!(cancelled.into_result(), Err(RecastError::Cancelled)));

        let failed = ExportOutcome {
            status: JobStatus::Failed,
            error: Some(RecastError::demux("bad box")),
            stats: ExportStats::default(),
        };
        assert!(matches!(failed.into_result(), Err(RecastError::Demux { .. })));
    }
}
