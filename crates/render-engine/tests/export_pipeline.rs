use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use recast_common::config::{DecodePath, PipelineConfig};
use recast_common::error::{RecastError, RecastResult};
use recast_decode_engine::testing::Mp4Builder;
use recast_decode_engine::FrameSourceKind;
use recast_project_model::{CameraExportConfig, ExportJob, MediaRef, PipPosition, PipSize, TrimRange};
use recast_render_engine::{
    EncoderSink, ExportOptions, ExportPipeline, JobStatus, NullSink, PipelineState,
    ProgressCallback, QueueEntry,
};

/// Records (effective, source) timestamps; optionally fails on one frame.
#[derive(Clone, Default)]
struct CaptureSink {
    frames: Arc<Mutex<Vec<(i64, i64)>>>,
    fail_at: Option<u64>,
    finished: Arc<Mutex<bool>>,
}

#[async_trait]
impl EncoderSink for CaptureSink {
    fn name(&self) -> &str {
        "capture"
    }

    async fn write_frame(&mut self, entry: QueueEntry) -> RecastResult<()> {
        if self.fail_at == Some(entry.index) {
            return Err(RecastError::render("disk full"));
        }
        self.frames
            .lock()
            .unwrap()
            .push((entry.timestamp_us, entry.frame.source_timestamp_us()));
        Ok(())
    }

    async fn finish(&mut self) -> RecastResult<()> {
        *self.finished.lock().unwrap() = true;
        Ok(())
    }
}

fn state_recorder() -> (Arc<Mutex<Vec<PipelineState>>>, ProgressCallback) {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let callback: ProgressCallback = Box::new(move |progress| {
        let mut states = sink.lock().unwrap();
        if states.last() != Some(&progress.state) {
            states.push(progress.state);
        }
    });
    (states, callback)
}

fn config(decode_path: DecodePath) -> PipelineConfig {
    PipelineConfig {
        decode_path,
        encode_queue_capacity: 3,
        ..PipelineConfig::default()
    }
}

fn trimmed_job() -> ExportJob {
    let media = Mp4Builder::raw_rgb(8, 6, 25)
        .frames(75)
        .keyframe_interval(10)
        .build_media("screen");
    let mut job = ExportJob::new("trimmed", media);
    job.trim = vec![
        TrimRange {
            start_us: 120_000,
            end_us: 800_000,
        },
        TrimRange {
            start_us: 1_600_000,
            end_us: 2_400_000,
        },
    ];
    job
}

#[tokio::test]
async fn trimmed_export_completes_on_both_paths() {
    for path in [DecodePath::Accelerated, DecodePath::Fallback] {
        let pipeline = ExportPipeline::new(trimmed_job(), config(path), ExportOptions::default());
        let sink = CaptureSink::default();
        let (states, progress) = state_recorder();

        let outcome = pipeline.run(Box::new(sink.clone()), Some(progress)).await;
        assert_eq!(outcome.status, JobStatus::Completed, "{path:?}: {:?}", outcome.error);
        assert_eq!(pipeline.state(), PipelineState::Completed);
        assert_eq!(
            *states.lock().unwrap(),
            vec![
                PipelineState::Initializing,
                PipelineState::Streaming,
                PipelineState::Draining,
                PipelineState::Completed,
            ]
        );

        let frames = sink.frames.lock().unwrap().clone();
        // 17 frames from the first range, 20 from the second.
        assert_eq!(frames.len(), 37);
        assert_eq!(frames[0], (0, 120_000));
        assert_eq!(frames[17], (680_000, 1_600_000));
        assert!(frames.windows(2).all(|w| w[0].0 < w[1].0));
        assert!(*sink.finished.lock().unwrap());

        let stats = outcome.stats;
        assert_eq!(stats.total_frames, 37);
        assert_eq!(stats.frames_written, 37);
        assert!(stats.started_at.is_some());
        let expected_kind = match path {
            DecodePath::Fallback => FrameSourceKind::Fallback,
            _ => FrameSourceKind::Accelerated,
        };
        assert_eq!(stats.source_kind, Some(expected_kind));
        let queue = stats.queue.unwrap();
        assert!(queue.peak_occupancy <= 3);
        assert_eq!(queue.frames_processed, 37);
    }
}

#[tokio::test]
async fn camera_overlay_stops_at_camera_end() {
    let primary = Mp4Builder::raw_rgb(64, 48, 25).frames(50).build_media("screen");
    let camera = Mp4Builder::raw_rgb(8, 8, 10).frames(10).build_media("camera");
    let mut job = ExportJob::new("with camera", primary);
    job.camera = CameraExportConfig {
        enabled: true,
        position: PipPosition::TopLeft,
        size: PipSize::Large,
        border_radius: 0,
        mirrored: false,
        source: Some(camera),
    };

    let pipeline = ExportPipeline::new(job, config(DecodePath::Auto), ExportOptions::default());
    let outcome = pipeline.run(Box::new(NullSink::new()), None).await;
    assert_eq!(outcome.status, JobStatus::Completed, "{:?}", outcome.error);

    let pip = outcome.stats.pip.unwrap();
    // Primary frames at 0..=1s overlap the one second camera recording.
    assert_eq!(pip.frames_drawn, 26);
    assert_eq!(pip.frames_past_end, 24);
    assert!(pip.prefetch.unwrap().hits > 0);
}

#[tokio::test]
async fn broken_camera_does_not_fail_export() {
    let primary = Mp4Builder::raw_rgb(32, 32, 25).frames(10).build_media("screen");
    let mut job = ExportJob::new("broken camera", primary);
    job.camera.enabled = true;
    job.camera.source = Some(MediaRef::memory("camera", vec![0u8; 64]));

    let pipeline = ExportPipeline::new(job, config(DecodePath::Auto), ExportOptions::default());
    let outcome = pipeline.run(Box::new(NullSink::new()), None).await;
    assert_eq!(outcome.status, JobStatus::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.stats.frames_written, 10);
    assert_eq!(outcome.stats.pip.unwrap().frames_drawn, 0);
}

#[tokio::test]
async fn cancel_while_streaming_settles_in_cancelled() {
    let media = Mp4Builder::raw_rgb(8, 6, 25).frames(75).build_media("screen");
    let pipeline = ExportPipeline::new(
        ExportJob::new("cancelled", media),
        config(DecodePath::Accelerated),
        ExportOptions::default(),
    );
    let handle = pipeline.cancel_handle();
    let progress: ProgressCallback = Box::new(move |p| {
        if p.frames_rendered >= 3 {
            handle.cancel();
        }
    });

    let sink = NullSink::with_delay(Duration::from_millis(5));
    let outcome = pipeline.run(Box::new(sink), Some(progress)).await;
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(outcome.error.is_none());
    assert_eq!(pipeline.state(), PipelineState::Cancelled);
    assert!(outcome.stats.frames_written < 75);
    assert!(matches!(outcome.into_result(), Err(RecastError::Cancelled)));
}

#[tokio::test]
async fn cancel_before_run_applies_on_streaming() {
    let media = Mp4Builder::raw_rgb(8, 6, 25).frames(20).build_media("screen");
    let pipeline = ExportPipeline::new(
        ExportJob::new("early cancel", media),
        config(DecodePath::Fallback),
        ExportOptions::default(),
    );
    pipeline.cancel_handle().cancel();
    let (states, progress) = state_recorder();

    let outcome = pipeline.run(Box::new(NullSink::new()), Some(progress)).await;
    assert_eq!(outcome.status, JobStatus::Cancelled);
    let states = states.lock().unwrap().clone();
    assert_eq!(states.first(), Some(&PipelineState::Initializing));
    assert!(states.contains(&PipelineState::Streaming));
    assert_eq!(states.last(), Some(&PipelineState::Cancelled));
}

#[tokio::test]
async fn missing_media_fails_during_initialization() {
    let pipeline = ExportPipeline::new(
        ExportJob::new("missing", MediaRef::file("/nonexistent/recast/screen.mp4")),
        PipelineConfig::default(),
        ExportOptions::default(),
    );
    let mut state = pipeline.subscribe_state();

    let outcome = pipeline.run(Box::new(NullSink::new()), None).await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(outcome.error, Some(RecastError::FileNotFound { .. })));
    assert_eq!(*state.borrow_and_update(), PipelineState::Failed);
}

#[tokio::test]
async fn sink_failure_is_reported_as_failure() {
    let media = Mp4Builder::raw_rgb(8, 6, 25).frames(30).build_media("screen");
    let pipeline = ExportPipeline::new(
        ExportJob::new("sink failure", media),
        config(DecodePath::Accelerated),
        ExportOptions::default(),
    );
    let sink = CaptureSink {
        fail_at: Some(4),
        ..CaptureSink::default()
    };

    let outcome = pipeline.run(Box::new(sink.clone()), None).await;
    assert_eq!(outcome.status, JobStatus::Failed);
    assert!(matches!(outcome.error, Some(RecastError::Render { .. })));
    assert_eq!(sink.frames.lock().unwrap().len(), 4);
    assert!(!*sink.finished.lock().unwrap());
}

#[tokio::test]
async fn pipeline_runs_only_once() {
    let media = Mp4Builder::raw_rgb(8, 6, 25).frames(5).build_media("screen");
    let pipeline = ExportPipeline::new(
        ExportJob::new("once", media),
        PipelineConfig::default(),
        ExportOptions::default(),
    );
    let first = pipeline.run(Box::new(NullSink::new()), None).await;
    assert!(first.is_completed());

    let second = pipeline.run(Box::new(NullSink::new()), None).await;
    assert_eq!(second.status, JobStatus::Failed);
    assert_eq!(pipeline.state(), PipelineState::Completed);
}
