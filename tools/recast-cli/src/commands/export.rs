//! Run an export job.

use std::io::Write;
use std::path::{Path, PathBuf};

use recast_common::config::AppConfig;
use recast_project_model::ExportJob;
use recast_render_engine::{
    EncoderSink, ExportPipeline, ExportProgress, JobStatus, NullSink, RawVideoSink,
};

use super::parse_decode_path;

pub async fn run(
    mut config: AppConfig,
    path: PathBuf,
    output: Option<PathBuf>,
    null: bool,
    decode_path: Option<String>,
    queue_size: Option<usize>,
) -> anyhow::Result<()> {
    let job = ExportJob::load(&path).map_err(|e| anyhow::anyhow!("Failed to load job: {e}"))?;

    if let Some(value) = decode_path.as_deref() {
        config.pipeline.decode_path = parse_decode_path(value)?;
    }
    if let Some(size) = queue_size {
        config.pipeline.encode_queue_capacity = size;
    }
    config.pipeline.validate()?;

    let output_path = output.unwrap_or_else(|| default_output(&path));
    let to_stdout = output_path.as_os_str() == "-";
    let sink: Box<dyn EncoderSink> = if null {
        Box::new(NullSink::new())
    } else if to_stdout {
        Box::new(RawVideoSink::stdout())
    } else {
        Box::new(RawVideoSink::create(&output_path).await?)
    };

    eprintln!("Exporting job: {} ({})", job.name, path.display());
    eprintln!("  Primary: {}", job.primary);
    if job.camera.enabled {
        eprintln!(
            "  Camera: {:?} {:?}",
            job.camera.position, job.camera.size
        );
    }
    if !job.trim.is_empty() {
        eprintln!("  Trim: {} range(s)", job.trim.len());
    }
    match (null, to_stdout) {
        (true, _) => eprintln!("  Output: discarded"),
        (false, true) => eprintln!("  Output: stdout (raw RGBA)"),
        (false, false) => eprintln!("  Output: {} (raw RGBA)", output_path.display()),
    }

    let pipeline = ExportPipeline::new(job, config.pipeline, super::export_options());
    let cancel = pipeline.cancel_handle();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\n  Cancelling...");
            cancel.cancel();
        }
    });

    let progress_cb: Box<dyn Fn(ExportProgress) + Send> = Box::new(|p| {
        eprint!(
            "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s, {})  ",
            p.progress * 100.0,
            p.frames_rendered,
            p.total_frames,
            p.eta_secs,
            p.state,
        );
        std::io::stderr().flush().ok();
    });

    let outcome = pipeline.run(sink, Some(progress_cb)).await;
    ctrl_c.abort();
    eprintln!();

    let stats = &outcome.stats;
    match outcome.status {
        JobStatus::Completed => {
            eprintln!(
                "Export complete: {} frames in {:.2}s ({:.2} ms/frame)",
                stats.frames_written,
                stats.elapsed.as_secs_f64(),
                stats.ms_per_frame()
            );
            if let Some(started) = &stats.started_at {
                eprintln!("  Started: {started}");
            }
            if let Some(kind) = stats.source_kind {
                eprintln!("  Frame source: {kind}");
            }
            if let Some(queue) = &stats.queue {
                eprintln!(
                    "  Encode queue: peak {}/{}, {:?}",
                    queue.peak_occupancy,
                    queue.capacity,
                    queue.bottleneck()
                );
            }
            if let Some(pip) = &stats.pip {
                eprintln!("  Camera frames: {}", pip.frames_drawn);
            }
            Ok(())
        }
        JobStatus::Cancelled => {
            eprintln!("Export cancelled after {} frames", stats.frames_written);
            Err(anyhow::anyhow!("export cancelled"))
        }
        JobStatus::Failed => {
            let message = outcome
                .error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string());
            Err(anyhow::anyhow!("Export failed: {message}"))
        }
    }
}

/// `<job dir>/<job file stem>.rgba`
fn default_output(job_path: &Path) -> PathBuf {
    job_path.with_extension("rgba")
}
