//! Show track metadata.

use std::path::PathBuf;

use recast_common::clock::us_to_secs;
use recast_common::config::AppConfig;
use recast_decode_engine::{FramePool, FrameSourceFactory};
use recast_project_model::MediaRef;
use tokio_util::sync::CancellationToken;

use super::{element_factory, parse_decode_path};

pub async fn run(
    mut config: AppConfig,
    media: PathBuf,
    decode_path: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    if let Some(path) = decode_path.as_deref() {
        config.pipeline.decode_path = parse_decode_path(path)?;
    }

    let options = super::export_options();
    let factory = FrameSourceFactory::new(config.pipeline, FramePool::new(), CancellationToken::new())
        .with_registry(options.registry.clone())
        .with_elements(element_factory(&options.registry));

    let media = MediaRef::file(media);
    let probe = factory
        .probe(&media)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to probe {media}: {e}"))?;
    let m = &probe.metadata;

    if json {
        let report = serde_json::json!({
            "media": media.to_string(),
            "codec": m.codec.codec,
            "width": m.width,
            "height": m.height,
            "frame_rate": m.frame_rate,
            "frame_count": m.frame_count,
            "keyframes": m.keyframe_timestamps.len(),
            "duration_us": m.duration_us,
            "source": probe.kind,
            "backend": probe.backend,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Media: {media}");
    println!("  Codec: {} ({}x{})", m.codec.codec, m.codec.coded_width, m.codec.coded_height);
    println!("  Display size: {}x{}", m.width, m.height);
    println!("  Frames: {} @ {:.3}fps", m.frame_count, m.frame_rate);
    println!("  Keyframes: {}", m.keyframe_timestamps.len());
    println!("  Duration: {:.3}s", us_to_secs(m.duration_us));
    println!();
    println!("Frame source: {}", probe.kind);
    match probe.backend {
        Some(backend) => println!("  Decoder backend: {backend}"),
        None => println!("  Decoder backend: none (playback elements)"),
    }

    Ok(())
}
