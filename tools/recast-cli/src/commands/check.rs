//! Check decoder capabilities and configuration.

use recast_common::config::{config_file_path, AppConfig};
use recast_decode_engine::DecoderRegistry;

use super::element_factory;

pub fn run(config: &AppConfig) -> anyhow::Result<()> {
    println!("Recast System Check");
    println!("{}", "=".repeat(50));

    let registry = DecoderRegistry::with_defaults();
    let backends = registry.names();
    if backends.is_empty() {
        println!("[WARN] No decoder backends registered; exports use playback elements");
    } else {
        println!("[OK] Decoder backends: {}", backends.join(", "));
    }
    println!("[OK] Playback elements: {}", element_factory(&registry).name());

    let path = config_file_path();
    if path.exists() {
        println!("[OK] Config: {}", path.display());
    } else {
        println!("[--] Config: {} (not found, using defaults)", path.display());
    }

    let p = &config.pipeline;
    println!();
    println!("Pipeline:");
    println!("  Decode path: {:?}", p.decode_path);
    println!(
        "  Decoder queue: {} ({} workers)",
        p.decoder_queue_size, p.decoder_workers
    );
    println!("  Encode queue: {}", p.encode_queue_capacity);
    println!("  Seek timeout: {}ms", p.seek_timeout_ms);

    println!();
    match p.validate() {
        Ok(()) => println!("Configuration is valid. Recast is ready."),
        Err(e) => println!("Configuration problem: {e}"),
    }

    Ok(())
}
