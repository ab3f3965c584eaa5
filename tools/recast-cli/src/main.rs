//! Recast CLI — Command-line interface for probing media and exporting jobs.
//!
//! Usage:
//!   recast probe <MEDIA>       Show track metadata and the selected decode path
//!   recast export <JOB>        Run an export job file
//!   recast check               Show decoder backends and configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "recast",
    about = "Export screen recordings with trims and camera overlays",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show track metadata and which frame source an export would use
    Probe {
        /// Path to the media file
        media: PathBuf,

        /// Decode path to evaluate: auto|accelerated|fallback
        #[arg(long)]
        decode_path: Option<String>,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Run an export job
    Export {
        /// Path to the job file
        job: PathBuf,

        /// Raw RGBA output file, or `-` for stdout
        #[arg(short, long, conflicts_with = "null")]
        output: Option<PathBuf>,

        /// Discard frames (throughput measurement)
        #[arg(long)]
        null: bool,

        /// Frame source: auto|accelerated|fallback
        #[arg(long)]
        decode_path: Option<String>,

        /// Encode queue capacity
        #[arg(long)]
        queue_size: Option<usize>,
    },

    /// Show decoder backends, element factory and config location
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = recast_common::config::AppConfig::load();
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    recast_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Probe {
            media,
            decode_path,
            json,
        } => commands::probe::run(config, media, decode_path, json).await,
        Commands::Export {
            job,
            output,
            null,
            decode_path,
            queue_size,
        } => commands::export::run(config, job, output, null, decode_path, queue_size).await,
        Commands::Check => commands::check::run(&config),
    }
}
