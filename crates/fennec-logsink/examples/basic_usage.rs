//! Basic log sink usage example
//!
//! This example starts a size-rotated, gzip-compressed sink, plugs it into
//! `tracing-subscriber` and prints what ended up on disk.
//!
//! Run with: cargo run --example basic_usage

use fennec_logsink::{RetentionPolicy, RotationPolicy, SharedSink, SinkConfig};
use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> anyhow::Result<()> {
    let log_dir = PathBuf::from("./example_logs");
    let template = log_dir.join("fennec.{n}.log");

    let config = SinkConfig::new(template.to_string_lossy())
        .with_rotation(RotationPolicy::Size { bytes: 4 * 1024 })
        .with_compression("gz")
        .with_retention(RetentionPolicy {
            max_files: Some(5),
            max_age_days: Some(7),
        })
        .on_compression_error(|e| eprintln!("compression failed: {}", e));

    let sink = SharedSink::start(config)?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(sink.clone()).with_ansi(false))
        .init();

    for i in 0..500 {
        tracing::info!(
            request_id = i,
            user_id = "user123",
            action = "login",
            "Handled request"
        );
    }

    sink.stop()?;
    let stats = sink.stats()?;
    println!(
        "wrote {} bytes across {} rotations, {} files compressed, {} removed by retention",
        stats.bytes_written, stats.rotations, stats.compressions, stats.files_removed
    );

    for entry in std::fs::read_dir(&log_dir)? {
        println!("  {}", entry?.path().display());
    }

    Ok(())
}
