//! # Fennec Log Sink
//!
//! A single-writer log-file sink that owns a rotating file, hands every
//! finalized file to a pluggable compression step and keeps old artifacts
//! in check with a retention policy.
//!
//! ## Features
//!
//! - **Path Templates**: `{n}` rotation counter and `{time}` placeholders,
//!   with collision-free fallbacks for fixed paths
//! - **Rotation**: size, interval, hourly and daily policies
//! - **Compression**: `gz`, `bz2`, `zip`, `xz`, `lzma`, `tar`, `tar.gz`,
//!   `tar.bz2`, `tar.xz` or any custom function, validated at start
//! - **Retention**: count and age limits applied after each compression
//! - **Tracing Integration**: [`SharedSink`] plugs into `tracing-subscriber`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fennec_logsink::{FileSink, RotationPolicy, SinkConfig};
//!
//! fn main() -> fennec_logsink::Result<()> {
//!     let config = SinkConfig::new("logs/app.{n}.log")
//!         .with_rotation(RotationPolicy::Size { bytes: 10 * 1024 * 1024 })
//!         .with_compression("gz");
//!
//!     let mut sink = FileSink::start(config)?;
//!     sink.write(b"Application started\n")?;
//!     sink.stop()?;
//!     Ok(())
//! }
//! ```

pub mod compression;
pub mod config;
pub mod path;
pub mod registry;
pub mod retention;
pub mod rotation;
pub mod sink;


pub use compression::{CompressionJob, CompressionJobError, CompressionOption, CompressionTag};
pub use config::{CompressionMode, RetentionPolicy, SinkConfig, SinkOptions};
pub use path::PathTemplate;
pub use registry::{SinkId, SinkRegistry};
pub use rotation::RotationPolicy;
pub use sink::{FileSink, SharedSink, SinkState, SinkStats};

/// Result type for sink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sink-specific errors
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Path error: {message}")]
    Path { message: String },

    #[error(transparent)]
    Compression(#[from] CompressionJobError),

    #[error("Retention policy error: {message}")]
    Retention { message: String },

    #[error("Sink has already been stopped")]
    Stopped,

    #[error("No sink registered with id {0}")]
    UnknownSink(SinkId),
}

impl Error {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub(crate) fn path(message: impl Into<String>) -> Self {
        Error::Path {
            message: message.into(),
        }
    }
}
