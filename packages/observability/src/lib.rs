//! # Observability
//!
//! Logging setup for the contact sync binaries.
//!
//! Services call [`init_with_config`] once at startup and use the standard
//! `tracing` macros everywhere else. Events go to:
//!
//! - stderr, compact and human readable (optional)
//! - a JSONL file, one object per event, safe to share between processes
//!   (`tail -f ~/.contact-sync/logs/contact-sync.jsonl | jq`)
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ## Usage
//!
//! ```rust,ignore
//! observability::init_with_config(observability::LogConfig {
//!     service_name: "contact-sync".into(),
//!     default_level: "debug".into(),
//!     log_path: Some(paths.log_file()),
//!     ..Default::default()
//! })?;
//! tracing::info!("ready");
//! ```

mod file;
mod json_layer;

pub use file::JsonlFileWriter;
pub use json_layer::JsonLayer;

use std::io;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Written into every JSONL line.
    pub service_name: String,

    /// Filter used when `RUST_LOG` is unset (e.g. "info", "outbox_sync_worker=debug").
    pub default_level: String,

    /// JSONL file; `None` disables file output.
    pub log_path: Option<PathBuf>,

    pub also_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "contact-sync".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
        }
    }
}

fn env_filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}

/// Install the global subscriber.
///
/// Fails if the log file cannot be opened or a subscriber is already set.
pub fn init_with_config(config: LogConfig) -> io::Result<()> {
    let file_layer = match &config.log_path {
        Some(path) => Some(JsonLayer::new(
            config.service_name.clone(),
            JsonlFileWriter::open(path)?,
        )),
        None => None,
    };

    let stderr_layer = config.also_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .compact()
            .with_writer(io::stderr)
    });

    tracing_subscriber::registry()
        .with(env_filter(&config.default_level))
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(io::Error::other)?;

    tracing::debug!(
        service = %config.service_name,
        log_path = ?config.log_path,
        "Logging initialized"
    );
    Ok(())
}
