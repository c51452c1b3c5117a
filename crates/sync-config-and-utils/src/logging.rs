//! Logging initialization.

use crate::{CoreResult, Paths};
use observability::LogConfig;

/// Install logging for a contact sync process.
///
/// Compact lines go to stderr and JSONL to [`Paths::log_file`]. `RUST_LOG`
/// takes precedence over `level`.
pub fn init_logging(level: &str, paths: &Paths) -> CoreResult<()> {
    paths.ensure_dirs()?;
    observability::init_with_config(LogConfig {
        service_name: "contact-sync".into(),
        default_level: level.into(),
        log_path: Some(paths.log_file()),
        also_stderr: true,
    })?;
    Ok(())
}
