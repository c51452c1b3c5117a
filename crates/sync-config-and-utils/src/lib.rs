//! Configuration, paths and logging setup for contact sync.

mod config;
mod error;
mod logging;
mod paths;

pub use config::{Config, FunnelSettings, OutboxSettings, DEFAULT_LOG_LEVEL};
pub use error::{CoreError, CoreResult};
pub use logging::init_logging;
pub use paths::Paths;
