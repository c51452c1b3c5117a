//! Configuration management.

use crate::{CoreError, CoreResult, Paths};
use brevo_client::BrevoClientConfig;
use funnel_sync::FunnelSyncConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Upper bound for `outbox.backoff_unit_secs` (one week).
pub const MAX_BACKOFF_UNIT_SECS: u64 = 7 * 24 * 60 * 60;
/// Upper bound for `outbox.max_job_retries`.
pub const MAX_JOB_RETRIES: u32 = 1_000;
/// Upper bound for `outbox.claim_lease_secs`, `brevo.circuit_open_seconds`
/// and `brevo.overall_deadline_secs` (one day).
pub const MAX_WINDOW_SECS: u64 = 24 * 60 * 60;

/// Outbox worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxSettings {
    /// Jobs claimed per run.
    pub batch_size: usize,
    /// Failed attempts before a job fails for good.
    pub max_job_retries: u32,
    /// The n-th failed attempt waits `n * backoff_unit_secs`.
    pub backoff_unit_secs: u64,
    pub claim_lease_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_job_retries: 5,
            backoff_unit_secs: 300,
            claim_lease_secs: 600,
            poll_interval_secs: 30,
        }
    }
}

impl OutboxSettings {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_secs(self.backoff_unit_secs)
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.claim_lease_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Brevo list per funnel. A list id of 0 turns the funnel off.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FunnelSettings {
    pub language_list_id: i64,
    pub non_language_list_id: i64,
    /// Candidates read per funnel and run.
    pub max_rows_per_type: usize,
}

impl Default for FunnelSettings {
    fn default() -> Self {
        Self {
            language_list_id: 0,
            non_language_list_id: 0,
            max_rows_per_type: 100,
        }
    }
}

/// Main configuration.
///
/// Read from `config.json`; every key is optional. The Brevo API key is
/// never serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// SQLite file; defaults to [`Paths::database_file`].
    pub database_path: Option<PathBuf>,
    pub brevo: BrevoClientConfig,
    pub outbox: OutboxSettings,
    pub funnels: FunnelSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            database_path: None,
            brevo: BrevoClientConfig::default(),
            outbox: OutboxSettings::default(),
            funnels: FunnelSettings::default(),
        }
    }
}

impl Config {
    /// Load `config.json` from `paths` (defaults when absent), then apply
    /// environment overrides.
    pub fn load(paths: &Paths) -> CoreResult<Self> {
        Self::load_path(&paths.config_file())
    }

    /// Same as [`Config::load`] for an explicit file.
    pub fn load_path(path: &Path) -> CoreResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Load configuration from a specific file, without overrides.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Apply `CONTACT_SYNC_LOG_LEVEL`, `BREVO_API_KEY`, `BREVO_BASE_URL` and
    /// `CONTACT_SYNC_DRY_RUN` from `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> CoreResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(level) = lookup("CONTACT_SYNC_LOG_LEVEL") {
            self.log_level = level;
        }
        if let Some(key) = lookup("BREVO_API_KEY") {
            self.brevo.api_key = key.trim().to_string();
        }
        if let Some(url) = lookup("BREVO_BASE_URL") {
            self.brevo.base_url = url;
        }
        if let Some(raw) = lookup("CONTACT_SYNC_DRY_RUN") {
            self.brevo.dry_run = parse_bool(&raw).ok_or_else(|| {
                CoreError::Config(format!("CONTACT_SYNC_DRY_RUN must be true or false, got {raw:?}"))
            })?;
        }
        Ok(())
    }

    /// Database file to open.
    pub fn database_path(&self, paths: &Paths) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| paths.database_file())
    }

    /// Settings for `FunnelSyncService`. Funnel dry runs follow `brevo.dry_run`.
    pub fn funnel_sync_config(&self) -> FunnelSyncConfig {
        FunnelSyncConfig {
            language_list_id: self.funnels.language_list_id,
            non_language_list_id: self.funnels.non_language_list_id,
            dry_run: self.brevo.dry_run,
        }
    }

    /// Get the Brevo base URL as a parsed URL.
    pub fn brevo_base_url(&self) -> CoreResult<Url> {
        Url::parse(&self.brevo.base_url).map_err(CoreError::from)
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        self.brevo_base_url()?;
        if !self.brevo.base_backoff_seconds.is_finite() || self.brevo.base_backoff_seconds < 0.0 {
            return Err(CoreError::Config(
                "brevo.base_backoff_seconds must be a non-negative number".to_string(),
            ));
        }
        if self.outbox.batch_size == 0 {
            return Err(CoreError::Config("outbox.batch_size must be at least 1".to_string()));
        }
        if self.outbox.poll_interval_secs == 0 {
            return Err(CoreError::Config(
                "outbox.poll_interval_secs must be at least 1".to_string(),
            ));
        }
        check_max("outbox.backoff_unit_secs", self.outbox.backoff_unit_secs, MAX_BACKOFF_UNIT_SECS)?;
        check_max(
            "outbox.max_job_retries",
            u64::from(self.outbox.max_job_retries),
            u64::from(MAX_JOB_RETRIES),
        )?;
        check_max("outbox.claim_lease_secs", self.outbox.claim_lease_secs, MAX_WINDOW_SECS)?;
        check_max("brevo.circuit_open_seconds", self.brevo.circuit_open_seconds, MAX_WINDOW_SECS)?;
        if let Some(deadline) = self.brevo.overall_deadline_secs {
            check_max("brevo.overall_deadline_secs", deadline, MAX_WINDOW_SECS)?;
        }
        Ok(())
    }
}

fn check_max(key: &str, value: u64, max: u64) -> CoreResult<()> {
    if value > max {
        return Err(CoreError::Config(format!("{key} must be at most {max}, got {value}")));
    }
    Ok(())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
