//! Brevo client configuration.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Brevo client configuration.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrevoClientConfig {
    /// API key sent in the `api-key` header.
    #[serde(skip_serializing)]
    pub api_key: String,
    /// Base URL of the Brevo API.
    pub base_url: String,
    /// Log requests instead of sending them.
    pub dry_run: bool,
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// First backoff delay; doubles on every further retry.
    pub base_backoff_seconds: f64,
    /// Requests allowed in any trailing 60 second window. 0 disables the limit.
    pub max_requests_per_minute: u32,
    /// Consecutive transient failures that open the circuit. 0 disables it.
    pub circuit_error_threshold: u32,
    /// How long an open circuit rejects calls.
    pub circuit_open_seconds: u64,
    /// Per-request timeout.
    pub request_timeout_secs: u64,
    /// Upper bound on one whole retry sequence.
    pub overall_deadline_secs: Option<u64>,
}

impl Default for BrevoClientConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.brevo.com/v3".to_string(),
            dry_run: false,
            max_retries: 3,
            base_backoff_seconds: 1.0,
            max_requests_per_minute: 300,
            circuit_error_threshold: 5,
            circuit_open_seconds: 60,
            request_timeout_secs: 10,
            overall_deadline_secs: None,
        }
    }
}

impl BrevoClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn circuit_open_duration(&self) -> Duration {
        Duration::from_secs(self.circuit_open_seconds)
    }

    pub fn overall_deadline(&self) -> Option<Duration> {
        self.overall_deadline_secs.map(Duration::from_secs)
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

impl fmt::Debug for BrevoClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrevoClientConfig")
            .field("api_key", &if self.has_api_key() { "<redacted>" } else { "<unset>" })
            .field("base_url", &self.base_url)
            .field("dry_run", &self.dry_run)
            .field("max_retries", &self.max_retries)
            .field("base_backoff_seconds", &self.base_backoff_seconds)
            .field("max_requests_per_minute", &self.max_requests_per_minute)
            .field("circuit_error_threshold", &self.circuit_error_threshold)
            .field("circuit_open_seconds", &self.circuit_open_seconds)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("overall_deadline_secs", &self.overall_deadline_secs)
            .finish()
    }
}
