//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outbox job status.
///
/// `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Success,
    Failed,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Operation carried by an outbox job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Create or update the contact when it enters a funnel.
    UpsertContact,
    /// Update contact attributes after a confirmed purchase.
    UpdateAfterPurchase,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpsertContact => "upsert_contact",
            Self::UpdateAfterPurchase => "update_after_purchase",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upsert_contact" => Some(Self::UpsertContact),
            "update_after_purchase" => Some(Self::UpdateAfterPurchase),
            _ => None,
        }
    }
}

/// Brevo sync outbox job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub subject_id: i64,
    pub operation_type: String,
    pub payload: String,
    pub status: JobStatus,
    pub retry_count: i64,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// New outbox job for insertion.
#[derive(Debug, Clone)]
pub struct NewSyncJob {
    pub subject_id: i64,
    pub operation_type: String,
    pub payload: String,
}

/// What `mark_job_error` did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    /// Still pending, eligible again at `next_attempt_at`.
    RetryScheduled {
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed { retry_count: i64 },
}

/// Number of outbox jobs per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub pending: u64,
    pub success: u64,
    pub failed: u64,
}

/// Funnel type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunnelType {
    Language,
    NonLanguage,
}

impl FunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Language => "language",
            Self::NonLanguage => "non_language",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "language" => Some(Self::Language),
            "non_language" => Some(Self::NonLanguage),
            _ => None,
        }
    }
}

/// Funnel entry - a contact that entered one of the funnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunnelEntry {
    pub id: i64,
    pub email: String,
    pub funnel_type: FunnelType,
    pub user_id: Option<i64>,
    pub test_id: Option<i64>,
    pub certificate_purchased: bool,
    pub certificate_purchased_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// New funnel entry for insertion.
#[derive(Debug, Clone)]
pub struct NewFunnelEntry {
    pub email: String,
    pub funnel_type: FunnelType,
    pub user_id: Option<i64>,
    pub test_id: Option<i64>,
}
