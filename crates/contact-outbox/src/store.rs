//! Outbox store backed by the `brevo_sync_outbox` table.

use crate::{OutboxError, OutboxResult};
use chrono::{DateTime, Utc};
use std::time::Duration;
use sync_database::{
    queries, AsyncDatabase, JobDisposition, JobStatusCounts, NewSyncJob, OperationType, SyncJob,
};
use tracing::{debug, info, warn};

/// Outbox store configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delay added per retry: the n-th failed attempt waits `n * backoff_unit`.
    pub backoff_unit: Duration,
    /// How long a claim from `fetch_due` keeps other workers off a job.
    ///
    /// Renewed per job with [`OutboxStore::renew_claim`], so it must exceed
    /// the worst-case time to deliver one job. Once it lapses a crashed
    /// worker's jobs become due again.
    pub claim_lease: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            backoff_unit: Duration::from_secs(5 * 60),
            claim_lease: Duration::from_secs(10 * 60),
        }
    }
}

/// Durable queue of Brevo sync jobs.
///
/// Each store instance claims jobs under its own token, so two stores over
/// the same database file never process the same job concurrently.
#[derive(Clone)]
pub struct OutboxStore {
    db: AsyncDatabase,
    backoff_unit: chrono::Duration,
    claim_lease: chrono::Duration,
    claim_token: String,
}

impl OutboxStore {
    /// Create a store over an open database.
    pub fn new(db: AsyncDatabase, config: OutboxConfig) -> OutboxResult<Self> {
        let backoff_unit = chrono::Duration::from_std(config.backoff_unit)
            .map_err(|e| OutboxError::InvalidConfig(format!("backoff_unit: {e}")))?;
        let claim_lease = chrono::Duration::from_std(config.claim_lease)
            .map_err(|e| OutboxError::InvalidConfig(format!("claim_lease: {e}")))?;

        Ok(Self {
            db,
            backoff_unit,
            claim_lease,
            claim_token: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// The underlying database.
    pub fn db(&self) -> &AsyncDatabase {
        &self.db
    }

    /// Token stamped on jobs claimed by this store.
    pub fn claim_token(&self) -> &str {
        &self.claim_token
    }

    /// Enqueue a job on its own.
    ///
    /// Use `queries::enqueue_sync_job` inside `AsyncDatabase::transaction`
    /// when the job must commit with a local change.
    pub async fn enqueue(
        &self,
        subject_id: i64,
        operation_type: OperationType,
        payload: &serde_json::Value,
    ) -> OutboxResult<i64> {
        let job = NewSyncJob {
            subject_id,
            operation_type: operation_type.as_str().to_string(),
            payload: serde_json::to_string(payload)?,
        };
        let job_id = self
            .db
            .call(move |conn| queries::enqueue_sync_job(conn, &job, Utc::now()))
            .await?;
        Ok(job_id)
    }

    /// Claim up to `limit` due jobs, oldest first.
    pub async fn fetch_due(&self, limit: usize) -> OutboxResult<Vec<SyncJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let token = self.claim_token.clone();
        let now = Utc::now();
        let claimed_until = self.lease_end(now)?;
        let jobs = self
            .db
            .transaction(move |conn| {
                queries::claim_due_jobs(conn, &token, now, claimed_until, limit)
            })
            .await?;

        if !jobs.is_empty() {
            debug!(count = jobs.len(), claim_token = %self.claim_token, "Claimed due outbox jobs");
        }
        Ok(jobs)
    }

    /// Start a fresh lease on a job this store claimed.
    ///
    /// Call before working on each job of a batch, so that a long batch does
    /// not outlive the lease on its later jobs. Fails with `InvalidState` once
    /// another store has taken the job over.
    pub async fn renew_claim(&self, job_id: i64) -> OutboxResult<()> {
        let token = self.claim_token.clone();
        let now = Utc::now();
        let claimed_until = self.lease_end(now)?;
        self.db
            .call(move |conn| queries::renew_job_claim(conn, job_id, &token, claimed_until, now))
            .await?;
        Ok(())
    }

    /// Mark a job delivered.
    pub async fn mark_success(&self, job_id: i64) -> OutboxResult<()> {
        let token = self.claim_token.clone();
        self.db
            .call(move |conn| queries::mark_job_success(conn, job_id, &token, Utc::now()))
            .await?;
        debug!(job_id, "Outbox job delivered");
        Ok(())
    }

    /// Record a failed attempt and schedule a retry or fail the job.
    pub async fn mark_error(
        &self,
        job_id: i64,
        message: &str,
        max_retries: u32,
        is_fatal: bool,
    ) -> OutboxResult<JobDisposition> {
        let message = message.to_string();
        let token = self.claim_token.clone();
        let backoff_unit = self.backoff_unit;
        let disposition = self
            .db
            .call(move |conn| {
                queries::mark_job_error(
                    conn,
                    job_id,
                    &token,
                    &message,
                    i64::from(max_retries),
                    is_fatal,
                    backoff_unit,
                    Utc::now(),
                )
            })
            .await?;

        match disposition {
            JobDisposition::RetryScheduled {
                retry_count,
                next_attempt_at,
            } => {
                info!(job_id, retry_count, next_attempt_at = %next_attempt_at, "Outbox job scheduled for retry");
            }
            JobDisposition::Failed { retry_count } => {
                warn!(job_id, retry_count, is_fatal, "Outbox job failed permanently");
            }
        }
        Ok(disposition)
    }

    /// Give a claimed job back without recording an attempt.
    pub async fn release(&self, job_id: i64) -> OutboxResult<()> {
        let token = self.claim_token.clone();
        self.db
            .call(move |conn| queries::release_job_claim(conn, job_id, &token, Utc::now()))
            .await?;
        debug!(job_id, "Outbox job claim released");
        Ok(())
    }

    /// Get a job by ID.
    pub async fn get(&self, job_id: i64) -> OutboxResult<Option<SyncJob>> {
        Ok(self
            .db
            .call(move |conn| queries::get_sync_job(conn, job_id))
            .await?)
    }

    /// Count jobs per status.
    pub async fn status_counts(&self) -> OutboxResult<JobStatusCounts> {
        Ok(self.db.call(queries::count_jobs_by_status).await?)
    }

    fn lease_end(&self, now: DateTime<Utc>) -> OutboxResult<DateTime<Utc>> {
        now.checked_add_signed(self.claim_lease)
            .ok_or_else(|| OutboxError::InvalidConfig("claim_lease is out of range".to_string()))
    }
}
