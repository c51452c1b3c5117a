//! # OutboxSyncWorker: Brevo Outbox Worker
//!
//! Drains the `brevo_sync_outbox` table into Brevo.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  fetch_due   ┌──────────────────┐  deliver  ┌─────────┐
//! │  OutboxStore    │─────────────▶│ OutboxSyncWorker │──────────▶│  Brevo  │
//! │  (SQLite)       │◀─────────────│                  │◀──────────│  API    │
//! └─────────────────┘   mark_*     └──────────────────┘           └─────────┘
//! ```
//!
//! Each run claims a batch of due jobs, delivers them one at a time in id
//! order and records every outcome:
//!
//! | Delivery result          | Outbox call                      |
//! |--------------------------|----------------------------------|
//! | success                  | `mark_success`                   |
//! | `Transient`              | `mark_error(is_fatal = false)`   |
//! | `Fatal`, bad payload     | `mark_error(is_fatal = true)`    |
//! | `Validation`, dry run    | `release` (state untouched)      |
//!
//! The claim on each job is renewed right before it is delivered; a job
//! whose claim already passed to another worker is skipped untouched. A
//! failure on one job is logged and counted; the rest of the batch still
//! runs.
//!
//! ## Example
//!
//! ```ignore
//! let worker = OutboxSyncWorker::new(OutboxSyncWorkerConfig::default(), store, client);
//! let summary = worker.run_once().await?;
//! ```

use brevo_client::{BrevoClient, BrevoContact, DeliveryError, DeliveryResponse};
use contact_outbox::{JobDisposition, OperationType, OutboxError, OutboxStore, SyncJob};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Worker error type.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The batch could not be fetched
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

/// Result type alias using WorkerError.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Configuration for the outbox worker.
///
/// # Fields
///
/// - `batch_size`: Maximum jobs claimed per run (default: 100)
/// - `max_job_retries`: Failed attempts before a job is failed for good (default: 5)
/// - `poll_interval`: Delay between runs in [`OutboxSyncWorker::run`] (default: 30s)
#[derive(Debug, Clone)]
pub struct OutboxSyncWorkerConfig {
    pub batch_size: usize,
    pub max_job_retries: u32,
    pub poll_interval: Duration,
}

impl Default for OutboxSyncWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_job_retries: 5,
            poll_interval: Duration::from_secs(30),
        }
    }
}

/// Counts for one [`OutboxSyncWorker::run_once`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs claimed from the outbox.
    pub fetched: usize,
    /// Marked success.
    pub delivered: usize,
    /// Still pending with a retry scheduled.
    pub retry_scheduled: usize,
    /// Failed terminally in this run.
    pub failed: usize,
    /// Claim released without recording an attempt.
    pub released: usize,
    /// Jobs whose outcome could not be written back.
    pub store_errors: usize,
    /// Skipped because another worker took over the claim.
    pub lost_claims: usize,
}

/// What happened to one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobOutcome {
    Delivered,
    RetryScheduled,
    Failed,
    Released,
    StoreError,
    ClaimLost,
}

/// Outbox worker.
///
/// Cheap to clone; clones share the store and the client, and with it the
/// client's rate window and circuit breaker.
#[derive(Clone)]
pub struct OutboxSyncWorker {
    config: OutboxSyncWorkerConfig,
    store: OutboxStore,
    client: Arc<BrevoClient>,
}

impl OutboxSyncWorker {
    pub fn new(config: OutboxSyncWorkerConfig, store: OutboxStore, client: Arc<BrevoClient>) -> Self {
        Self {
            config,
            store,
            client,
        }
    }

    pub fn store(&self) -> &OutboxStore {
        &self.store
    }

    /// Process one batch of due jobs.
    ///
    /// Fails only when the batch itself cannot be fetched.
    pub async fn run_once(&self) -> WorkerResult<RunSummary> {
        let jobs = self.store.fetch_due(self.config.batch_size).await?;
        let mut summary = RunSummary {
            fetched: jobs.len(),
            ..Default::default()
        };

        if jobs.is_empty() {
            debug!("No due outbox jobs");
            return Ok(summary);
        }
        info!(count = jobs.len(), "Processing outbox batch");

        for job in &jobs {
            match self.process_job(job).await {
                JobOutcome::Delivered => summary.delivered += 1,
                JobOutcome::RetryScheduled => summary.retry_scheduled += 1,
                JobOutcome::Failed => summary.failed += 1,
                JobOutcome::Released => summary.released += 1,
                JobOutcome::StoreError => summary.store_errors += 1,
                JobOutcome::ClaimLost => summary.lost_claims += 1,
            }
        }

        info!(
            fetched = summary.fetched,
            delivered = summary.delivered,
            retry_scheduled = summary.retry_scheduled,
            failed = summary.failed,
            released = summary.released,
            store_errors = summary.store_errors,
            lost_claims = summary.lost_claims,
            "Outbox batch finished"
        );
        Ok(summary)
    }

    /// Run batches every `poll_interval` until `shutdown` resolves.
    ///
    /// A batch that is already running finishes before the loop exits.
    pub async fn run<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(
            batch_size = self.config.batch_size,
            poll_interval_secs = self.config.poll_interval.as_secs_f64(),
            "Outbox worker started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Outbox batch failed");
                    }
                }
            }
        }

        info!("Outbox worker stopped");
    }

    async fn process_job(&self, job: &SyncJob) -> JobOutcome {
        match self.store.renew_claim(job.id).await {
            Ok(()) => {}
            Err(e) if e.is_invalid_state() => {
                warn!(job_id = job.id, error = %e, "Outbox job claim lost, skipping");
                return JobOutcome::ClaimLost;
            }
            Err(e) => {
                error!(job_id = job.id, error = %e, "Failed to renew outbox job claim");
                return JobOutcome::StoreError;
            }
        }

        let contact = match decode_job(job) {
            Ok(contact) => contact,
            Err(message) => {
                error!(job_id = job.id, operation_type = %job.operation_type, error = %message, "Undeliverable outbox job");
                return self.record_error(job, &message, true).await;
            }
        };

        debug!(job_id = job.id, email = %contact.email, operation_type = %job.operation_type, "Delivering outbox job");

        match self.client.deliver(&contact).await {
            Ok(DeliveryResponse::Delivered { .. }) => match self.store.mark_success(job.id).await {
                Ok(()) => JobOutcome::Delivered,
                Err(e) => {
                    error!(job_id = job.id, error = %e, "Failed to mark outbox job delivered");
                    JobOutcome::StoreError
                }
            },
            Ok(DeliveryResponse::DryRun) => {
                info!(job_id = job.id, "Dry run, leaving outbox job pending");
                self.release(job).await
            }
            Err(DeliveryError::Transient(message)) => self.record_error(job, &message, false).await,
            Err(DeliveryError::Fatal(message)) => self.record_error(job, &message, true).await,
            Err(DeliveryError::Validation(message)) => {
                warn!(job_id = job.id, error = %message, "Outbox job not attempted");
                self.release(job).await
            }
        }
    }

    async fn record_error(&self, job: &SyncJob, message: &str, is_fatal: bool) -> JobOutcome {
        match self
            .store
            .mark_error(job.id, message, self.config.max_job_retries, is_fatal)
            .await
        {
            Ok(JobDisposition::RetryScheduled { .. }) => JobOutcome::RetryScheduled,
            Ok(JobDisposition::Failed { .. }) => JobOutcome::Failed,
            Err(e) => {
                error!(job_id = job.id, error = %e, "Failed to record outbox job error");
                JobOutcome::StoreError
            }
        }
    }

    async fn release(&self, job: &SyncJob) -> JobOutcome {
        match self.store.release(job.id).await {
            Ok(()) => JobOutcome::Released,
            Err(e) => {
                error!(job_id = job.id, error = %e, "Failed to release outbox job");
                JobOutcome::StoreError
            }
        }
    }
}

/// Turn a stored job into the contact to send.
///
/// Both operation types carry a contact payload; an unknown type or an
/// undecodable payload can never succeed.
fn decode_job(job: &SyncJob) -> Result<BrevoContact, String> {
    match OperationType::parse(&job.operation_type) {
        Some(OperationType::UpsertContact) | Some(OperationType::UpdateAfterPurchase) => {
            serde_json::from_str(&job.payload)
                .map_err(|e| format!("Invalid payload for job {}: {e}", job.id))
        }
        None => Err(format!("Unknown operation type: {}", job.operation_type)),
    }
}
