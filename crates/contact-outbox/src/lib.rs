//! Durable outbox for Brevo contact sync jobs.
//!
//! This crate provides:
//! - OutboxStore: enqueue, atomic claim of due jobs, and state transitions
//! - OutboxConfig: linear retry backoff unit and claim lease
//!
//! Producers that must commit a local change together with its job call
//! `sync_database::queries::enqueue_sync_job` inside
//! `AsyncDatabase::transaction` instead of [`OutboxStore::enqueue`].

mod error;
mod store;

pub use error::{OutboxError, OutboxResult};
pub use store::{OutboxConfig, OutboxStore};
pub use sync_database::{JobDisposition, JobStatus, JobStatusCounts, OperationType, SyncJob};
