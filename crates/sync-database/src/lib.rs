//! SQLite database layer for contact sync.
//!
//! This crate provides:
//! - Async SQLite executor with a dedicated thread per connection
//! - Database migrations
//! - Model types for the outbox and funnel tables
//! - Query helpers that take any `&Connection`, including a transaction
//!
//! # Architecture
//!
//! The `AsyncDatabase` runs every statement on a single background thread.
//! Callers that need a local state change and its outbox job to commit
//! together use [`AsyncDatabase::transaction`]:
//!
//! ```ignore
//! let job_id = db
//!     .transaction(move |tx| {
//!         let entry_id = queries::insert_funnel_entry(tx, &entry, now)?;
//!         queries::enqueue_sync_job(tx, &NewSyncJob { subject_id: entry_id, .. }, now)
//!     })
//!     .await?;
//! ```
//!
//! **Important**: Only SQL operations should run inside `db.call()` or
//! `db.transaction()`. Network calls must happen outside.

mod error;
mod executor;
mod migrations;
mod models;
pub mod queries;

pub use error::{DatabaseError, DatabaseResult};
pub use executor::AsyncDatabase;
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::*;
