//! # Funnel Sync
//!
//! Producers for the Brevo outbox. Both services write their local change
//! and the matching outbox job in one SQLite transaction; delivery happens
//! later in the outbox worker.
//!
//! - [`FunnelSyncService`]: new candidates become funnel entries plus an
//!   `upsert_contact` job that adds them to the funnel's Brevo list.
//! - [`PurchaseSyncService`]: entries with a confirmed certificate purchase
//!   are flagged and get an `update_after_purchase` job.

mod error;
mod funnel;
mod purchase;
mod source;

pub use error::{FunnelSyncError, FunnelSyncResult};
pub use funnel::{FunnelSyncConfig, FunnelSyncService, FunnelSyncSummary};
pub use purchase::{parse_purchased_at, PurchaseSyncService, PurchaseSyncSummary};
pub use source::{CandidateSource, FunnelCandidate, PurchaseRecord, PurchaseSource};
