//! Read-side contracts for the systems funnel sync pulls from.
//!
//! Candidates and purchases live outside this workspace (the CMS database).
//! The services only see these traits; each deployment plugs in its own
//! implementation.

use crate::FunnelSyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sync_database::{FunnelEntry, FunnelType};

/// A person eligible to enter a funnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunnelCandidate {
    pub email: String,
    pub user_id: Option<i64>,
    pub test_id: Option<i64>,
}

impl FunnelCandidate {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            user_id: None,
            test_id: None,
        }
    }
}

/// A confirmed certificate purchase.
///
/// `purchased_at` is kept as the source returned it and validated by
/// [`crate::PurchaseSyncService`] before anything is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseRecord {
    pub order_id: String,
    pub purchased_at: String,
}

/// Supplies funnel candidates.
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Up to `limit` candidates for the given funnel.
    async fn candidates(
        &self,
        funnel_type: FunnelType,
        limit: usize,
    ) -> FunnelSyncResult<Vec<FunnelCandidate>>;
}

/// Looks up certificate purchases for funnel entries.
#[async_trait]
pub trait PurchaseSource: Send + Sync {
    /// The purchase made by this entry's person, if any.
    async fn find_certificate_purchase(
        &self,
        entry: &FunnelEntry,
    ) -> FunnelSyncResult<Option<PurchaseRecord>>;
}
