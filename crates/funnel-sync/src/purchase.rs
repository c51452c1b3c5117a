//! Flags funnel entries whose person bought a certificate and tells Brevo.

use crate::{FunnelSyncError, FunnelSyncResult, PurchaseSource};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use sync_database::{queries, AsyncDatabase, FunnelEntry, NewSyncJob, OperationType};
use tracing::{info, warn};

/// Counts for one [`PurchaseSyncService::sync`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurchaseSyncSummary {
    /// Pending entries looked up in the purchase source.
    pub checked: usize,
    pub purchases_found: usize,
    /// One `update_after_purchase` job per entry marked purchased.
    pub jobs_enqueued: usize,
    /// Purchases with no unpurchased local entry left to mark.
    pub no_matching_entry: usize,
    /// Purchases skipped for an unreadable timestamp.
    pub invalid: usize,
}

/// Purchase sync service.
pub struct PurchaseSyncService {
    db: AsyncDatabase,
    source: Arc<dyn PurchaseSource>,
    dry_run: bool,
}

impl PurchaseSyncService {
    pub fn new(db: AsyncDatabase, source: Arc<dyn PurchaseSource>, dry_run: bool) -> Self {
        Self { db, source, dry_run }
    }

    /// Check up to `max_rows` unpurchased entries, oldest first.
    pub async fn sync(&self, max_rows: usize) -> FunnelSyncResult<PurchaseSyncSummary> {
        info!(max_rows, dry_run = self.dry_run, "Starting purchase sync");

        let pending = self
            .db
            .call(move |conn| queries::list_pending_funnel_entries(conn, max_rows))
            .await?;
        info!(count = pending.len(), "Fetched pending funnel entries");

        let mut summary = PurchaseSyncSummary::default();
        let mut handled: HashSet<i64> = HashSet::new();

        for entry in &pending {
            // Marked together with an earlier entry of this run.
            if handled.contains(&entry.id) {
                continue;
            }
            summary.checked += 1;

            let Some(purchase) = self.source.find_certificate_purchase(entry).await? else {
                continue;
            };
            summary.purchases_found += 1;

            let purchased_at = match parse_purchased_at(&purchase.purchased_at) {
                Ok(purchased_at) => purchased_at,
                Err(e) => {
                    warn!(email = %entry.email, order_id = %purchase.order_id, error = %e, "Skipping purchase");
                    summary.invalid += 1;
                    continue;
                }
            };

            info!(
                email = %entry.email,
                funnel_type = entry.funnel_type.as_str(),
                order_id = %purchase.order_id,
                "Detected certificate purchase"
            );

            if self.dry_run {
                info!(
                    email = %entry.email,
                    funnel_type = entry.funnel_type.as_str(),
                    test_id = ?entry.test_id,
                    order_id = %purchase.order_id,
                    "Dry run, would mark entry purchased and enqueue Brevo update"
                );
                continue;
            }

            let entry_ids = self.record_purchase(entry, purchased_at).await?;
            if entry_ids.is_empty() {
                warn!(
                    email = %entry.email,
                    funnel_type = entry.funnel_type.as_str(),
                    test_id = ?entry.test_id,
                    "No funnel entry found for purchase"
                );
                summary.no_matching_entry += 1;
                continue;
            }

            info!(
                email = %entry.email,
                order_id = %purchase.order_id,
                entry_ids = ?entry_ids,
                "Purchase recorded"
            );
            summary.jobs_enqueued += entry_ids.len();
            handled.extend(entry_ids);
        }

        info!(
            checked = summary.checked,
            purchases_found = summary.purchases_found,
            jobs_enqueued = summary.jobs_enqueued,
            no_matching_entry = summary.no_matching_entry,
            invalid = summary.invalid,
            "Purchase sync finished"
        );
        Ok(summary)
    }

    /// Mark every matching entry purchased and enqueue one job per entry, atomically.
    ///
    /// Returns the marked ids; empty when nothing matched and nothing was written.
    async fn record_purchase(
        &self,
        entry: &FunnelEntry,
        purchased_at: DateTime<Utc>,
    ) -> FunnelSyncResult<Vec<i64>> {
        let purchased_at_iso = purchased_at.to_rfc3339_opts(SecondsFormat::Secs, false);
        let payload = serde_json::to_string(&json!({
            "email": entry.email,
            "funnel_type": entry.funnel_type.as_str(),
            "purchased_at": purchased_at_iso,
            "attributes": {
                "FUNNEL_TYPE": entry.funnel_type.as_str(),
                "CERTIFICATE_PURCHASED": 1,
                "CERTIFICATE_PURCHASED_AT": purchased_at_iso,
            },
        }))?;

        let email = entry.email.clone();
        let funnel_type = entry.funnel_type;
        let test_id = entry.test_id;

        let ids = self
            .db
            .transaction(move |conn| {
                let ids = queries::get_unpurchased_funnel_entry_ids(conn, &email, funnel_type, test_id)?;
                if ids.is_empty() {
                    return Ok(ids);
                }

                queries::mark_certificate_purchased(conn, &ids, purchased_at)?;
                let now = Utc::now();
                for id in &ids {
                    let job = NewSyncJob {
                        subject_id: *id,
                        operation_type: OperationType::UpdateAfterPurchase.as_str().to_string(),
                        payload: payload.clone(),
                    };
                    queries::enqueue_sync_job(conn, &job, now)?;
                }
                Ok(ids)
            })
            .await?;
        Ok(ids)
    }
}

/// Parse a purchase timestamp from the source.
///
/// Accepts RFC 3339 and `YYYY-MM-DD HH:MM:SS` (taken as UTC).
pub fn parse_purchased_at(value: &str) -> FunnelSyncResult<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|_| FunnelSyncError::Validation(format!("Unexpected purchased_at value: {value:?}")))
}
