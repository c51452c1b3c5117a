//! Puts new funnel candidates into Brevo lists through the outbox.

use crate::{CandidateSource, FunnelCandidate, FunnelSyncResult};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use sync_database::{queries, AsyncDatabase, FunnelType, NewFunnelEntry, NewSyncJob, OperationType};
use tracing::{debug, info, warn};

/// Brevo list per funnel.
///
/// A list id of zero or below turns that funnel off.
#[derive(Debug, Clone, Default)]
pub struct FunnelSyncConfig {
    pub language_list_id: i64,
    pub non_language_list_id: i64,
    /// Log what would be enqueued without writing anything.
    pub dry_run: bool,
}

impl FunnelSyncConfig {
    fn list_id(&self, funnel_type: FunnelType) -> i64 {
        match funnel_type {
            FunnelType::Language => self.language_list_id,
            FunnelType::NonLanguage => self.non_language_list_id,
        }
    }
}

/// Counts for one [`FunnelSyncService::sync`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FunnelSyncSummary {
    pub fetched: usize,
    /// New funnel entries, each with its `upsert_contact` job.
    pub enqueued: usize,
    pub already_in_funnel: usize,
    pub invalid: usize,
    /// Funnels skipped because no list is configured.
    pub skipped_funnels: usize,
}

enum CandidateOutcome {
    Enqueued,
    AlreadyInFunnel,
    DryRun,
}

/// Funnel sync service.
pub struct FunnelSyncService {
    db: AsyncDatabase,
    source: Arc<dyn CandidateSource>,
    config: FunnelSyncConfig,
}

impl FunnelSyncService {
    pub fn new(db: AsyncDatabase, source: Arc<dyn CandidateSource>, config: FunnelSyncConfig) -> Self {
        Self { db, source, config }
    }

    /// Pull up to `max_rows_per_type` candidates per funnel and enqueue the new ones.
    ///
    /// Each candidate's funnel entry and outbox job commit together. Source
    /// and database errors abort the run; earlier candidates stay committed.
    pub async fn sync(&self, max_rows_per_type: usize) -> FunnelSyncResult<FunnelSyncSummary> {
        info!(max_rows_per_type, dry_run = self.config.dry_run, "Starting funnel sync");
        let mut summary = FunnelSyncSummary::default();

        for funnel_type in [FunnelType::Language, FunnelType::NonLanguage] {
            let list_id = self.config.list_id(funnel_type);
            if list_id <= 0 {
                info!(funnel_type = funnel_type.as_str(), "No Brevo list configured, skipping funnel");
                summary.skipped_funnels += 1;
                continue;
            }

            let candidates = self.source.candidates(funnel_type, max_rows_per_type).await?;
            info!(funnel_type = funnel_type.as_str(), count = candidates.len(), "Fetched funnel candidates");
            summary.fetched += candidates.len();

            for candidate in candidates {
                if candidate.email.trim().is_empty() {
                    warn!(funnel_type = funnel_type.as_str(), user_id = ?candidate.user_id, "Candidate without email, skipping");
                    summary.invalid += 1;
                    continue;
                }

                match self.process_candidate(candidate, funnel_type, list_id).await? {
                    CandidateOutcome::Enqueued => summary.enqueued += 1,
                    CandidateOutcome::AlreadyInFunnel => summary.already_in_funnel += 1,
                    CandidateOutcome::DryRun => {}
                }
            }
        }

        info!(
            fetched = summary.fetched,
            enqueued = summary.enqueued,
            already_in_funnel = summary.already_in_funnel,
            invalid = summary.invalid,
            "Funnel sync finished"
        );
        Ok(summary)
    }

    async fn process_candidate(
        &self,
        candidate: FunnelCandidate,
        funnel_type: FunnelType,
        list_id: i64,
    ) -> FunnelSyncResult<CandidateOutcome> {
        let entry = NewFunnelEntry {
            email: candidate.email,
            funnel_type,
            user_id: candidate.user_id,
            test_id: candidate.test_id,
        };

        if self.config.dry_run {
            let email = entry.email.clone();
            let test_id = entry.test_id;
            let exists = self
                .db
                .call(move |conn| queries::funnel_entry_exists(conn, &email, funnel_type, test_id))
                .await?;
            if exists {
                return Ok(CandidateOutcome::AlreadyInFunnel);
            }
            info!(email = %entry.email, funnel_type = funnel_type.as_str(), list_id, "Dry run, would add candidate to funnel");
            return Ok(CandidateOutcome::DryRun);
        }

        let payload = serde_json::to_string(&json!({
            "email": entry.email,
            "list_ids": [list_id],
            "attributes": { "FUNNEL_TYPE": funnel_type.as_str() },
        }))?;
        let email = entry.email.clone();

        let created = self
            .db
            .transaction(move |conn| {
                if queries::funnel_entry_exists(conn, &entry.email, entry.funnel_type, entry.test_id)? {
                    return Ok(None);
                }
                let now = Utc::now();
                let entry_id = queries::insert_funnel_entry(conn, &entry, now)?;
                let job = NewSyncJob {
                    subject_id: entry_id,
                    operation_type: OperationType::UpsertContact.as_str().to_string(),
                    payload,
                };
                let job_id = queries::enqueue_sync_job(conn, &job, now)?;
                Ok(Some((entry_id, job_id)))
            })
            .await?;

        match created {
            Some((entry_id, job_id)) => {
                info!(email = %email, funnel_type = funnel_type.as_str(), list_id, entry_id, job_id, "Candidate added to funnel");
                Ok(CandidateOutcome::Enqueued)
            }
            None => {
                debug!(email = %email, funnel_type = funnel_type.as_str(), "Candidate already in funnel");
                Ok(CandidateOutcome::AlreadyInFunnel)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FunnelSyncError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use sync_database::JobStatus;

    #[derive(Default)]
    struct StaticCandidates {
        language: Vec<FunnelCandidate>,
        non_language: Vec<FunnelCandidate>,
        requests: Mutex<Vec<(FunnelType, usize)>>,
    }

    #[async_trait]
    impl CandidateSource for StaticCandidates {
        async fn candidates(
            &self,
            funnel_type: FunnelType,
            limit: usize,
        ) -> FunnelSyncResult<Vec<FunnelCandidate>> {
            self.requests.lock().push((funnel_type, limit));
            let rows = match funnel_type {
                FunnelType::Language => &self.language,
                FunnelType::NonLanguage => &self.non_language,
            };
            Ok(rows.iter().take(limit).cloned().collect())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl CandidateSource for FailingSource {
        async fn candidates(&self, _: FunnelType, _: usize) -> FunnelSyncResult<Vec<FunnelCandidate>> {
            Err(FunnelSyncError::Source("connection refused".to_string()))
        }
    }

    fn config() -> FunnelSyncConfig {
        FunnelSyncConfig {
            language_list_id: 7,
            non_language_list_id: 8,
            dry_run: false,
        }
    }

    async fn outbox_jobs(db: &AsyncDatabase) -> Vec<(i64, String, String)> {
        db.call_sqlite(|conn| {
            let mut stmt =
                conn.prepare("SELECT subject_id, operation_type, payload FROM brevo_sync_outbox ORDER BY id")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<Result<Vec<(i64, String, String)>, _>>();
            rows
        })
        .await
        .unwrap()
    }

    async fn entry_count(db: &AsyncDatabase) -> i64 {
        db.call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM funnel_entries", [], |row| row.get(0)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_new_candidates_get_entry_and_job() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("a@x.com")],
            non_language: vec![FunnelCandidate {
                email: "b@x.com".to_string(),
                user_id: Some(4),
                test_id: Some(9),
            }],
            ..Default::default()
        });
        let service = FunnelSyncService::new(db.clone(), source.clone(), config());

        let summary = service.sync(50).await.unwrap();
        assert_eq!(summary.fetched, 2);
        assert_eq!(summary.enqueued, 2);
        assert_eq!(
            *source.requests.lock(),
            vec![(FunnelType::Language, 50), (FunnelType::NonLanguage, 50)]
        );

        let jobs = outbox_jobs(&db).await;
        assert_eq!(jobs.len(), 2);
        let (subject_id, operation_type, payload) = &jobs[1];
        assert_eq!(operation_type, "upsert_contact");
        let payload: Value = serde_json::from_str(payload).unwrap();
        assert_eq!(
            payload,
            json!({"email": "b@x.com", "list_ids": [8], "attributes": {"FUNNEL_TYPE": "non_language"}})
        );

        let entry = db
            .call({
                let id = *subject_id;
                move |conn| queries::get_funnel_entry(conn, id)
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.email, "b@x.com");
        assert_eq!(entry.test_id, Some(9));
        assert!(!entry.certificate_purchased);

        let counts = db.call(queries::count_jobs_by_status).await.unwrap();
        assert_eq!(counts.pending, 2);
        let job = db.call(|conn| queries::get_sync_job(conn, 1)).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_sync_skips_existing_entries() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("a@x.com"), FunnelCandidate::new("a@x.com")],
            ..Default::default()
        });
        let service = FunnelSyncService::new(db.clone(), source, config());

        let first = service.sync(10).await.unwrap();
        assert_eq!(first.enqueued, 1);
        assert_eq!(first.already_in_funnel, 1);

        let second = service.sync(10).await.unwrap();
        assert_eq!(second.enqueued, 0);
        assert_eq!(second.already_in_funnel, 2);
        assert_eq!(outbox_jobs(&db).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unconfigured_funnel_is_skipped() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("a@x.com")],
            non_language: vec![FunnelCandidate::new("b@x.com")],
            ..Default::default()
        });
        let service = FunnelSyncService::new(
            db.clone(),
            source.clone(),
            FunnelSyncConfig {
                language_list_id: 0,
                non_language_list_id: 8,
                dry_run: false,
            },
        );

        let summary = service.sync(10).await.unwrap();
        assert_eq!(summary.skipped_funnels, 1);
        assert_eq!(summary.enqueued, 1);
        assert_eq!(*source.requests.lock(), vec![(FunnelType::NonLanguage, 10)]);
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("a@x.com")],
            ..Default::default()
        });
        let service = FunnelSyncService::new(
            db.clone(),
            source,
            FunnelSyncConfig {
                dry_run: true,
                ..config()
            },
        );

        let summary = service.sync(10).await.unwrap();
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.enqueued, 0);
        assert_eq!(entry_count(&db).await, 0);
        assert!(outbox_jobs(&db).await.is_empty());
    }

    #[tokio::test]
    async fn test_blank_email_is_skipped() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("  "), FunnelCandidate::new("a@x.com")],
            ..Default::default()
        });
        let service = FunnelSyncService::new(db.clone(), source, config());

        let summary = service.sync(10).await.unwrap();
        assert_eq!(summary.invalid, 1);
        assert_eq!(summary.enqueued, 1);
    }

    #[tokio::test]
    async fn test_failed_enqueue_rolls_back_entry() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call_sqlite(|conn| conn.execute_batch("DROP TABLE brevo_sync_outbox"))
            .await
            .unwrap();
        let source = Arc::new(StaticCandidates {
            language: vec![FunnelCandidate::new("a@x.com")],
            ..Default::default()
        });
        let service = FunnelSyncService::new(db.clone(), source, config());

        let err = service.sync(10).await.unwrap_err();
        assert!(matches!(err, FunnelSyncError::Database(_)));
        assert_eq!(entry_count(&db).await, 0);
    }

    #[tokio::test]
    async fn test_source_error_aborts_sync() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        let service = FunnelSyncService::new(db, Arc::new(FailingSource), config());

        let err = service.sync(10).await.unwrap_err();
        assert!(matches!(err, FunnelSyncError::Source(_)));
    }
}
