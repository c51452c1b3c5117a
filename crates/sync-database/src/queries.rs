//! Standalone query functions that work with any Connection.
//!
//! Each function takes a `&Connection` as its first parameter, so it runs
//! equally against a plain connection or an open `rusqlite::Transaction`.
//! Callers pass `now` explicitly; nothing in here reads the wall clock.

use crate::{
    DatabaseError, DatabaseResult, FunnelEntry, FunnelType, JobDisposition, JobStatus,
    JobStatusCounts, NewFunnelEntry, NewSyncJob, SyncJob,
};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

// ==========================================
// Brevo Sync Outbox
// ==========================================

const SYNC_JOB_COLUMNS: &str = "id, subject_id, operation_type, payload, status, retry_count, \
     next_attempt_at, last_error, created_at, updated_at";

/// Insert a new pending outbox job and return its id.
pub fn enqueue_sync_job(
    conn: &Connection,
    job: &NewSyncJob,
    now: DateTime<Utc>,
) -> DatabaseResult<i64> {
    let now = format_timestamp(now);
    conn.execute(
        "INSERT INTO brevo_sync_outbox (subject_id, operation_type, payload, status, retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4)",
        params![job.subject_id, job.operation_type, job.payload, now],
    )?;
    let id = conn.last_insert_rowid();
    debug!(job_id = id, subject_id = job.subject_id, operation_type = %job.operation_type, "Outbox job enqueued");
    Ok(id)
}

/// Get an outbox job by ID.
pub fn get_sync_job(conn: &Connection, id: i64) -> DatabaseResult<Option<SyncJob>> {
    let sql = format!("SELECT {SYNC_JOB_COLUMNS} FROM brevo_sync_outbox WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let job = stmt.query_row(params![id], map_sync_job).optional()?;
    Ok(job)
}

/// Select due jobs and stamp them with a claim.
///
/// Must run inside an IMMEDIATE transaction so that selection and claim
/// happen under one write lock. A job is due when it is pending, its
/// `next_attempt_at` is null or not after `now`, and it holds no live claim.
pub fn claim_due_jobs(
    conn: &Connection,
    claim_token: &str,
    now: DateTime<Utc>,
    claimed_until: DateTime<Utc>,
    limit: usize,
) -> DatabaseResult<Vec<SyncJob>> {
    let now_str = format_timestamp(now);
    let until_str = format_timestamp(claimed_until);

    let sql = format!(
        "SELECT {SYNC_JOB_COLUMNS} FROM brevo_sync_outbox
         WHERE status = 'pending'
           AND (next_attempt_at IS NULL OR next_attempt_at <= ?1)
           AND (claimed_until IS NULL OR claimed_until <= ?1)
         ORDER BY id ASC
         LIMIT ?2"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let jobs = stmt
        .query_map(params![now_str, limit as i64], map_sync_job)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut claim = conn.prepare_cached(
        "UPDATE brevo_sync_outbox
         SET claim_token = ?1, claimed_until = ?2, updated_at = ?3
         WHERE id = ?4 AND status = 'pending'",
    )?;
    for job in &jobs {
        claim.execute(params![claim_token, until_str, now_str, job.id])?;
    }

    Ok(jobs)
}

/// Mark a pending job as delivered.
///
/// `claim_token` must hold the job's claim, or the job must be unclaimed.
pub fn mark_job_success(
    conn: &Connection,
    id: i64,
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    let count = conn.execute(
        "UPDATE brevo_sync_outbox
         SET status = 'success', last_error = NULL, next_attempt_at = NULL,
             claim_token = NULL, claimed_until = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'
           AND (claim_token IS NULL OR claim_token = ?3)",
        params![format_timestamp(now), id, claim_token],
    )?;
    if count == 0 {
        return Err(transition_refused(conn, id)?);
    }
    Ok(())
}

/// Record a failed delivery attempt.
///
/// Increments `retry_count` and overwrites `last_error`. The job fails
/// terminally when `is_fatal` is set or the new count exceeds `max_retries`;
/// otherwise it stays pending until `now + retry_count * backoff_unit`.
/// Refused with `InvalidState` while another token holds the claim.
#[allow(clippy::too_many_arguments)]
pub fn mark_job_error(
    conn: &Connection,
    id: i64,
    claim_token: &str,
    message: &str,
    max_retries: i64,
    is_fatal: bool,
    backoff_unit: Duration,
    now: DateTime<Utc>,
) -> DatabaseResult<JobDisposition> {
    let current: Option<(String, i64, Option<String>)> = conn
        .query_row(
            "SELECT status, retry_count, claim_token FROM brevo_sync_outbox WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let (status, retry_count, holder) =
        current.ok_or_else(|| DatabaseError::NotFound(format!("Outbox job {id}")))?;
    if JobStatus::parse(&status) != Some(JobStatus::Pending) {
        return Err(DatabaseError::InvalidState(format!(
            "Outbox job {id} is {status}, expected pending"
        )));
    }
    if holder.as_deref().is_some_and(|holder| holder != claim_token) {
        return Err(claimed_elsewhere(id));
    }

    let new_retry_count = retry_count + 1;
    let (disposition, status, next_attempt_at) = if is_fatal || new_retry_count > max_retries {
        (
            JobDisposition::Failed {
                retry_count: new_retry_count,
            },
            JobStatus::Failed,
            None,
        )
    } else {
        let next = retry_at(now, backoff_unit, new_retry_count).ok_or_else(|| {
            DatabaseError::InvalidData(format!(
                "Retry delay for outbox job {id} is out of range ({new_retry_count} x {backoff_unit})"
            ))
        })?;
        (
            JobDisposition::RetryScheduled {
                retry_count: new_retry_count,
                next_attempt_at: next,
            },
            JobStatus::Pending,
            Some(format_timestamp(next)),
        )
    };

    // Guarded on the row read above so a concurrent writer cannot be lost.
    let count = conn.execute(
        "UPDATE brevo_sync_outbox
         SET status = ?1, retry_count = ?2, last_error = ?3, next_attempt_at = ?4,
             claim_token = NULL, claimed_until = NULL, updated_at = ?5
         WHERE id = ?6 AND status = 'pending' AND retry_count = ?7
           AND claim_token IS ?8",
        params![
            status.as_str(),
            new_retry_count,
            message,
            next_attempt_at,
            format_timestamp(now),
            id,
            retry_count,
            holder,
        ],
    )?;
    if count == 0 {
        return Err(DatabaseError::InvalidState(format!(
            "Outbox job {id} changed while recording an error"
        )));
    }

    Ok(disposition)
}

/// Drop this token's claim on a pending job without touching its delivery state.
pub fn release_job_claim(
    conn: &Connection,
    id: i64,
    claim_token: &str,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    let count = conn.execute(
        "UPDATE brevo_sync_outbox
         SET claim_token = NULL, claimed_until = NULL, updated_at = ?1
         WHERE id = ?2 AND status = 'pending'
           AND (claim_token IS NULL OR claim_token = ?3)",
        params![format_timestamp(now), id, claim_token],
    )?;
    if count == 0 {
        return Err(transition_refused(conn, id)?);
    }
    Ok(())
}

/// Push out the lease on a job this token still holds.
///
/// Fails with `InvalidState` once the claim has passed to another token,
/// been released, or the job left `pending`.
pub fn renew_job_claim(
    conn: &Connection,
    id: i64,
    claim_token: &str,
    claimed_until: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DatabaseResult<()> {
    let count = conn.execute(
        "UPDATE brevo_sync_outbox
         SET claimed_until = ?1, updated_at = ?2
         WHERE id = ?3 AND status = 'pending' AND claim_token = ?4",
        params![
            format_timestamp(claimed_until),
            format_timestamp(now),
            id,
            claim_token
        ],
    )?;
    if count == 0 {
        return Err(transition_refused(conn, id)?);
    }
    Ok(())
}

/// Count outbox jobs per status.
pub fn count_jobs_by_status(conn: &Connection) -> DatabaseResult<JobStatusCounts> {
    let mut stmt =
        conn.prepare_cached("SELECT status, COUNT(*) FROM brevo_sync_outbox GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut counts = JobStatusCounts::default();
    for (status, count) in rows {
        let count = count as u64;
        match JobStatus::parse(&status) {
            Some(JobStatus::Pending) => counts.pending = count,
            Some(JobStatus::Success) => counts.success = count,
            Some(JobStatus::Failed) => counts.failed = count,
            None => {
                return Err(DatabaseError::InvalidData(format!(
                    "Unknown outbox status: {status}"
                )))
            }
        }
    }
    Ok(counts)
}

/// Error for a conditional update that matched no row.
fn transition_refused(conn: &Connection, id: i64) -> DatabaseResult<DatabaseError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM brevo_sync_outbox WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match status {
        None => DatabaseError::NotFound(format!("Outbox job {id}")),
        Some(status) if JobStatus::parse(&status) == Some(JobStatus::Pending) => {
            claimed_elsewhere(id)
        }
        Some(status) => {
            DatabaseError::InvalidState(format!("Outbox job {id} is {status}, expected pending"))
        }
    })
}

fn claimed_elsewhere(id: i64) -> DatabaseError {
    DatabaseError::InvalidState(format!("Outbox job {id} is not held by this claim"))
}

/// `now + retry_count * backoff_unit`, or `None` when it leaves chrono's range.
fn retry_at(now: DateTime<Utc>, backoff_unit: Duration, retry_count: i64) -> Option<DateTime<Utc>> {
    let factor = i32::try_from(retry_count).ok()?;
    let delay = backoff_unit.checked_mul(factor)?;
    now.checked_add_signed(delay)
}

fn map_sync_job(row: &Row<'_>) -> rusqlite::Result<SyncJob> {
    let status: String = row.get(4)?;
    Ok(SyncJob {
        id: row.get(0)?,
        subject_id: row.get(1)?,
        operation_type: row.get(2)?,
        payload: row.get(3)?,
        status: JobStatus::parse(&status).ok_or_else(|| {
            column_error(4, DatabaseError::InvalidData(format!("Unknown outbox status: {status}")))
        })?,
        retry_count: row.get(5)?,
        next_attempt_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_column(6, &s))
            .transpose()?,
        last_error: row.get(7)?,
        created_at: parse_column(8, &row.get::<_, String>(8)?)?,
        updated_at: parse_column(9, &row.get::<_, String>(9)?)?,
    })
}

// ==========================================
// Funnel Entries
// ==========================================

const FUNNEL_ENTRY_COLUMNS: &str = "id, email, funnel_type, user_id, test_id, \
     certificate_purchased, certificate_purchased_at, created_at";

/// Check whether a contact already entered a funnel.
///
/// `test_id` is compared null-safely, so `None` only matches entries
/// without a test.
pub fn funnel_entry_exists(
    conn: &Connection,
    email: &str,
    funnel_type: FunnelType,
    test_id: Option<i64>,
) -> DatabaseResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM funnel_entries
         WHERE email = ?1 AND funnel_type = ?2 AND test_id IS ?3",
        params![email, funnel_type.as_str(), test_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Insert a funnel entry and return its id.
pub fn insert_funnel_entry(
    conn: &Connection,
    entry: &NewFunnelEntry,
    now: DateTime<Utc>,
) -> DatabaseResult<i64> {
    conn.execute(
        "INSERT INTO funnel_entries (email, funnel_type, user_id, test_id, certificate_purchased, created_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
        params![
            entry.email,
            entry.funnel_type.as_str(),
            entry.user_id,
            entry.test_id,
            format_timestamp(now),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get a funnel entry by ID.
pub fn get_funnel_entry(conn: &Connection, id: i64) -> DatabaseResult<Option<FunnelEntry>> {
    let sql = format!("SELECT {FUNNEL_ENTRY_COLUMNS} FROM funnel_entries WHERE id = ?1");
    let mut stmt = conn.prepare_cached(&sql)?;
    let entry = stmt.query_row(params![id], map_funnel_entry).optional()?;
    Ok(entry)
}

/// List entries still waiting for a certificate purchase, oldest first.
pub fn list_pending_funnel_entries(
    conn: &Connection,
    limit: usize,
) -> DatabaseResult<Vec<FunnelEntry>> {
    let sql = format!(
        "SELECT {FUNNEL_ENTRY_COLUMNS} FROM funnel_entries
         WHERE certificate_purchased = 0
         ORDER BY created_at ASC, id ASC
         LIMIT ?1"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let entries = stmt
        .query_map(params![limit as i64], map_funnel_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Ids of unpurchased entries matching a purchase.
///
/// Without a `test_id` every unpurchased entry for the email and funnel
/// matches.
pub fn get_unpurchased_funnel_entry_ids(
    conn: &Connection,
    email: &str,
    funnel_type: FunnelType,
    test_id: Option<i64>,
) -> DatabaseResult<Vec<i64>> {
    let mut stmt = conn.prepare_cached(
        "SELECT id FROM funnel_entries
         WHERE email = ?1 AND funnel_type = ?2 AND certificate_purchased = 0
           AND (?3 IS NULL OR test_id = ?3)
         ORDER BY id ASC",
    )?;
    let ids = stmt
        .query_map(params![email, funnel_type.as_str(), test_id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Flag funnel entries as purchased.
pub fn mark_certificate_purchased(
    conn: &Connection,
    entry_ids: &[i64],
    purchased_at: DateTime<Utc>,
) -> DatabaseResult<usize> {
    let purchased_at = format_timestamp(purchased_at);
    let mut stmt = conn.prepare_cached(
        "UPDATE funnel_entries
         SET certificate_purchased = 1, certificate_purchased_at = ?1
         WHERE id = ?2 AND certificate_purchased = 0",
    )?;
    let mut updated = 0;
    for id in entry_ids {
        updated += stmt.execute(params![purchased_at, id])?;
    }
    Ok(updated)
}

fn map_funnel_entry(row: &Row<'_>) -> rusqlite::Result<FunnelEntry> {
    let funnel_type: String = row.get(2)?;
    Ok(FunnelEntry {
        id: row.get(0)?,
        email: row.get(1)?,
        funnel_type: FunnelType::parse(&funnel_type).ok_or_else(|| {
            column_error(2, DatabaseError::InvalidData(format!("Unknown funnel type: {funnel_type}")))
        })?,
        user_id: row.get(3)?,
        test_id: row.get(4)?,
        certificate_purchased: row.get(5)?,
        certificate_purchased_at: row
            .get::<_, Option<String>>(6)?
            .map(|s| parse_column(6, &s))
            .transpose()?,
        created_at: parse_column(7, &row.get::<_, String>(7)?)?,
    })
}

// ==========================================
// Helpers
// ==========================================

/// Format a timestamp for storage.
///
/// Fixed-width UTC with milliseconds, so text comparison in SQL matches
/// time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored RFC 3339 timestamp.
pub fn parse_timestamp(s: &str) -> DatabaseResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::InvalidData(format!("Invalid timestamp {s:?}: {e}")))
}

fn parse_column(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    parse_timestamp(s).map_err(|e| column_error(idx, e))
}

fn column_error(idx: usize, e: DatabaseError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}
