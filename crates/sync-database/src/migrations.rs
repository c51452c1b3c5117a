//! Database migrations.
//!
//! Migrations are run in order and tracked in the `migrations` table.

use crate::DatabaseResult;
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> DatabaseResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    info!(current_version, target_version = CURRENT_VERSION, "Running migrations");

    if current_version < 1 {
        migrate_v1_brevo_sync_outbox(conn)?;
    }
    if current_version < 2 {
        migrate_v2_funnel_entries(conn)?;
    }

    info!("Migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> DatabaseResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: Brevo sync outbox.
///
/// Triggers keep `payload` immutable and make `success`/`failed` terminal
/// even for writers that bypass the query helpers.
fn migrate_v1_brevo_sync_outbox(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v1: brevo_sync_outbox");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS brevo_sync_outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            subject_id INTEGER NOT NULL,
            operation_type TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'success', 'failed')),
            retry_count INTEGER NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
            next_attempt_at TEXT,
            last_error TEXT,
            claim_token TEXT,
            claimed_until TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_brevo_sync_outbox_due
            ON brevo_sync_outbox(status, next_attempt_at, id);
        CREATE INDEX IF NOT EXISTS idx_brevo_sync_outbox_subject
            ON brevo_sync_outbox(subject_id);

        CREATE TRIGGER IF NOT EXISTS trg_brevo_sync_outbox_payload_immutable
            BEFORE UPDATE OF payload ON brevo_sync_outbox
            WHEN NEW.payload IS NOT OLD.payload
        BEGIN
            SELECT RAISE(ABORT, 'payload is immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_brevo_sync_outbox_terminal_status
            BEFORE UPDATE OF status ON brevo_sync_outbox
            WHEN OLD.status IN ('success', 'failed') AND NEW.status IS NOT OLD.status
        BEGIN
            SELECT RAISE(ABORT, 'terminal status cannot change');
        END;
        ",
    )?;

    record_migration(conn, 1, "brevo_sync_outbox")?;
    Ok(())
}

/// V2: Funnel entries (local state the outbox jobs refer to).
fn migrate_v2_funnel_entries(conn: &Connection) -> DatabaseResult<()> {
    info!("Applying migration v2: funnel_entries");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS funnel_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT NOT NULL,
            funnel_type TEXT NOT NULL CHECK (funnel_type IN ('language', 'non_language')),
            user_id INTEGER,
            test_id INTEGER,
            certificate_purchased INTEGER NOT NULL DEFAULT 0,
            certificate_purchased_at TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_funnel_entries_email
            ON funnel_entries(email, funnel_type);
        CREATE INDEX IF NOT EXISTS idx_funnel_entries_pending_purchase
            ON funnel_entries(certificate_purchased, id);
        ",
    )?;

    record_migration(conn, 2, "funnel_entries")?;
    Ok(())
}
