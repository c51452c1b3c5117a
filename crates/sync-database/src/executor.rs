//! Async access to SQLite through one dedicated connection thread.
//!
//! `tokio-rusqlite` owns the connection on its own thread; every closure
//! passed to [`AsyncDatabase::call`] or [`AsyncDatabase::transaction`] is
//! queued to that thread and runs in FIFO order. Async callers only await
//! the reply.
//!
//! Closures must stay SQL-only. A Brevo request or a backoff sleep inside
//! one stalls every other query in the process:
//!
//! ```ignore
//! // Claim inside the DB thread, deliver outside it.
//! let jobs = db.transaction(move |conn| queries::claim_due_jobs(conn, &token, now, until, 100)).await?;
//! for job in jobs {
//!     client.deliver(&contact).await;
//! }
//! ```

use crate::{migrations, DatabaseError, DatabaseResult};
use rusqlite::TransactionBehavior;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, info};

const PRAGMAS: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    PRAGMA foreign_keys = ON;
    PRAGMA cache_size = -64000;
    PRAGMA temp_store = MEMORY;
    PRAGMA busy_timeout = 5000;
";

fn from_tokio_rusqlite(e: tokio_rusqlite::Error) -> DatabaseError {
    match e {
        tokio_rusqlite::Error::Rusqlite(e) => DatabaseError::Sqlite(e),
        tokio_rusqlite::Error::Close(_) => DatabaseError::Connection("Connection closed".to_string()),
        other => DatabaseError::Connection(other.to_string()),
    }
}

// BEGIN IMMEDIATE: the write lock is held from the first statement.
fn run_in_transaction<F, T>(conn: &mut rusqlite::Connection, f: F) -> DatabaseResult<T>
where
    F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Handle to the connection thread. Clones share the same connection.
#[derive(Clone)]
pub struct AsyncDatabase {
    conn: Connection,
    path: String,
}

impl AsyncDatabase {
    /// Open (or create) the database file and bring its schema up to date.
    ///
    /// Parent directories are created. Each call opens its own connection,
    /// so two handles to one file behave like two processes.
    pub async fn open(path: &Path) -> DatabaseResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let path = path.to_string_lossy().to_string();
        info!(path = %path, "Opening database");

        let conn = Connection::open(&path)
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        conn.call(|conn| Ok(conn.execute_batch(PRAGMAS)?))
            .await
            .map_err(from_tokio_rusqlite)?;

        let db = Self { conn, path };
        db.migrate().await?;

        info!(path = %db.path, "Database ready (WAL)");
        Ok(db)
    }

    /// Open a private in-memory database with the schema applied.
    pub async fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| DatabaseError::Connection(e.to_string()))?;
        let db = Self {
            conn,
            path: ":memory:".to_string(),
        };
        db.migrate().await?;
        Ok(db)
    }

    // Several processes may open the same file at once.
    async fn migrate(&self) -> DatabaseResult<()> {
        self.transaction(|conn| migrations::run_migrations(conn)).await
    }

    /// Run `f` on the connection thread and return its result.
    ///
    /// Each statement inside `f` autocommits; use
    /// [`AsyncDatabase::transaction`] when several writes belong together.
    pub async fn call<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        // Our error travels inside tokio-rusqlite's Ok; its Err is only
        // for the connection thread itself.
        match self.conn.call(move |conn| Ok(f(conn))).await {
            Ok(result) => result,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// Run `f` inside an IMMEDIATE transaction.
    ///
    /// Commits when `f` returns `Ok`; any error rolls back everything `f`
    /// wrote, so a local change and the outbox job enqueued with it land
    /// together or not at all.
    pub async fn transaction<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> DatabaseResult<T> + Send + 'static,
        T: Send + 'static,
    {
        match self.conn.call(move |conn| Ok(run_in_transaction(conn, f))).await {
            Ok(result) => result,
            Err(e) => Err(from_tokio_rusqlite(e)),
        }
    }

    /// [`AsyncDatabase::call`] for closures that only produce `rusqlite` errors.
    pub async fn call_sqlite<F, T>(&self, f: F) -> DatabaseResult<T>
    where
        F: FnOnce(&rusqlite::Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.conn
            .call(move |conn| Ok(f(conn)?))
            .await
            .map_err(from_tokio_rusqlite)
    }

    /// File path, or `:memory:`.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn health_check(&self) -> DatabaseResult<()> {
        self.call_sqlite(|conn| conn.execute_batch("SELECT 1")).await?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Finish queued work and stop the connection thread.
    ///
    /// Other clones of this handle fail with `Connection` afterwards.
    pub async fn close(self) -> DatabaseResult<()> {
        self.conn
            .close()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to close database: {e:?}")))?;
        info!(path = %self.path, "Database closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{queries, NewSyncJob};
    use chrono::Utc;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_async_database_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        assert!(db.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_async_database_query() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("nested").join("test_query.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();
        assert!(db_path.exists());

        let id = db
            .call(|conn| {
                queries::enqueue_sync_job(
                    conn,
                    &NewSyncJob {
                        subject_id: 1,
                        operation_type: "upsert_contact".to_string(),
                        payload: r#"{"email":"a@x.com"}"#.to_string(),
                    },
                    Utc::now(),
                )
            })
            .await
            .unwrap();

        let job = db
            .call(move |conn| queries::get_sync_job(conn, id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.payload, r#"{"email":"a@x.com"}"#);
    }

    #[tokio::test]
    async fn test_concurrent_enqueues() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("test_concurrent.db");

        let db = AsyncDatabase::open(&db_path).await.unwrap();

        let mut handles = vec![];
        for i in 0..10 {
            let db = db.clone();
            handles.push(tokio::spawn(async move {
                db.transaction(move |conn| {
                    queries::enqueue_sync_job(
                        conn,
                        &NewSyncJob {
                            subject_id: i,
                            operation_type: "upsert_contact".to_string(),
                            payload: "{}".to_string(),
                        },
                        Utc::now(),
                    )
                })
                .await
            }));
        }

        let mut ids = vec![];
        for handle in handles {
            ids.push(handle.await.unwrap().unwrap());
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);

        let counts = db.call(|conn| queries::count_jobs_by_status(conn)).await.unwrap();
        assert_eq!(counts.pending, 10);
    }

    #[tokio::test]
    async fn test_transaction_commits_on_ok() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();

        db.transaction(|conn| {
            conn.execute_batch(
                "CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT);
                 INSERT INTO t (val) VALUES ('a');",
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let count: i64 = db
            .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = AsyncDatabase::open_in_memory().await.unwrap();
        db.call_sqlite(|conn| conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, val TEXT)"))
            .await
            .unwrap();

        let result: DatabaseResult<()> = db
            .transaction(|conn| {
                conn.execute("INSERT INTO t (val) VALUES ('a')", [])?;
                Err(DatabaseError::InvalidData("outbox insert failed".to_string()))
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .call_sqlite(|conn| conn.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
