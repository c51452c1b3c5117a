//! contact-sync binary entry point.
//!
//! Usage: contact-sync [--once] [--dry-run] [--config <file>] [--database <file>]
//!
//! Without `--once` the outbox worker polls until Ctrl-C.

use anyhow::Context;
use brevo_client::BrevoClient;
use clap::Parser;
use contact_outbox::{OutboxConfig, OutboxStore};
use outbox_sync_worker::{OutboxSyncWorker, OutboxSyncWorkerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use sync_config_and_utils::{init_logging, Config, Paths};
use sync_database::AsyncDatabase;
use tracing::{info, warn};

/// Sync queued contact updates to Brevo.
#[derive(Parser, Debug)]
#[command(name = "contact-sync")]
#[command(about = "Deliver queued contact updates from the SQLite outbox to Brevo")]
struct Args {
    /// Config file (default: ~/.contact-sync/config.json).
    #[arg(long, env = "CONTACT_SYNC_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database holding the outbox.
    #[arg(long, env = "CONTACT_SYNC_DATABASE")]
    database: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log Brevo requests instead of sending them; jobs stay pending.
    #[arg(long)]
    dry_run: bool,

    /// Process one batch and exit.
    #[arg(long)]
    once: bool,

    /// Jobs claimed per batch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Print outbox job counts and exit.
    #[arg(long)]
    status: bool,
}

fn load_config(args: &Args, paths: &Paths) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load_path(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load(paths).context("Failed to load config")?,
    };

    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(database) = &args.database {
        config.database_path = Some(database.clone());
    }
    if let Some(batch_size) = args.batch_size {
        config.outbox.batch_size = batch_size;
    }
    if args.dry_run {
        config.brevo.dry_run = true;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let paths = Paths::new()?;
    let config = load_config(&args, &paths)?;

    init_logging(&config.log_level, &paths).context("Failed to initialize logging")?;

    let database_path = config.database_path(&paths);
    info!(
        database = %database_path.display(),
        dry_run = config.brevo.dry_run,
        batch_size = config.outbox.batch_size,
        "contact-sync starting"
    );

    let db = AsyncDatabase::open(&database_path)
        .await
        .with_context(|| format!("Failed to open database {}", database_path.display()))?;

    let store = OutboxStore::new(
        db.clone(),
        OutboxConfig {
            backoff_unit: config.outbox.backoff_unit(),
            claim_lease: config.outbox.claim_lease(),
        },
    )?;

    if args.status {
        let counts = store.status_counts().await?;
        println!(
            "pending={} success={} failed={}",
            counts.pending, counts.success, counts.failed
        );
        db.close().await?;
        return Ok(());
    }

    if !config.brevo.dry_run && !config.brevo.has_api_key() {
        warn!("BREVO_API_KEY is not set; jobs will be left pending");
    }

    let client = BrevoClient::new(config.brevo.clone()).context("Failed to build Brevo client")?;
    let worker = OutboxSyncWorker::new(
        OutboxSyncWorkerConfig {
            batch_size: config.outbox.batch_size,
            max_job_retries: config.outbox.max_job_retries,
            poll_interval: config.outbox.poll_interval(),
        },
        store,
        Arc::new(client),
    );

    if args.once {
        let summary = worker.run_once().await?;
        info!(
            fetched = summary.fetched,
            delivered = summary.delivered,
            retry_scheduled = summary.retry_scheduled,
            failed = summary.failed,
            released = summary.released,
            store_errors = summary.store_errors,
            lost_claims = summary.lost_claims,
            "Single run complete"
        );
    } else {
        worker
            .run(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                info!("Received shutdown signal, exiting...");
            })
            .await;
    }

    db.close().await?;
    Ok(())
}
