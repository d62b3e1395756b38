//! # skyarchive Binary
//!
//! The entry point that assembles the pipeline from the plugins selected at
//! compile time.

mod cli;
mod telemetry;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use sa_config::{RateLimitSettings, Settings};
use sa_core::{ArchiveRepo, ExportJob, ExportOptions, ExportStatus, OperationKind, OperationStatus};
use sa_pipeline::controller::INTERRUPTED_MESSAGE;
use sa_pipeline::{ArchiveController, ExportEngine, PageFetcher, RateLimitConfig, RateLimiter};
use tokio::sync::mpsc;
use uuid::Uuid;

#[cfg(feature = "db-sqlite")]
use sa_db_sqlite::SqliteArchiveRepo;

#[cfg(feature = "storage-local")]
use sa_storage_local::{LocalContentStore, StoreConfig};

#[cfg(feature = "transport-xrpc")]
use sa_transport_xrpc::XrpcTransport;

#[cfg(not(all(feature = "db-sqlite", feature = "storage-local", feature = "transport-xrpc")))]
compile_error!("skyarchive needs the db-sqlite, storage-local and transport-xrpc features");

use cli::{Cli, Command};

const POLL_INTERVAL: Duration = Duration::from_secs(1);

fn rate_limit_config(settings: &RateLimitSettings) -> RateLimitConfig {
    let config = RateLimitConfig::new(Duration::from_secs(settings.window_secs), settings.quota);
    match settings.burst {
        Some(burst) => config.with_burst(burst),
        None => config,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    telemetry::init(settings.log_format)?;

    // 1. Initialize Database Implementation
    let repo = Arc::new(
        SqliteArchiveRepo::new(&settings.database_url)
            .await
            .with_context(|| format!("failed to open {}", settings.database_url))?,
    );

    // 2. Initialize Storage Implementation
    let store = Arc::new(
        LocalContentStore::new(StoreConfig::new(&settings.media_path)).context("failed to set up media store")?,
    );

    match cli.command {
        Command::Archive { did, kind } => {
            // 3. Initialize Transport Implementation
            let transport = XrpcTransport::new(&settings.service_url, settings.access_token.take())?;
            let controller = ArchiveController::new(
                repo,
                PageFetcher::new(Arc::new(transport)),
                store,
                RateLimiter::new(rate_limit_config(&settings.rate_limit)),
                settings.page_size,
            );
            archive(&controller, &did, kind).await
        }
        Command::Status { operation_id } => status(repo.as_ref(), operation_id).await,
        Command::Recover => {
            let released = repo.fail_interrupted_operations(INTERRUPTED_MESSAGE).await?;
            println!("{released} interrupted operation(s) marked failed");
            Ok(())
        }
        Command::Export { did, format, out, include_media, since, until, batch_size } => {
            let engine = ExportEngine::new(repo, store)
                .with_batch_size(batch_size.unwrap_or(settings.export_batch_size));
            let options = ExportOptions {
                subject_did: did,
                format,
                output_root: out.unwrap_or_else(|| settings.export_path.clone()),
                include_media,
                since,
                until,
            };
            export(&engine, options).await
        }
    }
}

async fn archive(controller: &ArchiveController, did: &str, kind: OperationKind) -> anyhow::Result<()> {
    let id = controller.start_archive(did, kind).await?;
    println!("operation {id} started ({kind})");

    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    let mut last_reported = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(operation_id = %id, "interrupt received, cancelling");
                controller.cancel(id).await?;
                break;
            }
            _ = ticker.tick() => {
                let op = controller.get_operation(id).await?;
                if last_reported != Some(op.progress_current) {
                    println!("{}: {}/{} posts", op.status, op.progress_current, op.progress_total);
                    last_reported = Some(op.progress_current);
                }
                if op.status.is_terminal() {
                    break;
                }
            }
        }
    }

    let op = controller.wait(id).await?;
    println!("operation {id} {}", op.status);
    match op.status {
        OperationStatus::Completed => Ok(()),
        _ => bail!("archive {}: {}", op.status, op.error.unwrap_or_default()),
    }
}

async fn status(repo: &dyn ArchiveRepo, id: Uuid) -> anyhow::Result<()> {
    let Some(op) = repo.get_operation(id).await? else {
        bail!("operation {id} not found");
    };
    println!("id:        {}", op.id);
    println!("subject:   {}", op.subject_did);
    println!("kind:      {}", op.kind);
    println!("status:    {}", op.status);
    println!("progress:  {}/{}", op.progress_current, op.progress_total);
    println!("started:   {}", op.started_at.to_rfc3339());
    if let Some(done) = op.completed_at {
        println!("finished:  {}", done.to_rfc3339());
    }
    if let Some(error) = op.error {
        println!("error:     {error}");
    }
    Ok(())
}

async fn export(engine: &ExportEngine, options: ExportOptions) -> anyhow::Result<()> {
    let mut job = ExportJob::new(options);
    let (tx, mut rx) = mpsc::channel::<sa_core::ExportProgress>(16);
    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            println!("exported {}/{} posts", progress.posts_processed, progress.posts_total);
        }
    });

    let result = engine.run(&mut job, Some(&tx)).await;
    drop(tx);
    printer.await.context("progress printer panicked")?;

    result.with_context(|| format!("export {} failed", job.id))?;
    debug_assert_eq!(job.status, ExportStatus::Completed);
    println!("{}", export_summary(&job));
    Ok(())
}

fn export_summary(job: &ExportJob) -> String {
    let mut summary = format!(
        "wrote {} posts to {}",
        job.posts_processed,
        sa_pipeline::export::posts_path(job).display()
    );
    if job.options.include_media {
        summary.push_str(&format!(" and {} of {} media files", job.media_copied, job.media_total));
    }
    summary
}
