//! # Export Engine
//!
//! Streams a subject's archived posts into a file under a per-job directory,
//! one ordered batch at a time, so memory use is bounded by the batch size.

pub mod format;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sa_core::{AppError, ArchiveRepo, ContentStore, ExportJob, ExportProgress, ExportStatus, Post, Result};
use tokio::fs;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;

pub use format::PostEncoder;

pub const DEFAULT_BATCH_SIZE: u64 = 1000;

pub type OutputWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Creates the file the posts are streamed into.
#[async_trait]
pub trait OutputOpener: Send + Sync {
    async fn create(&self, path: &Path) -> Result<OutputWriter>;
}

/// Buffered files on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOutputOpener;

#[async_trait]
impl OutputOpener for FsOutputOpener {
    async fn create(&self, path: &Path) -> Result<OutputWriter> {
        let file = fs::File::create(path).await?;
        Ok(Box::new(BufWriter::new(file)))
    }
}

pub struct ExportEngine {
    repo: Arc<dyn ArchiveRepo>,
    store: Arc<dyn ContentStore>,
    batch_size: u64,
    opener: Arc<dyn OutputOpener>,
}

impl ExportEngine {
    pub fn new(repo: Arc<dyn ArchiveRepo>, store: Arc<dyn ContentStore>) -> Self {
        Self {
            repo,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
            opener: Arc::new(FsOutputOpener),
        }
    }

    pub fn with_batch_size(mut self, batch_size: u64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_opener(mut self, opener: Arc<dyn OutputOpener>) -> Self {
        self.opener = opener;
        self
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    /// Runs `job` to a terminal status. On failure the job directory is
    /// removed, the job row is marked failed, and the error is returned.
    ///
    /// Progress updates never block the export: when `progress` is full the
    /// update is dropped. The job row always holds the latest counters.
    pub async fn run(&self, job: &mut ExportJob, progress: Option<&mpsc::Sender<ExportProgress>>) -> Result<()> {
        if job.status != ExportStatus::Queued {
            return Err(AppError::ValidationError(format!(
                "export job {} is {}, expected queued",
                job.id, job.status
            )));
        }
        job.status = ExportStatus::Running;
        self.repo.save_export_job(job).await?;
        tracing::info!(
            job_id = %job.id,
            subject = %job.options.subject_did,
            format = %job.options.format,
            output_dir = %job.output_dir.display(),
            "export started"
        );

        match self.write_export(job, progress).await {
            Ok(()) => {
                job.status = ExportStatus::Completed;
                job.completed_at = Some(Utc::now());
                self.repo.save_export_job(job).await?;
                tracing::info!(job_id = %job.id, posts = job.posts_processed, media = job.media_copied, "export completed");
                Ok(())
            }
            Err(err) => {
                self.remove_output(job).await;
                job.status = ExportStatus::Failed;
                job.error = Some(err.to_string());
                job.completed_at = Some(Utc::now());
                if let Err(save_err) = self.repo.save_export_job(job).await {
                    tracing::error!(job_id = %job.id, error = %save_err, "failed to persist export failure");
                }
                tracing::warn!(job_id = %job.id, error = %err, "export failed");
                Err(err)
            }
        }
    }

    async fn write_export(&self, job: &mut ExportJob, progress: Option<&mpsc::Sender<ExportProgress>>) -> Result<()> {
        let filter = job.options.filter();
        let include_media = job.options.include_media;
        let encoder = PostEncoder::new(job.options.format);

        job.posts_total = self.repo.count_posts(&filter).await?;
        job.media_total = if include_media { self.repo.count_media(&filter).await? } else { 0 };

        fs::create_dir_all(&job.output_dir).await?;
        let media_dir = job.output_dir.join("media");
        if include_media {
            fs::create_dir_all(&media_dir).await?;
        }

        let final_path = posts_path(job);
        let partial_path = final_path.with_extension(format!("{}.partial", job.options.format.extension()));

        let mut out = self.opener.create(&partial_path).await?;
        out.write_all(&encoder.begin()?).await?;

        let mut copied = HashSet::new();
        let mut offset = 0u64;
        while offset < job.posts_total {
            let batch = self.repo.list_posts(&filter, self.batch_size, offset).await?;
            if batch.is_empty() {
                break;
            }

            out.write_all(&encoder.encode_batch(&batch, offset)?).await?;
            offset += batch.len() as u64;
            job.posts_processed = offset;
            job.posts_total = job.posts_total.max(offset);

            if include_media {
                self.copy_media(job, &batch, &media_dir, &mut copied).await?;
            }

            if let Err(err) = self.repo.save_export_job(job).await {
                tracing::warn!(job_id = %job.id, error = %err, "failed to persist export progress");
            }
            if let Some(tx) = progress {
                match tx.try_send(job.progress()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(job_id = %job.id, "progress listener lagging, update dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!(job_id = %job.id, "progress receiver dropped");
                    }
                }
            }
        }

        out.write_all(&encoder.finish(offset)).await?;
        out.flush().await?;
        out.shutdown().await?;
        drop(out);

        fs::rename(&partial_path, &final_path).await?;
        Ok(())
    }

    /// Copies every blob linked to `batch` that was not copied before.
    /// A blob missing from the store is skipped.
    async fn copy_media(
        &self,
        job: &mut ExportJob,
        batch: &[Post],
        media_dir: &Path,
        copied: &mut HashSet<String>,
    ) -> Result<()> {
        let uris: Vec<String> = batch.iter().map(|post| post.uri.clone()).collect();
        for blob in self.repo.media_for_posts(&uris).await? {
            if !copied.insert(blob.hash.clone()) {
                continue;
            }
            let source = self.store.resolve(&blob.local_path);
            if !fs::try_exists(&source).await? {
                tracing::warn!(job_id = %job.id, hash = %blob.hash, path = %source.display(), "media file missing, skipping");
                continue;
            }
            fs::copy(&source, media_dir.join(blob.file_name())).await?;
            job.media_copied += 1;
        }
        Ok(())
    }

    async fn remove_output(&self, job: &ExportJob) {
        match fs::remove_dir_all(&job.output_dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::error!(job_id = %job.id, error = %err, "failed to remove partial export");
            }
        }
    }
}

/// Final artifact path of a completed job.
pub fn posts_path(job: &ExportJob) -> PathBuf {
    job.output_dir.join(format!("posts.{}", job.options.format.extension()))
}
