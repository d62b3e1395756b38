//! # Archive Operations
//!
//! Starts one background task per archive run and tracks it until it reaches
//! a terminal status. The persisted `operations` row is the source of truth
//! for callers; the in-memory registry only holds what is needed to cancel
//! and await the tasks of this process.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sa_core::{
    AppError, ArchiveRepo, ContentStore, Operation, OperationKind, OperationStatus, Result,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::fetcher::{FetchedPost, PageFetcher};
use crate::ratelimit::RateLimiter;

/// Message stored on operations stopped through `cancel` or `shutdown`.
pub const CANCELLED_MESSAGE: &str = "archive cancelled by request";

/// Message stored on rows found non-terminal at startup.
pub const INTERRUPTED_MESSAGE: &str = "archive interrupted before completion";

struct RunningOperation {
    subject_did: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

/// In-flight operations of this process, keyed by operation id.
#[derive(Default)]
pub struct OperationRegistry {
    entries: Mutex<HashMap<Uuid, RunningOperation>>,
}

impl OperationRegistry {
    fn insert(&self, id: Uuid, subject_did: &str, cancel: CancellationToken) {
        self.entries.lock().insert(
            id,
            RunningOperation {
                subject_did: subject_did.to_string(),
                cancel,
                handle: None,
            },
        );
    }

    /// Returns the handle when the task already ended and removed itself.
    fn attach(&self, id: Uuid, handle: JoinHandle<()>) -> Option<JoinHandle<()>> {
        match self.entries.lock().get_mut(&id) {
            Some(entry) => {
                entry.handle = Some(handle);
                None
            }
            None => Some(handle),
        }
    }

    fn remove(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }

    fn cancel(&self, id: Uuid) -> bool {
        match self.entries.lock().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn take_handle(&self, id: Uuid) -> Option<JoinHandle<()>> {
        self.entries.lock().get_mut(&id).and_then(|entry| entry.handle.take())
    }

    fn take_all_handles(&self) -> Vec<JoinHandle<()>> {
        self.entries
            .lock()
            .values_mut()
            .filter_map(|entry| entry.handle.take())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self, subject_did: &str) -> bool {
        self.entries.lock().values().any(|entry| entry.subject_did == subject_did)
    }
}

struct Inner {
    repo: Arc<dyn ArchiveRepo>,
    fetcher: PageFetcher,
    store: Arc<dyn ContentStore>,
    limiter: RateLimiter,
    page_size: u32,
    registry: OperationRegistry,
    shutdown: CancellationToken,
}

/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ArchiveController {
    inner: Arc<Inner>,
}

impl ArchiveController {
    pub fn new(
        repo: Arc<dyn ArchiveRepo>,
        fetcher: PageFetcher,
        store: Arc<dyn ContentStore>,
        limiter: RateLimiter,
        page_size: u32,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                fetcher,
                store,
                limiter,
                page_size,
                registry: OperationRegistry::default(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Fails rows a previous process left pending or running.
    /// Must run before the first `start_archive`.
    pub async fn recover_interrupted(&self) -> Result<u64> {
        let released = self.inner.repo.fail_interrupted_operations(INTERRUPTED_MESSAGE).await?;
        if released > 0 {
            tracing::warn!(released, "marked interrupted operations as failed");
        }
        Ok(released)
    }

    /// Persists a pending operation and spawns its background task.
    /// Rejected with `AppError::Conflict` while the subject has an active operation.
    pub async fn start_archive(&self, subject_did: &str, kind: OperationKind) -> Result<Uuid> {
        if subject_did.trim().is_empty() {
            return Err(AppError::ValidationError("subject did is empty".into()));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Cancelled("controller is shutting down".into()));
        }

        let op = Operation::new(subject_did, kind);
        self.inner.repo.create_operation(&op).await.map_err(|err| match err {
            AppError::Conflict(_) => {
                AppError::Conflict(format!("archive already in progress for {subject_did}"))
            }
            other => other,
        })?;

        let id = op.id;
        let cancel = self.inner.shutdown.child_token();
        self.inner.registry.insert(id, subject_did, cancel.clone());

        tracing::info!(operation_id = %id, subject = subject_did, kind = %kind, "archive started");
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(supervise(inner, op, cancel));
        // `Some` only when the task already finished.
        drop(self.inner.registry.attach(id, handle));

        Ok(id)
    }

    pub async fn get_operation(&self, id: Uuid) -> Result<Operation> {
        self.inner
            .repo
            .get_operation(id)
            .await?
            .ok_or_else(|| AppError::NotFound("Operation".into(), id.to_string()))
    }

    pub async fn active_operation(&self, subject_did: &str) -> Result<Option<Operation>> {
        self.inner.repo.active_operation(subject_did).await
    }

    /// Signals the operation to stop at its next scheduling point.
    /// Returns false when it is not running in this process.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        if self.inner.registry.cancel(id) {
            tracing::info!(operation_id = %id, "cancellation requested");
            return Ok(true);
        }
        self.get_operation(id).await?;
        Ok(false)
    }

    /// Waits for the operation's task to finish and returns the persisted row.
    pub async fn wait(&self, id: Uuid) -> Result<Operation> {
        if let Some(handle) = self.inner.registry.take_handle(id) {
            if let Err(err) = handle.await {
                tracing::error!(operation_id = %id, error = %err, "archive task panicked");
            }
        }
        self.get_operation(id).await
    }

    /// Cancels every running operation and waits for all of them to persist
    /// their final status.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        for handle in self.inner.registry.take_all_handles() {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "archive task panicked during shutdown");
            }
        }
    }
}

/// Runs the operation in its own task so a panic cannot leave the row
/// non-terminal or the registry entry behind.
async fn supervise(inner: Arc<Inner>, op: Operation, cancel: CancellationToken) {
    let id = op.id;
    let worker = {
        let inner = Arc::clone(&inner);
        tokio::spawn(async move { run_operation(&inner, op, &cancel).await })
    };
    if let Err(err) = worker.await {
        tracing::error!(operation_id = %id, error = %err, "archive task panicked");
        fail_abandoned(&inner, id, &format!("archive task panicked: {err}")).await;
    }
    inner.registry.remove(id);
}

async fn fail_abandoned(inner: &Inner, id: Uuid, message: &str) {
    let mut op = match inner.repo.get_operation(id).await {
        Ok(Some(op)) => op,
        Ok(None) => return,
        Err(err) => {
            tracing::error!(operation_id = %id, error = %err, "failed to load abandoned operation");
            return;
        }
    };
    if op.status.is_terminal() || op.fail(message).is_err() {
        return;
    }
    if let Err(err) = inner.repo.update_operation(&op).await {
        tracing::error!(operation_id = %id, error = %err, "failed to persist abandoned operation");
    }
}

async fn run_operation(inner: &Inner, mut op: Operation, cancel: &CancellationToken) {
    let id = op.id;
    let outcome = drive(inner, &mut op, cancel).await;

    let finished = match outcome {
        Ok(()) => op.complete(),
        Err(AppError::Cancelled(_)) => op.cancel(CANCELLED_MESSAGE),
        Err(err) => op.fail(err.to_string()),
    };
    if let Err(err) = finished {
        tracing::error!(operation_id = %id, error = %err, "invalid final transition");
    }

    if let Err(err) = inner.repo.update_operation(&op).await {
        tracing::error!(operation_id = %id, error = %err, "failed to persist final status");
        return;
    }
    match op.status {
        OperationStatus::Completed => {
            tracing::info!(operation_id = %id, posts = op.progress_current, "archive completed")
        }
        status => tracing::warn!(
            operation_id = %id,
            status = %status,
            error = op.error.as_deref().unwrap_or_default(),
            "archive stopped"
        ),
    }
}

async fn drive(inner: &Inner, op: &mut Operation, cancel: &CancellationToken) -> Result<()> {
    op.transition(OperationStatus::Running)?;
    inner.repo.update_operation(op).await?;

    let subject = op.subject_did.clone();
    snapshot_profile(inner, op, cancel).await?;

    let mut cursor: Option<String> = None;
    loop {
        if cancel.is_cancelled() {
            return Err(AppError::Cancelled(CANCELLED_MESSAGE.into()));
        }
        inner.limiter.acquire(cancel).await?;

        let page = inner.fetcher.fetch_page(&subject, cursor.as_deref(), inner.page_size).await?;

        let mut new_records = 0u64;
        for record in &page.records {
            let persisted = persist_record(inner, op.kind, record).await;
            // Counted once handled; the final status write carries it on an early exit.
            op.advance(1);
            let is_new = match persisted {
                Ok(is_new) => is_new,
                Err(err) => {
                    tracing::warn!(operation_id = %op.id, uri = %record.post.uri, error = %err, "skipping record");
                    continue;
                }
            };
            if is_new {
                new_records += 1;
            }
            if is_new || op.kind == OperationKind::Refresh {
                archive_media(inner, op.id, record, cancel).await?;
            }
        }

        save_progress(inner, op).await;
        tracing::debug!(
            operation_id = %op.id,
            records = page.records.len(),
            new_records,
            current = op.progress_current,
            total = op.progress_total,
            "page archived"
        );

        if page.is_exhausted() {
            return Ok(());
        }
        if op.kind == OperationKind::Incremental && new_records == 0 {
            tracing::info!(operation_id = %op.id, "no new posts on page, stopping incremental run");
            return Ok(());
        }
        cursor = page.next_cursor;
    }
}

async fn save_progress(inner: &Inner, op: &Operation) {
    if let Err(err) = inner.repo.update_operation(op).await {
        tracing::warn!(operation_id = %op.id, error = %err, "failed to persist progress");
    }
}

/// Best effort. Only cancellation escapes.
async fn snapshot_profile(inner: &Inner, op: &mut Operation, cancel: &CancellationToken) -> Result<()> {
    inner.limiter.acquire(cancel).await?;
    match inner.fetcher.fetch_profile(&op.subject_did).await {
        Ok(profile) => {
            op.estimate_total(profile.posts_count);
            if let Err(err) = inner.repo.insert_profile(&profile).await {
                tracing::warn!(operation_id = %op.id, error = %err, "failed to store profile snapshot");
            }
        }
        Err(err) => {
            tracing::warn!(operation_id = %op.id, error = %err, "profile snapshot unavailable");
        }
    }
    Ok(())
}

/// Returns true when the post was not archived before.
async fn persist_record(inner: &Inner, kind: OperationKind, record: &FetchedPost) -> Result<bool> {
    match kind {
        OperationKind::Refresh => inner.repo.upsert_post(&record.post).await,
        OperationKind::Initial | OperationKind::Incremental => inner.repo.insert_post(&record.post).await,
    }
}

/// Downloads each media reference of `record` in order. Individual failures
/// are logged; only cancellation escapes.
async fn archive_media(
    inner: &Inner,
    operation_id: Uuid,
    record: &FetchedPost,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(embed) = &record.embed else {
        return Ok(());
    };
    for request in embed.media_refs(&record.post.uri) {
        inner.limiter.acquire(cancel).await?;
        match inner.store.put(&request).await {
            Ok(stored) => {
                if let Err(err) = inner.repo.save_media(&stored.blob, &record.post.uri).await {
                    tracing::warn!(%operation_id, hash = %stored.blob.hash, error = %err, "failed to record media");
                }
            }
            Err(err) => {
                tracing::warn!(%operation_id, url = %request.source_url, error = %err, "media download failed");
            }
        }
    }
    Ok(())
}
