//! # Core Traits (Ports)
//!
//! Any plugin must implement these traits to be used by the pipeline.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{ExportJob, MediaBlob, Operation, Post, PostFilter, Profile};

/// One read-only XRPC call (`GET /xrpc/<method>?<params>`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrpcQuery {
    pub method: String,
    pub params: Vec<(String, String)>,
}

impl XrpcQuery {
    pub fn new(method: impl Into<String>) -> Self {
        Self { method: method.into(), params: Vec::new() }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }
}

/// Authenticated access to the remote API on behalf of a subject.
/// Outbound requests are already signed; the pipeline treats this as opaque.
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait SignedTransport: Send + Sync {
    async fn query(&self, subject: &str, query: &XrpcQuery) -> Result<serde_json::Value>;
}

/// Durable persistence for archived data and job bookkeeping.
#[async_trait]
pub trait ArchiveRepo: Send + Sync {
    // Post Operations
    /// Inserts the post if its URI is unknown. Returns true when a row was written.
    async fn insert_post(&self, post: &Post) -> Result<bool>;
    /// Inserts the post or refreshes counters and labels of the archived row.
    /// Returns true when the post was new.
    async fn upsert_post(&self, post: &Post) -> Result<bool>;
    async fn get_post(&self, uri: &str) -> Result<Option<Post>>;
    async fn count_posts(&self, filter: &PostFilter) -> Result<u64>;
    /// Ordered by `created_at DESC, uri ASC`.
    async fn list_posts(&self, filter: &PostFilter, limit: u64, offset: u64) -> Result<Vec<Post>>;

    // Profile Operations
    async fn insert_profile(&self, profile: &Profile) -> Result<()>;
    async fn latest_profile(&self, did: &str) -> Result<Option<Profile>>;

    // Media Operations
    /// Records the blob (first writer wins) and links it to `post_uri`.
    async fn save_media(&self, blob: &MediaBlob, post_uri: &str) -> Result<()>;
    async fn media_for_posts(&self, post_uris: &[String]) -> Result<Vec<MediaBlob>>;
    /// Distinct blobs linked to posts matching `filter`.
    async fn count_media(&self, filter: &PostFilter) -> Result<u64>;

    // Operation bookkeeping
    /// Fails with `AppError::Conflict` when the subject already has a non-terminal operation.
    async fn create_operation(&self, op: &Operation) -> Result<()>;
    async fn update_operation(&self, op: &Operation) -> Result<()>;
    async fn get_operation(&self, id: Uuid) -> Result<Option<Operation>>;
    async fn active_operation(&self, subject_did: &str) -> Result<Option<Operation>>;
    async fn count_operations(&self, subject_did: &str) -> Result<u64>;
    /// Marks every non-terminal operation failed with `message`. Run at startup,
    /// before any operation is spawned, to release rows left by a dead process.
    async fn fail_interrupted_operations(&self, message: &str) -> Result<u64>;

    // Export job bookkeeping
    async fn save_export_job(&self, job: &ExportJob) -> Result<()>;
    async fn get_export_job(&self, id: &str) -> Result<Option<ExportJob>>;
}

/// Parameters of one media download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaRequest {
    pub source_url: String,
    pub owner_uri: String,
    pub declared_mime: Option<String>,
    pub alt_text: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

/// Result of a content-addressed put.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMedia {
    pub blob: MediaBlob,
    pub was_already_present: bool,
}

/// Content-addressed, deduplicating blob storage for downloaded media.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Downloads `request.source_url` and stores the bytes under their hash.
    /// Performs no retries.
    async fn put(&self, request: &MediaRequest) -> Result<StoredMedia>;
    /// Absolute path of a blob's `local_path`.
    fn resolve(&self, local_path: &str) -> std::path::PathBuf;
}
