//! # Domain Models
//!
//! These structs represent the archived entities and the two long-running
//! job kinds (archive operations and export jobs).
//! We use UUID v7 for time-ordered, globally unique identification.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};

/// Returns true for `scheme://authority/...` style identifiers.
pub fn is_namespaced_uri(uri: &str) -> bool {
    match uri.split_once("://") {
        Some((scheme, rest)) => {
            !scheme.is_empty()
                && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
                && rest.split('/').next().is_some_and(|authority| !authority.is_empty())
        }
        None => false,
    }
}

/// Classification of a post's attached rich content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbedType {
    #[default]
    None,
    Images,
    External,
    Record,
    RecordWithMedia,
}

impl EmbedType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Images => "images",
            Self::External => "external",
            Self::Record => "record",
            Self::RecordWithMedia => "record_with_media",
        }
    }

    /// Whether a post with this embed can carry downloadable media.
    pub const fn may_have_media(&self) -> bool {
        matches!(self, Self::Images | Self::External | Self::RecordWithMedia)
    }
}

impl fmt::Display for EmbedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmbedType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" | "" => Ok(Self::None),
            "images" => Ok(Self::Images),
            "external" => Ok(Self::External),
            "record" => Ok(Self::Record),
            "record_with_media" => Ok(Self::RecordWithMedia),
            other => Err(AppError::ValidationError(format!("unknown embed type '{other}'"))),
        }
    }
}

/// An archived post. Immutable once archived, except for engagement
/// counters and labels which a refresh run may update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    /// Globally unique, namespaced (`at://did/collection/rkey`)
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub text: String,
    /// Author-supplied; the Unix epoch when absent or unparsable
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    pub archived_at: DateTime<Utc>,
    pub like_count: u64,
    pub repost_count: u64,
    pub reply_count: u64,
    pub quote_count: u64,
    pub is_reply: bool,
    pub reply_parent: Option<String>,
    pub embed_type: EmbedType,
    /// Raw embed JSON, schema owned by the remote API
    pub embed_data: Option<String>,
    /// Raw label JSON
    pub labels: Option<String>,
}

impl Post {
    /// Checks the invariants every archived post must satisfy.
    pub fn validate(&self) -> Result<()> {
        if !is_namespaced_uri(&self.uri) {
            return Err(AppError::ValidationError(format!("post uri '{}' is not namespaced", self.uri)));
        }
        if self.cid.is_empty() {
            return Err(AppError::ValidationError(format!("post {} has no cid", self.uri)));
        }
        if self.author_did.is_empty() {
            return Err(AppError::ValidationError(format!("post {} has no author", self.uri)));
        }
        Ok(())
    }
}

/// Point-in-time snapshot of an author's profile. Never updated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub did: String,
    pub snapshot_at: DateTime<Utc>,
    pub handle: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub avatar: Option<String>,
    pub banner: Option<String>,
    pub followers_count: u64,
    pub follows_count: u64,
    pub posts_count: u64,
}

/// A downloaded media file, keyed by the SHA-256 of its bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaBlob {
    pub hash: String,
    /// The post that first referenced these bytes
    pub post_uri: String,
    pub mime_type: String,
    /// Relative to the media root: `ab/cd/<hash>.<ext>`
    pub local_path: String,
    pub size: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub alt_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MediaBlob {
    /// File name used when the blob is copied out of the sharded tree.
    pub fn file_name(&self) -> &str {
        self.local_path.rsplit('/').next().unwrap_or(&self.local_path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Full history walk, keeps already archived posts untouched
    Initial,
    /// Stops after the first page that contains nothing new
    Incremental,
    /// Full history walk that also refreshes counters and labels
    Refresh,
}

impl OperationKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::Incremental => "incremental",
            Self::Refresh => "refresh",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "initial" => Ok(Self::Initial),
            "incremental" => Ok(Self::Incremental),
            "refresh" => Ok(Self::Refresh),
            other => Err(AppError::ValidationError(format!("unknown operation kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// `pending -> running -> {completed | failed | cancelled}`.
    /// A pending operation may also fail or be cancelled before it starts.
    pub const fn can_transition_to(&self, next: OperationStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Cancelled),
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::ValidationError(format!("unknown operation status '{other}'"))),
        }
    }
}

/// One archive run for a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub subject_did: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub progress_current: u64,
    /// 0 while unknown
    pub progress_total: u64,
    /// Present iff the operation failed or was cancelled
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Operation {
    pub fn new(subject_did: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            subject_did: subject_did.into(),
            kind,
            status: OperationStatus::Pending,
            progress_current: 0,
            progress_total: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Moves to `next`, stamping the completion time on terminal states.
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(AppError::ValidationError(format!(
                "operation {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(OperationStatus::Completed)?;
        self.progress_total = self.progress_current;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(OperationStatus::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(OperationStatus::Cancelled)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Records `delta` more processed posts. Counters never move backwards
    /// and `current` never exceeds a known total.
    pub fn advance(&mut self, delta: u64) {
        self.progress_current = self.progress_current.saturating_add(delta);
        if self.progress_total != 0 && self.progress_total < self.progress_current {
            self.progress_total = self.progress_current;
        }
    }

    /// Seeds the total from an external estimate such as the profile's post count.
    pub fn estimate_total(&mut self, total: u64) {
        self.progress_total = self.progress_total.max(total).max(self.progress_current);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Csv,
    Json,
    Jsonl,
}

impl ExportFormat {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Jsonl => "jsonl",
        }
    }

    pub const fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            "jsonl" | "ndjson" => Ok(Self::Jsonl),
            other => Err(AppError::ValidationError(format!("unknown export format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl ExportStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::ValidationError(format!("unknown export status '{other}'"))),
        }
    }
}

/// Which posts an export (or any ordered range query) covers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PostFilter {
    pub author_did: String,
    /// Inclusive lower bound on `created_at`
    pub since: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`
    pub until: Option<DateTime<Utc>>,
}

impl PostFilter {
    pub fn for_author(author_did: impl Into<String>) -> Self {
        Self { author_did: author_did.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportOptions {
    pub subject_did: String,
    pub format: ExportFormat,
    /// Each job writes into its own directory under this root
    pub output_root: PathBuf,
    pub include_media: bool,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl ExportOptions {
    pub fn filter(&self) -> PostFilter {
        PostFilter {
            author_did: self.subject_did.clone(),
            since: self.since,
            until: self.until,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportJob {
    /// Time-ordered UUID v7
    pub id: String,
    pub options: ExportOptions,
    pub status: ExportStatus,
    pub posts_processed: u64,
    pub posts_total: u64,
    pub media_copied: u64,
    pub media_total: u64,
    pub output_dir: PathBuf,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExportJob {
    pub fn new(options: ExportOptions) -> Self {
        let id = Uuid::now_v7().to_string();
        let output_dir = options.output_root.join(format!("export-{id}"));
        Self {
            id,
            options,
            status: ExportStatus::Queued,
            posts_processed: 0,
            posts_total: 0,
            media_copied: 0,
            media_total: 0,
            output_dir,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn progress(&self) -> ExportProgress {
        ExportProgress {
            job_id: self.id.clone(),
            posts_processed: self.posts_processed,
            posts_total: self.posts_total,
            media_copied: self.media_copied,
            media_total: self.media_total,
        }
    }
}

/// Snapshot sent to progress listeners after every export batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportProgress {
    pub job_id: String,
    pub posts_processed: u64,
    pub posts_total: u64,
    pub media_copied: u64,
    pub media_total: u64,
}
