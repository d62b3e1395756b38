//! # sa-storage-local
//! skyarchive/crates/sa-plugins/sa-storage-local/src/lib.rs
//! Local filesystem implementation of `ContentStore`.
//! Features: Content-addressable storage, directory sharding, and download deduplication.

pub mod sniff;

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use sa_core::error::{AppError, Result};
use sa_core::models::MediaBlob;
use sa_core::traits::{ContentStore, MediaRequest, StoredMedia};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::sync::Mutex;

/// Remote CDNs reject clients that do not look like a browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Default download timeout (60s)
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Default maximum media size (100MB)
pub const DEFAULT_MAX_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for all media (e.g., "./data/media")
    pub root_path: PathBuf,
    pub max_size: u64,
    pub timeout: Duration,
}

impl StoreConfig {
    pub fn new(root_path: impl Into<PathBuf>) -> Self {
        Self {
            root_path: root_path.into(),
            max_size: DEFAULT_MAX_SIZE,
            timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    pub fn with_max_size(mut self, max_size: u64) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Counters for observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub writes: u64,
    pub dedup_hits: u64,
    pub bytes_written: u64,
}

pub struct LocalContentStore {
    config: StoreConfig,
    client: reqwest::Client,
    /// Serializes the existence check and write for one hash
    locks: DashMap<String, Arc<Mutex<()>>>,
    writes: AtomicU64,
    dedup_hits: AtomicU64,
    bytes_written: AtomicU64,
}

impl LocalContentStore {
    pub fn new(config: StoreConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(BROWSER_USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build download client: {e}")))?;
        Ok(Self::with_client(config, client))
    }

    pub fn with_client(config: StoreConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            locks: DashMap::new(),
            writes: AtomicU64::new(0),
            dedup_hits: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.config.root_path
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            writes: self.writes.load(Ordering::Relaxed),
            dedup_hits: self.dedup_hits.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
        }
    }

    /// Generates a sharded relative path: "ab/cd/abcd...hash.ext"
    pub fn sharded_path(hash: &str, ext: &str) -> String {
        format!("{}/{}/{}.{}", &hash[0..2], &hash[2..4], hash, ext)
    }

    /// Stores bytes the caller already holds. `response_mime` is the
    /// `Content-Type` the server answered with, if any.
    pub async fn store_bytes(
        &self,
        bytes: Bytes,
        request: &MediaRequest,
        response_mime: Option<&str>,
    ) -> Result<StoredMedia> {
        // 1. Calculate Hash
        let hash = hex::encode(Sha256::digest(&bytes));

        let mime_type = sniff::choose_mime(&bytes, request.declared_mime.as_deref(), response_mime);
        let ext = sniff::choose_extension(&mime_type, &request.source_url);

        let (width, height) = match (request.width, request.height) {
            (Some(w), Some(h)) => (Some(w), Some(h)),
            _ if mime_type.starts_with("image/") => match probe_dimensions(&bytes) {
                Some((w, h)) => (Some(w), Some(h)),
                None => (request.width, request.height),
            },
            _ => (request.width, request.height),
        };

        // 2. Save Original (unless the hash is already stored under any extension)
        let lock = self.locks.entry(hash.clone()).or_default().clone();
        let stored: Result<(String, bool)> = async {
            let _guard = lock.lock().await;
            if let Some(existing) = self.find_stored(&hash).await? {
                return Ok((existing, false));
            }
            let local_path = Self::sharded_path(&hash, &ext);
            self.write_atomic(&self.config.root_path.join(&local_path), &bytes).await?;
            Ok((local_path, true))
        }
        .await;
        drop(lock);
        self.locks.remove_if(&hash, |_, l| Arc::strong_count(l) == 1);
        let (local_path, written) = stored?;

        let blob = MediaBlob {
            hash,
            post_uri: request.owner_uri.clone(),
            mime_type,
            local_path,
            size: bytes.len() as u64,
            width,
            height,
            alt_text: request.alt_text.clone(),
            created_at: Utc::now(),
        };

        if written {
            self.writes.fetch_add(1, Ordering::Relaxed);
            self.bytes_written.fetch_add(blob.size, Ordering::Relaxed);
            tracing::debug!(hash = %blob.hash, path = %blob.local_path, size = blob.size, "stored media");
        } else {
            self.dedup_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(hash = %blob.hash, owner = %request.owner_uri, "media already present");
        }

        Ok(StoredMedia { blob, was_already_present: !written })
    }

    /// Relative path of a completed file for `hash`, whatever its extension.
    async fn find_stored(&self, hash: &str) -> Result<Option<String>> {
        let shard = format!("{}/{}", &hash[0..2], &hash[2..4]);
        let mut entries = match fs::read_dir(self.config.root_path.join(&shard)).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((stem, ext)) = name.split_once('.') else { continue };
            if stem == hash && !ext.ends_with("partial") {
                return Ok(Some(format!("{shard}/{name}")));
            }
        }
        Ok(None)
    }

    async fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut partial = target.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        fs::write(&partial, bytes).await?;
        if let Err(err) = fs::rename(&partial, target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<(Bytes, Option<String>)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AppError::Download(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Download(format!("{url}: HTTP {status}")));
        }

        let max = self.config.max_size;
        if response.content_length().is_some_and(|len| len > max) {
            return Err(AppError::Download(format!("{url}: larger than {max} bytes")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::Download(format!("{url}: {e}")))?;
        if bytes.len() as u64 > max {
            return Err(AppError::Download(format!("{url}: larger than {max} bytes")));
        }
        Ok((bytes, content_type))
    }
}

/// Reads only the image header; undecodable data yields None.
fn probe_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

#[async_trait]
impl ContentStore for LocalContentStore {
    /// Downloads and stores under the SHA-256 of the body.
    /// Identical bytes from any URL land on the same path and are written once.
    async fn put(&self, request: &MediaRequest) -> Result<StoredMedia> {
        let (bytes, content_type) = self.download(&request.source_url).await?;
        self.store_bytes(bytes, request, content_type.as_deref()).await
    }

    fn resolve(&self, local_path: &str) -> PathBuf {
        self.config.root_path.join(local_path)
    }
}
