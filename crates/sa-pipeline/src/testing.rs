//! Fakes shared by the unit tests of this crate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sa_core::{
    AppError, ContentStore, EmbedType, MediaBlob, MediaRequest, Post, Result, SignedTransport, StoredMedia,
    XrpcQuery,
};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use crate::fetcher::PROFILE_METHOD;

pub const SUBJECT: &str = "did:plc:alice";

pub fn post_uri(n: u32) -> String {
    format!("at://{SUBJECT}/app.bsky.feed.post/{n:05}")
}

pub fn post(n: u32, created_secs: i64) -> Post {
    let created_at = DateTime::from_timestamp(created_secs, 0).unwrap();
    Post {
        uri: post_uri(n),
        cid: format!("bafy{n}"),
        author_did: SUBJECT.to_string(),
        text: format!("post number {n}"),
        created_at,
        indexed_at: created_at,
        archived_at: created_at,
        like_count: u64::from(n),
        repost_count: 0,
        reply_count: 0,
        quote_count: 0,
        is_reply: false,
        reply_parent: None,
        embed_type: EmbedType::None,
        embed_data: None,
        labels: None,
    }
}

pub fn feed_item(n: u32, likes: u64) -> Value {
    json!({
        "post": {
            "uri": post_uri(n),
            "cid": format!("bafy{n}"),
            "author": {"did": SUBJECT, "handle": "alice.test"},
            "record": {"text": format!("post number {n}"), "createdAt": "2024-03-01T00:00:00Z"},
            "indexedAt": "2024-03-01T00:00:05Z",
            "likeCount": likes
        }
    })
}

pub fn feed_item_with_images(n: u32, urls: &[&str]) -> Value {
    let mut item = feed_item(n, 0);
    let images: Vec<Value> = urls.iter().map(|url| json!({"fullsize": url, "alt": "pic"})).collect();
    item["post"]["embed"] = json!({"$type": "app.bsky.embed.images#view", "images": images});
    item
}

/// Serves feed pages keyed by the request cursor (`""` for the first page).
#[derive(Default)]
pub struct ScriptedTransport {
    pub pages: HashMap<String, Value>,
    pub profile: Option<Value>,
    pub fail_feed: bool,
    /// Each feed call consumes one permit when set
    pub gate: Option<Arc<Semaphore>>,
    pub feed_calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn with_pages(pages: Vec<(&str, Value)>) -> Self {
        Self {
            pages: pages.into_iter().map(|(cursor, body)| (cursor.to_string(), body)).collect(),
            ..Default::default()
        }
    }

    pub fn feed_call_count(&self) -> usize {
        self.feed_calls.lock().len()
    }
}

#[async_trait]
impl SignedTransport for ScriptedTransport {
    async fn query(&self, _subject: &str, query: &XrpcQuery) -> Result<Value> {
        if query.method == PROFILE_METHOD {
            return self.profile.clone().ok_or_else(|| AppError::Remote("profile not found".into()));
        }
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        let cursor = query.get("cursor").unwrap_or_default().to_string();
        self.feed_calls.lock().push(cursor.clone());
        if self.fail_feed {
            return Err(AppError::Remote("503 Service Unavailable".into()));
        }
        Ok(self.pages.get(&cursor).cloned().unwrap_or_else(|| json!({"feed": []})))
    }
}

/// Accepts every URL except those containing `broken`.
#[derive(Default)]
pub struct RecordingStore {
    pub urls: Mutex<Vec<String>>,
}

#[async_trait]
impl ContentStore for RecordingStore {
    async fn put(&self, request: &MediaRequest) -> Result<StoredMedia> {
        let seen = {
            let mut urls = self.urls.lock();
            urls.push(request.source_url.clone());
            urls.len()
        };
        if request.source_url.contains("broken") {
            return Err(AppError::Download(format!("{} returned 404 Not Found", request.source_url)));
        }
        let hash = format!("{seen:0>64}");
        Ok(StoredMedia {
            blob: MediaBlob {
                local_path: format!("{}/{}/{hash}.jpg", &hash[..2], &hash[2..4]),
                hash,
                post_uri: request.owner_uri.clone(),
                mime_type: "image/jpeg".into(),
                size: 16,
                width: request.width,
                height: request.height,
                alt_text: request.alt_text.clone(),
                created_at: Utc::now(),
            },
            was_already_present: false,
        })
    }

    fn resolve(&self, local_path: &str) -> PathBuf {
        PathBuf::from(local_path)
    }
}
