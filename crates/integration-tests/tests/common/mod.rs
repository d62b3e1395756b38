//! Shared fixtures: a fake XRPC service on a local port, seeded repositories,
//! and a fully wired pipeline.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::DateTime;
use sa_core::{ArchiveRepo, EmbedType, Post};
use sa_db_sqlite::SqliteArchiveRepo;
use sa_pipeline::{ArchiveController, PageFetcher, RateLimitConfig, RateLimiter};
use sa_storage_local::{LocalContentStore, StoreConfig};
use sa_transport_xrpc::XrpcTransport;
use serde_json::{json, Value};
use tokio::sync::Semaphore;

pub const SUBJECT: &str = "did:plc:integration";

pub fn post_uri(n: u32) -> String {
    format!("at://{SUBJECT}/app.bsky.feed.post/{n:06}")
}

/// Bytes that sniff as PNG; `tag` keeps different images distinct.
pub fn png_bytes(tag: &str) -> Vec<u8> {
    let mut bytes = b"\x89PNG\r\n\x1a\n".to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    bytes
}

pub fn post(n: u32, created_secs: i64) -> Post {
    let created_at = DateTime::from_timestamp(created_secs, 0).unwrap();
    Post {
        uri: post_uri(n),
        cid: format!("bafy{n}"),
        author_did: SUBJECT.to_string(),
        text: format!("archived post {n}"),
        created_at,
        indexed_at: created_at,
        archived_at: created_at,
        like_count: 0,
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

pub async fn seeded_repo(count: u32) -> Arc<SqliteArchiveRepo> {
    let repo = Arc::new(SqliteArchiveRepo::in_memory().await.unwrap());
    for n in 0..count {
        repo.insert_post(&post(n, 1_700_000_000 + i64::from(n))).await.unwrap();
    }
    repo
}

/// Feed item whose images point back at the fake service.
pub fn feed_item(base: &str, n: u32, images: &[&str]) -> Value {
    let mut item = json!({
        "post": {
            "uri": post_uri(n),
            "cid": format!("bafy{n}"),
            "author": {"did": SUBJECT, "handle": "integration.test"},
            "record": {"text": format!("remote post {n}"), "createdAt": format!("2024-04-{:02}T10:00:00Z", n + 1)},
            "indexedAt": "2024-05-01T00:00:00Z",
            "likeCount": n
        }
    });
    if !images.is_empty() {
        let views: Vec<Value> = images
            .iter()
            .map(|name| json!({"fullsize": format!("{base}img/{name}"), "alt": format!("image {name}")}))
            .collect();
        item["post"]["embed"] = json!({"$type": "app.bsky.embed.images#view", "images": views});
    }
    item
}

#[derive(Default)]
pub struct FakeService {
    /// Feed bodies keyed by cursor, `""` for the first page
    pub pages: HashMap<String, Value>,
    pub profile: Option<Value>,
    pub images: HashMap<String, Vec<u8>>,
    /// Each feed request consumes one permit when set
    pub gate: Option<Arc<Semaphore>>,
}

async fn xrpc(
    State(service): State<Arc<FakeService>>,
    UrlPath(method): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    match method.as_str() {
        "app.bsky.actor.getProfile" => match &service.profile {
            Some(profile) => Json(profile.clone()).into_response(),
            None => (StatusCode::BAD_REQUEST, Json(json!({"error": "InvalidRequest"}))).into_response(),
        },
        "app.bsky.feed.getAuthorFeed" => {
            if let Some(gate) = &service.gate {
                gate.acquire().await.unwrap().forget();
            }
            let cursor = params.get("cursor").cloned().unwrap_or_default();
            let body = service.pages.get(&cursor).cloned().unwrap_or_else(|| json!({"feed": []}));
            Json(body).into_response()
        }
        _ => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

async fn image(State(service): State<Arc<FakeService>>, UrlPath(name): UrlPath<String>) -> Response {
    match service.images.get(&name) {
        Some(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Starts the service and returns its base URL (with a trailing slash).
pub async fn serve(service: FakeService) -> String {
    let app = Router::new()
        .route("/xrpc/{method}", get(xrpc))
        .route("/img/{name}", get(image))
        .with_state(Arc::new(service));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

fn local_client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

pub fn media_store(root: &Path) -> Arc<LocalContentStore> {
    Arc::new(LocalContentStore::with_client(StoreConfig::new(root), local_client()))
}

pub fn controller(base: &str, repo: Arc<SqliteArchiveRepo>, store: Arc<LocalContentStore>) -> ArchiveController {
    let transport = XrpcTransport::with_client(local_client(), base, None);
    let limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(1), 10_000).with_burst(500));
    ArchiveController::new(repo, PageFetcher::new(Arc::new(transport)), store, limiter, 2)
}
