//! Pulls one page of an author's feed at a time and normalizes it into posts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sa_core::{is_namespaced_uri, AppError, Post, Profile, Result, SignedTransport, XrpcQuery};
use serde_json::Value;

use crate::embed::Embed;

pub const AUTHOR_FEED_METHOD: &str = "app.bsky.feed.getAuthorFeed";
pub const PROFILE_METHOD: &str = "app.bsky.actor.getProfile";

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// `0` selects the default, anything else is clamped to `1..=100`.
pub fn clamp_page_size(page_size: u32) -> u32 {
    if page_size == 0 {
        DEFAULT_PAGE_SIZE
    } else {
        page_size.min(MAX_PAGE_SIZE)
    }
}

/// A normalized post together with its parsed embed.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedPost {
    pub post: Post,
    pub embed: Option<Embed>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedPage {
    pub records: Vec<FetchedPost>,
    pub next_cursor: Option<String>,
}

impl FeedPage {
    pub fn is_exhausted(&self) -> bool {
        self.records.is_empty() || self.next_cursor.as_deref().is_none_or(str::is_empty)
    }
}

pub struct PageFetcher {
    transport: Arc<dyn SignedTransport>,
}

impl PageFetcher {
    pub fn new(transport: Arc<dyn SignedTransport>) -> Self {
        Self { transport }
    }

    pub async fn fetch_page(&self, actor: &str, cursor: Option<&str>, page_size: u32) -> Result<FeedPage> {
        let mut query = XrpcQuery::new(AUTHOR_FEED_METHOD)
            .param("actor", actor)
            .param("limit", clamp_page_size(page_size).to_string());
        if let Some(cursor) = cursor.filter(|c| !c.is_empty()) {
            query = query.param("cursor", cursor);
        }

        let body = self.transport.query(actor, &query).await?;
        let archived_at = Utc::now();

        let records = match body.get("feed").and_then(Value::as_array) {
            Some(items) => items
                .iter()
                .filter_map(|item| match normalize_feed_item(item, archived_at) {
                    Some(record) => Some(record),
                    None => {
                        tracing::warn!(actor, "dropping feed item without a usable post");
                        None
                    }
                })
                .collect(),
            None => {
                tracing::warn!(actor, "feed response has no feed array");
                Vec::new()
            }
        };

        Ok(FeedPage {
            records,
            next_cursor: body.get("cursor").and_then(Value::as_str).map(str::to_string),
        })
    }

    pub async fn fetch_profile(&self, actor: &str) -> Result<Profile> {
        let query = XrpcQuery::new(PROFILE_METHOD).param("actor", actor);
        let body = self.transport.query(actor, &query).await?;
        normalize_profile(&body, Utc::now())
            .ok_or_else(|| AppError::Remote(format!("profile response for {actor} has no did or handle")))
    }
}

fn counter(value: &Value, key: &str) -> u64 {
    value.get(key).and_then(Value::as_u64).unwrap_or(0)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()).map(str::to_string)
}

fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let raw = value?.as_str()?;
    DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.with_timezone(&Utc))
}

/// `None` when the item has no post, uri, cid or author.
pub fn normalize_feed_item(item: &Value, archived_at: DateTime<Utc>) -> Option<FetchedPost> {
    let post = item.get("post")?;
    let uri = string_field(post, "uri").filter(|uri| is_namespaced_uri(uri))?;
    let cid = string_field(post, "cid")?;
    let author_did = post.get("author").and_then(|a| string_field(a, "did"))?;

    // Each record field falls back to its zero value on its own.
    let record = post.get("record").cloned().unwrap_or(Value::Null);
    let text = record.get("text").and_then(Value::as_str).unwrap_or_default().to_string();
    let created_at = parse_timestamp(record.get("createdAt")).unwrap_or_default();
    let reply_parent = record
        .get("reply")
        .and_then(|r| r.get("parent"))
        .and_then(|p| string_field(p, "uri"));

    let embed = post.get("embed").filter(|e| !e.is_null()).map(|raw| (Embed::parse(raw), raw.to_string()));
    let labels = post
        .get("labels")
        .filter(|l| l.as_array().is_some_and(|a| !a.is_empty()) || l.is_object())
        .map(Value::to_string);

    let post = Post {
        uri,
        cid,
        author_did,
        text,
        created_at,
        indexed_at: parse_timestamp(post.get("indexedAt")).unwrap_or(archived_at),
        archived_at,
        like_count: counter(post, "likeCount"),
        repost_count: counter(post, "repostCount"),
        reply_count: counter(post, "replyCount"),
        quote_count: counter(post, "quoteCount"),
        is_reply: reply_parent.is_some(),
        reply_parent,
        embed_type: embed.as_ref().map(|(e, _)| e.embed_type()).unwrap_or_default(),
        embed_data: embed.as_ref().map(|(_, raw)| raw.clone()),
        labels,
    };

    Some(FetchedPost {
        post,
        embed: embed.map(|(e, _)| e),
    })
}

fn normalize_profile(body: &Value, snapshot_at: DateTime<Utc>) -> Option<Profile> {
    Some(Profile {
        did: string_field(body, "did")?,
        snapshot_at,
        handle: string_field(body, "handle")?,
        display_name: string_field(body, "displayName"),
        description: string_field(body, "description"),
        avatar: string_field(body, "avatar"),
        banner: string_field(body, "banner"),
        followers_count: counter(body, "followersCount"),
        follows_count: counter(body, "followsCount"),
        posts_count: counter(body, "postsCount"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sa_core::{EmbedType, MockSignedTransport};
    use serde_json::json;

    fn feed_item(rkey: &str) -> Value {
        json!({
            "post": {
                "uri": format!("at://did:plc:alice/app.bsky.feed.post/{rkey}"),
                "cid": format!("cid-{rkey}"),
                "author": {"did": "did:plc:alice", "handle": "alice.test"},
                "record": {"text": format!("post {rkey}"), "createdAt": "2024-05-01T12:00:00.000Z"},
                "indexedAt": "2024-05-01T12:00:01.000Z",
                "likeCount": 3
            }
        })
    }

    fn fetcher_returning(body: Value) -> PageFetcher {
        let mut transport = MockSignedTransport::new();
        transport.expect_query().returning(move |_, _| Ok(body.clone()));
        PageFetcher::new(Arc::new(transport))
    }

    #[test]
    fn test_page_size_clamp() {
        assert_eq!(clamp_page_size(0), 50);
        assert_eq!(clamp_page_size(1), 1);
        assert_eq!(clamp_page_size(100), 100);
        assert_eq!(clamp_page_size(5000), 100);
    }

    #[tokio::test]
    async fn test_query_carries_actor_limit_and_cursor() {
        let mut transport = MockSignedTransport::new();
        transport
            .expect_query()
            .withf(|subject, query| {
                subject == "did:plc:alice"
                    && query.method == AUTHOR_FEED_METHOD
                    && query.get("actor") == Some("did:plc:alice")
                    && query.get("limit") == Some("100")
                    && query.get("cursor") == Some("abc")
            })
            .times(1)
            .returning(|_, _| Ok(json!({"feed": [], "cursor": ""})));

        let fetcher = PageFetcher::new(Arc::new(transport));
        let page = fetcher.fetch_page("did:plc:alice", Some("abc"), 500).await.unwrap();
        assert!(page.is_exhausted());
    }

    #[tokio::test]
    async fn test_first_page_sends_no_cursor() {
        let mut transport = MockSignedTransport::new();
        transport
            .expect_query()
            .withf(|_, query| query.get("cursor").is_none() && query.get("limit") == Some("50"))
            .returning(|_, _| Ok(json!({"feed": []})));

        let fetcher = PageFetcher::new(Arc::new(transport));
        fetcher.fetch_page("did:plc:alice", None, 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_normalizes_and_drops_unusable_items() {
        let body = json!({
            "feed": [
                feed_item("1"),
                {"reason": {"$type": "app.bsky.feed.defs#reasonRepost"}},
                {"post": {"uri": "not-a-uri", "cid": "c", "author": {"did": "did:plc:alice"}}},
                {"post": {"uri": "at://did:plc:alice/app.bsky.feed.post/3", "author": {"did": "did:plc:alice"}}},
                feed_item("2")
            ],
            "cursor": "next"
        });
        let page = fetcher_returning(body).fetch_page("did:plc:alice", None, 10).await.unwrap();

        assert_eq!(page.records.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("next"));
        assert!(!page.is_exhausted());

        let post = &page.records[0].post;
        assert_eq!(post.text, "post 1");
        assert_eq!(post.like_count, 3);
        assert_eq!((post.repost_count, post.reply_count, post.quote_count), (0, 0, 0));
        assert_eq!(post.created_at.to_rfc3339(), "2024-05-01T12:00:00+00:00");
        assert_eq!(post.embed_type, EmbedType::None);
        assert!(post.validate().is_ok());
    }

    #[test]
    fn test_bad_record_fields_fall_back_to_zero_values() {
        let item = json!({
            "post": {
                "uri": "at://did:plc:alice/app.bsky.feed.post/9",
                "cid": "c9",
                "author": {"did": "did:plc:alice"},
                "record": {"text": 42, "createdAt": "yesterday",
                           "reply": {"parent": {"uri": "at://did:plc:bob/app.bsky.feed.post/1"}}},
                "likeCount": -4,
                "labels": []
            }
        });
        let now = Utc::now();
        let fetched = normalize_feed_item(&item, now).unwrap();
        assert_eq!(fetched.post.text, "");
        assert_eq!(fetched.post.created_at, DateTime::<Utc>::default());
        assert_eq!(fetched.post.indexed_at, now);
        assert_eq!(fetched.post.like_count, 0);
        assert!(fetched.post.is_reply);
        assert_eq!(fetched.post.reply_parent.as_deref(), Some("at://did:plc:bob/app.bsky.feed.post/1"));
        assert_eq!(fetched.post.labels, None);
    }

    #[test]
    fn test_embed_and_labels_are_kept_verbatim() {
        let mut item = feed_item("5");
        let embed = json!({"$type": "app.bsky.embed.images#view", "images": [{"fullsize": "https://cdn/x"}]});
        item["post"]["embed"] = embed.clone();
        item["post"]["labels"] = json!([{"val": "nudity", "src": "did:plc:mod"}]);

        let fetched = normalize_feed_item(&item, Utc::now()).unwrap();
        assert_eq!(fetched.post.embed_type, EmbedType::Images);
        let stored: Value = serde_json::from_str(fetched.post.embed_data.as_deref().unwrap()).unwrap();
        assert_eq!(stored, embed);
        assert!(fetched.post.labels.unwrap().contains("nudity"));
        assert!(matches!(fetched.embed, Some(Embed::Images(ref images)) if images.len() == 1));
    }

    #[tokio::test]
    async fn test_transport_errors_propagate() {
        let mut transport = MockSignedTransport::new();
        transport
            .expect_query()
            .returning(|_, _| Err(AppError::Remote("503 Service Unavailable".into())));
        let fetcher = PageFetcher::new(Arc::new(transport));
        let err = fetcher.fetch_page("did:plc:alice", None, 10).await.unwrap_err();
        assert!(matches!(err, AppError::Remote(_)));
    }

    #[tokio::test]
    async fn test_fetch_profile() {
        let fetcher = fetcher_returning(json!({
            "did": "did:plc:alice",
            "handle": "alice.test",
            "displayName": "Alice",
            "followersCount": 10,
            "postsCount": 2500
        }));
        let profile = fetcher.fetch_profile("did:plc:alice").await.unwrap();
        assert_eq!(profile.handle, "alice.test");
        assert_eq!(profile.display_name.as_deref(), Some("Alice"));
        assert_eq!(profile.posts_count, 2500);
        assert_eq!(profile.follows_count, 0);

        let broken = fetcher_returning(json!({"error": "InvalidRequest"}));
        assert!(broken.fetch_profile("did:plc:alice").await.is_err());
    }
}
