//! Serializers for exported posts.
//!
//! Every chunk depends only on the posts it holds and their position in the
//! whole result set, so any batching produces the same bytes.

use chrono::{DateTime, SecondsFormat, Utc};
use sa_core::{AppError, ExportFormat, Post, Result};

pub const CSV_HEADER: [&str; 16] = [
    "uri",
    "cid",
    "author_did",
    "text",
    "created_at",
    "indexed_at",
    "archived_at",
    "like_count",
    "repost_count",
    "reply_count",
    "quote_count",
    "is_reply",
    "reply_parent",
    "embed_type",
    "embed_data",
    "labels",
];

fn csv_err(err: csv::Error) -> AppError {
    AppError::Internal(format!("csv encoding failed: {err}"))
}

fn timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Copy)]
pub struct PostEncoder {
    format: ExportFormat,
}

impl PostEncoder {
    pub fn new(format: ExportFormat) -> Self {
        Self { format }
    }

    /// Bytes written before the first post.
    pub fn begin(&self) -> Result<Vec<u8>> {
        match self.format {
            ExportFormat::Csv => {
                let mut writer = csv::Writer::from_writer(Vec::new());
                writer.write_record(CSV_HEADER).map_err(csv_err)?;
                writer.into_inner().map_err(|e| AppError::Internal(e.to_string()))
            }
            ExportFormat::Json => Ok(b"[\n".to_vec()),
            ExportFormat::Jsonl => Ok(Vec::new()),
        }
    }

    /// Encodes `posts`, the first of which sits at `first_index` in the export.
    pub fn encode_batch(&self, posts: &[Post], first_index: u64) -> Result<Vec<u8>> {
        match self.format {
            ExportFormat::Csv => {
                let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(Vec::new());
                for post in posts {
                    writer.write_record(csv_row(post)).map_err(csv_err)?;
                }
                writer.into_inner().map_err(|e| AppError::Internal(e.to_string()))
            }
            ExportFormat::Json => {
                let mut out = Vec::new();
                for (i, post) in posts.iter().enumerate() {
                    if first_index + i as u64 > 0 {
                        out.extend_from_slice(b",\n");
                    }
                    serde_json::to_writer(&mut out, post)?;
                }
                Ok(out)
            }
            ExportFormat::Jsonl => {
                let mut out = Vec::new();
                for post in posts {
                    serde_json::to_writer(&mut out, post)?;
                    out.push(b'\n');
                }
                Ok(out)
            }
        }
    }

    /// Bytes written after the last post; `written` is the number of posts encoded.
    pub fn finish(&self, written: u64) -> Vec<u8> {
        match self.format {
            ExportFormat::Json if written > 0 => b"\n]\n".to_vec(),
            ExportFormat::Json => b"]\n".to_vec(),
            ExportFormat::Csv | ExportFormat::Jsonl => Vec::new(),
        }
    }
}

fn csv_row(post: &Post) -> [String; 16] {
    [
        post.uri.clone(),
        post.cid.clone(),
        post.author_did.clone(),
        post.text.clone(),
        timestamp(post.created_at),
        timestamp(post.indexed_at),
        timestamp(post.archived_at),
        post.like_count.to_string(),
        post.repost_count.to_string(),
        post.reply_count.to_string(),
        post.quote_count.to_string(),
        post.is_reply.to_string(),
        post.reply_parent.clone().unwrap_or_default(),
        post.embed_type.to_string(),
        post.embed_data.clone().unwrap_or_default(),
        post.labels.clone().unwrap_or_default(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::post;

    fn encode_all(format: ExportFormat, posts: &[Post], batch: usize) -> Vec<u8> {
        let encoder = PostEncoder::new(format);
        let mut out = encoder.begin().unwrap();
        for (i, chunk) in posts.chunks(batch).enumerate() {
            out.extend(encoder.encode_batch(chunk, (i * batch) as u64).unwrap());
        }
        out.extend(encoder.finish(posts.len() as u64));
        out
    }

    #[test]
    fn test_empty_exports_are_valid() {
        let json = encode_all(ExportFormat::Json, &[], 4);
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, serde_json::json!([]));

        assert!(encode_all(ExportFormat::Jsonl, &[], 4).is_empty());

        let csv = String::from_utf8(encode_all(ExportFormat::Csv, &[], 4)).unwrap();
        assert_eq!(csv.lines().count(), 1);
        assert!(csv.starts_with("uri,cid,author_did,text,created_at"));
    }

    #[test]
    fn test_json_array_parses_back() {
        let posts: Vec<Post> = (1..=3).map(|n| post(n, 1_700_000_000 - i64::from(n))).collect();
        let bytes = encode_all(ExportFormat::Json, &posts, 2);
        let parsed: Vec<Post> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, posts);
        assert_eq!(String::from_utf8(bytes).unwrap().lines().count(), 5);
    }

    #[test]
    fn test_jsonl_one_object_per_line() {
        let posts: Vec<Post> = (1..=3).map(|n| post(n, 1_700_000_000)).collect();
        let text = String::from_utf8(encode_all(ExportFormat::Jsonl, &posts, 1)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let second: Post = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second, posts[1]);
    }

    #[test]
    fn test_csv_quotes_awkward_text() {
        let mut p = post(1, 1_700_000_000);
        p.text = "line one\nsaid \"hi\", then left".into();
        p.reply_parent = Some("at://did:plc:bob/app.bsky.feed.post/9".into());
        let bytes = encode_all(ExportFormat::Csv, &[p], 10);

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader.headers().unwrap().clone();
        assert_eq!(headers.len(), CSV_HEADER.len());
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(&rows[0][3], "line one\nsaid \"hi\", then left");
        assert_eq!(&rows[0][4], "2023-11-14T22:13:20.000000Z");
        assert_eq!(&rows[0][12], "at://did:plc:bob/app.bsky.feed.post/9");
    }
}
