//! # sa-db-sqlite Implementation
//!
//! This module implements the data mapping between the SQLite relational model
//! and the `sa-core` domain models.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sa_core::error::{AppError, Result};
use sa_core::models::{
    EmbedType, ExportJob, ExportStatus, MediaBlob, Operation, OperationKind, OperationStatus, Post,
    PostFilter, Profile,
};
use sa_core::traits::ArchiveRepo;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use uuid::Uuid;

const SCHEMA: &str = include_str!("../migrations/0001_init.sql");

const POST_COLUMNS: &str = "uri, cid, author_did, text, created_at, indexed_at, archived_at, \
     like_count, repost_count, reply_count, quote_count, is_reply, reply_parent, \
     embed_type, embed_data, labels";

pub struct SqliteArchiveRepo {
    pool: SqlitePool,
}

impl SqliteArchiveRepo {
    /// Opens (or creates) the database at `url` and applies the schema.
    ///
    /// `sqlite::memory:` gets a single, never-recycled connection so every
    /// query sees the same in-memory database.
    pub async fn new(url: &str) -> Result<Self> {
        let in_memory = url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(db_err)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(8)
        };

        let pool = pool_options.connect_with(options).await.map_err(db_err)?;
        let repo = Self { pool };
        repo.migrate().await?;
        tracing::debug!(url, "sqlite archive repo ready");
        Ok(repo)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}

fn db_err(err: sqlx::Error) -> AppError {
    AppError::Storage(err.to_string())
}

// Helpers for integer/timestamp conversion. SQLite only stores signed 64-bit integers.
fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn get_count(row: &SqliteRow, column: &str) -> std::result::Result<u64, sqlx::Error> {
    Ok(row.try_get::<i64, _>(column)?.max(0) as u64)
}

fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

fn from_micros(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or_default()
}

fn parse_column<T: FromStr<Err = AppError>>(row: &SqliteRow, column: &str) -> Result<T> {
    let raw: String = row.try_get(column).map_err(db_err)?;
    raw.parse()
}

fn row_to_post(row: &SqliteRow) -> Result<Post> {
    let embed_raw: String = row.try_get("embed_type").map_err(db_err)?;
    Ok(Post {
        uri: row.try_get("uri").map_err(db_err)?,
        cid: row.try_get("cid").map_err(db_err)?,
        author_did: row.try_get("author_did").map_err(db_err)?,
        text: row.try_get("text").map_err(db_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?),
        indexed_at: from_micros(row.try_get("indexed_at").map_err(db_err)?),
        archived_at: from_micros(row.try_get("archived_at").map_err(db_err)?),
        like_count: get_count(row, "like_count").map_err(db_err)?,
        repost_count: get_count(row, "repost_count").map_err(db_err)?,
        reply_count: get_count(row, "reply_count").map_err(db_err)?,
        quote_count: get_count(row, "quote_count").map_err(db_err)?,
        is_reply: row.try_get("is_reply").map_err(db_err)?,
        reply_parent: row.try_get("reply_parent").map_err(db_err)?,
        // An unknown classification written by a newer version reads back as none.
        embed_type: embed_raw.parse().unwrap_or(EmbedType::None),
        embed_data: row.try_get("embed_data").map_err(db_err)?,
        labels: row.try_get("labels").map_err(db_err)?,
    })
}

fn row_to_profile(row: &SqliteRow) -> Result<Profile> {
    Ok(Profile {
        did: row.try_get("did").map_err(db_err)?,
        snapshot_at: from_micros(row.try_get("snapshot_at").map_err(db_err)?),
        handle: row.try_get("handle").map_err(db_err)?,
        display_name: row.try_get("display_name").map_err(db_err)?,
        description: row.try_get("description").map_err(db_err)?,
        avatar: row.try_get("avatar").map_err(db_err)?,
        banner: row.try_get("banner").map_err(db_err)?,
        followers_count: get_count(row, "followers_count").map_err(db_err)?,
        follows_count: get_count(row, "follows_count").map_err(db_err)?,
        posts_count: get_count(row, "posts_count").map_err(db_err)?,
    })
}

fn row_to_media(row: &SqliteRow) -> Result<MediaBlob> {
    let width: Option<i64> = row.try_get("width").map_err(db_err)?;
    let height: Option<i64> = row.try_get("height").map_err(db_err)?;
    Ok(MediaBlob {
        hash: row.try_get("hash").map_err(db_err)?,
        post_uri: row.try_get("post_uri").map_err(db_err)?,
        mime_type: row.try_get("mime_type").map_err(db_err)?,
        local_path: row.try_get("local_path").map_err(db_err)?,
        size: get_count(row, "size").map_err(db_err)?,
        width: width.and_then(|w| u32::try_from(w).ok()),
        height: height.and_then(|h| u32::try_from(h).ok()),
        alt_text: row.try_get("alt_text").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn row_to_operation(row: &SqliteRow) -> Result<Operation> {
    let id: String = row.try_get("id").map_err(db_err)?;
    Ok(Operation {
        id: Uuid::parse_str(&id).map_err(|e| AppError::Storage(format!("bad operation id '{id}': {e}")))?,
        subject_did: row.try_get("subject_did").map_err(db_err)?,
        kind: parse_column::<OperationKind>(row, "kind")?,
        status: parse_column::<OperationStatus>(row, "status")?,
        progress_current: get_count(row, "progress_current").map_err(db_err)?,
        progress_total: get_count(row, "progress_total").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

fn row_to_export_job(row: &SqliteRow) -> Result<ExportJob> {
    let options: String = row.try_get("options").map_err(db_err)?;
    let output_dir: String = row.try_get("output_dir").map_err(db_err)?;
    Ok(ExportJob {
        id: row.try_get("id").map_err(db_err)?,
        options: serde_json::from_str(&options)?,
        status: parse_column::<ExportStatus>(row, "status")?,
        posts_processed: get_count(row, "posts_processed").map_err(db_err)?,
        posts_total: get_count(row, "posts_total").map_err(db_err)?,
        media_copied: get_count(row, "media_copied").map_err(db_err)?,
        media_total: get_count(row, "media_total").map_err(db_err)?,
        output_dir: PathBuf::from(output_dir),
        error: row.try_get("error").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
    })
}

/// Appends `WHERE` clauses selecting the filter's posts from table alias `p`.
fn push_post_filter(qb: &mut QueryBuilder<'_, Sqlite>, filter: &PostFilter) {
    qb.push(" WHERE p.author_did = ").push_bind(filter.author_did.clone());
    if let Some(since) = filter.since {
        qb.push(" AND p.created_at >= ").push_bind(to_micros(since));
    }
    if let Some(until) = filter.until {
        qb.push(" AND p.created_at < ").push_bind(to_micros(until));
    }
}

fn bind_post<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    post: &'q Post,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&post.uri)
        .bind(&post.cid)
        .bind(&post.author_did)
        .bind(&post.text)
        .bind(to_micros(post.created_at))
        .bind(to_micros(post.indexed_at))
        .bind(to_micros(post.archived_at))
        .bind(to_sql_int(post.like_count))
        .bind(to_sql_int(post.repost_count))
        .bind(to_sql_int(post.reply_count))
        .bind(to_sql_int(post.quote_count))
        .bind(post.is_reply)
        .bind(&post.reply_parent)
        .bind(post.embed_type.as_str())
        .bind(&post.embed_data)
        .bind(&post.labels)
}

#[async_trait]
impl ArchiveRepo for SqliteArchiveRepo {
    async fn insert_post(&self, post: &Post) -> Result<bool> {
        post.validate()?;
        let sql = format!(
            "INSERT OR IGNORE INTO posts ({POST_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        let result = bind_post(sqlx::query(&sql), post)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected() == 1)
    }

    /// Archived text and timestamps stay untouched; only what the remote
    /// side legitimately changes over time is refreshed.
    async fn upsert_post(&self, post: &Post) -> Result<bool> {
        post.validate()?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists = sqlx::query("SELECT 1 FROM posts WHERE uri = ?")
            .bind(&post.uri)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .is_some();

        if exists {
            sqlx::query(
                "UPDATE posts SET like_count = ?, repost_count = ?, reply_count = ?, \
                 quote_count = ?, labels = ? WHERE uri = ?",
            )
            .bind(to_sql_int(post.like_count))
            .bind(to_sql_int(post.repost_count))
            .bind(to_sql_int(post.reply_count))
            .bind(to_sql_int(post.quote_count))
            .bind(&post.labels)
            .bind(&post.uri)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        } else {
            let sql = format!(
                "INSERT INTO posts ({POST_COLUMNS}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
            );
            bind_post(sqlx::query(&sql), post)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)?;
        Ok(!exists)
    }

    async fn get_post(&self, uri: &str) -> Result<Option<Post>> {
        let sql = format!("SELECT {POST_COLUMNS} FROM posts WHERE uri = ?");
        let row = sqlx::query(&sql)
            .bind(uri)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_post).transpose()
    }

    async fn count_posts(&self, filter: &PostFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS n FROM posts p");
        push_post_filter(&mut qb, filter);
        let row = qb.build().fetch_one(&self.pool).await.map_err(db_err)?;
        get_count(&row, "n").map_err(db_err)
    }

    /// Offsets are stable because the order is total: `uri` breaks ties
    /// between posts created in the same microsecond.
    async fn list_posts(&self, filter: &PostFilter, limit: u64, offset: u64) -> Result<Vec<Post>> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {POST_COLUMNS} FROM posts p"));
        push_post_filter(&mut qb, filter);
        qb.push(" ORDER BY p.created_at DESC, p.uri ASC LIMIT ")
            .push_bind(to_sql_int(limit))
            .push(" OFFSET ")
            .push_bind(to_sql_int(offset));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_post).collect()
    }

    async fn insert_profile(&self, profile: &Profile) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO profiles (did, snapshot_at, handle, display_name, description, \
             avatar, banner, followers_count, follows_count, posts_count) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&profile.did)
        .bind(to_micros(profile.snapshot_at))
        .bind(&profile.handle)
        .bind(&profile.display_name)
        .bind(&profile.description)
        .bind(&profile.avatar)
        .bind(&profile.banner)
        .bind(to_sql_int(profile.followers_count))
        .bind(to_sql_int(profile.follows_count))
        .bind(to_sql_int(profile.posts_count))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn latest_profile(&self, did: &str) -> Result<Option<Profile>> {
        let row = sqlx::query("SELECT * FROM profiles WHERE did = ? ORDER BY snapshot_at DESC LIMIT 1")
            .bind(did)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_profile).transpose()
    }

    /// Both inserts share one transaction so a link never points at a missing blob.
    async fn save_media(&self, blob: &MediaBlob, post_uri: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        sqlx::query(
            "INSERT OR IGNORE INTO media (hash, post_uri, mime_type, local_path, size, width, \
             height, alt_text, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&blob.hash)
        .bind(&blob.post_uri)
        .bind(&blob.mime_type)
        .bind(&blob.local_path)
        .bind(to_sql_int(blob.size))
        .bind(blob.width.map(i64::from))
        .bind(blob.height.map(i64::from))
        .bind(&blob.alt_text)
        .bind(blob.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        sqlx::query("INSERT OR IGNORE INTO post_media (post_uri, hash) VALUES (?, ?)")
            .bind(post_uri)
            .bind(&blob.hash)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn media_for_posts(&self, post_uris: &[String]) -> Result<Vec<MediaBlob>> {
        if post_uris.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT DISTINCT m.* FROM media m JOIN post_media pm ON pm.hash = m.hash WHERE pm.post_uri IN (",
        );
        let mut separated = qb.separated(", ");
        for uri in post_uris {
            separated.push_bind(uri.clone());
        }
        separated.push_unseparated(") ORDER BY m.hash");

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(row_to_media).collect()
    }

    async fn count_media(&self, filter: &PostFilter) -> Result<u64> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT COUNT(DISTINCT pm.hash) AS n FROM post_media pm JOIN posts p ON p.uri = pm.post_uri",
        );
        push_post_filter(&mut qb, filter);
        let row = qb.build().fetch_one(&self.pool).await.map_err(db_err)?;
        get_count(&row, "n").map_err(db_err)
    }

    /// The partial unique index on non-terminal rows turns a racing second
    /// start for the same subject into a constraint violation.
    async fn create_operation(&self, op: &Operation) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO operations (id, subject_did, kind, status, progress_current, \
             progress_total, error, started_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(op.id.to_string())
        .bind(&op.subject_did)
        .bind(op.kind.as_str())
        .bind(op.status.as_str())
        .bind(to_sql_int(op.progress_current))
        .bind(to_sql_int(op.progress_total))
        .bind(&op.error)
        .bind(op.started_at)
        .bind(op.completed_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(format!(
                "archive already in progress for {}",
                op.subject_did
            ))),
            Err(e) => Err(db_err(e)),
        }
    }

    async fn update_operation(&self, op: &Operation) -> Result<()> {
        let result = sqlx::query(
            "UPDATE operations SET status = ?, progress_current = ?, progress_total = ?, \
             error = ?, completed_at = ? WHERE id = ?",
        )
        .bind(op.status.as_str())
        .bind(to_sql_int(op.progress_current))
        .bind(to_sql_int(op.progress_total))
        .bind(&op.error)
        .bind(op.completed_at)
        .bind(op.id.to_string())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound("Operation".into(), op.id.to_string()));
        }
        Ok(())
    }

    async fn get_operation(&self, id: Uuid) -> Result<Option<Operation>> {
        let row = sqlx::query("SELECT * FROM operations WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_operation).transpose()
    }

    async fn active_operation(&self, subject_did: &str) -> Result<Option<Operation>> {
        let row = sqlx::query(
            "SELECT * FROM operations WHERE subject_did = ? AND status IN ('pending', 'running') LIMIT 1",
        )
        .bind(subject_did)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_operation).transpose()
    }

    async fn count_operations(&self, subject_did: &str) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM operations WHERE subject_did = ?")
            .bind(subject_did)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        get_count(&row, "n").map_err(db_err)
    }

    async fn fail_interrupted_operations(&self, message: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE operations SET status = 'failed', error = ?, completed_at = ? \
             WHERE status IN ('pending', 'running')",
        )
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn save_export_job(&self, job: &ExportJob) -> Result<()> {
        sqlx::query(
            "INSERT INTO export_jobs (id, options, status, posts_processed, posts_total, \
             media_copied, media_total, output_dir, error, created_at, completed_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET status = excluded.status, \
             posts_processed = excluded.posts_processed, posts_total = excluded.posts_total, \
             media_copied = excluded.media_copied, media_total = excluded.media_total, \
             error = excluded.error, completed_at = excluded.completed_at",
        )
        .bind(&job.id)
        .bind(serde_json::to_string(&job.options)?)
        .bind(job.status.as_str())
        .bind(to_sql_int(job.posts_processed))
        .bind(to_sql_int(job.posts_total))
        .bind(to_sql_int(job.media_copied))
        .bind(to_sql_int(job.media_total))
        .bind(job.output_dir.to_string_lossy().into_owned())
        .bind(&job.error)
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_export_job(&self, id: &str) -> Result<Option<ExportJob>> {
        let row = sqlx::query("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(row_to_export_job).transpose()
    }
}
