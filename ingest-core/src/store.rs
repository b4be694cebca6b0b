//! Article metadata and content persistence.
//!
//! Two write paths share one table keyed by URL:
//! - `upsert_metadata` (poller): insert-or-update, never drops extracted content.
//! - `update_content` (workers): update-only, never inserts a missing row.
//!
//! `mark` only moves from incomplete to complete on either path.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::info;

use crate::error::Result;
use crate::feed::FeedItem;

/// Stored in place of the article body when extraction produced no text.
pub const PLACEHOLDER_CONTENT: &str = "No content available";

/// Articles at or above this many words get the highest priority.
pub const LONG_ARTICLE_WORDS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mark {
    Incomplete,
    Complete,
}

impl Mark {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incomplete => "incomplete",
            Self::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("complete") {
            Self::Complete
        } else {
            Self::Incomplete
        }
    }
}

impl fmt::Display for Mark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Empty = 0,
    Short = 1,
    Long = 2,
}

impl Priority {
    pub fn from_word_count(words: usize) -> Self {
        match words {
            0 => Self::Empty,
            n if n < LONG_ARTICLE_WORDS => Self::Short,
            _ => Self::Long,
        }
    }

    pub fn value(self) -> i16 {
        self as i16
    }

    pub fn from_value(value: i16) -> Self {
        match value {
            v if v <= 0 => Self::Empty,
            1 => Self::Short,
            _ => Self::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    Process,
}

impl ArticleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
        }
    }
}

/// Metadata written by the poller for every link that passes the dedup gate.
#[derive(Debug, Clone, PartialEq)]
pub struct ArticleMetadata {
    pub url: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub image_url: Option<String>,
}

impl From<&FeedItem> for ArticleMetadata {
    fn from(item: &FeedItem) -> Self {
        Self {
            url: item.link.clone(),
            title: item.title.clone(),
            published_at: item.published_at,
            image_url: item.image_url.clone(),
        }
    }
}

/// Result of one extraction, ready to be written by `update_content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    pub content: String,
    pub mark: Mark,
    pub priority: Priority,
}

impl ContentUpdate {
    pub fn from_text(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Self {
                content: PLACEHOLDER_CONTENT.to_owned(),
                mark: Mark::Incomplete,
                priority: Priority::Empty,
            };
        }
        Self {
            content: text.to_owned(),
            mark: Mark::Complete,
            priority: Priority::from_word_count(text.split_whitespace().count()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.mark == Mark::Complete
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub content: Option<String>,
    pub mark: Mark,
    pub priority: Priority,
    pub status: String,
    pub image_url: Option<String>,
    pub last_processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait ArticleStore: Send + Sync {
    /// Insert or refresh metadata for `meta.url`; resets status and timestamp.
    async fn upsert_metadata(&self, meta: &ArticleMetadata) -> Result<()>;

    /// Write extraction output. Returns `false` if no row exists for `url`.
    async fn update_content(&self, url: &str, update: &ContentUpdate) -> Result<bool>;

    async fn find(&self, url: &str) -> Result<Option<ArticleRecord>>;
}

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS articles (
    url TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    published_at TIMESTAMPTZ,
    mark TEXT NOT NULL DEFAULT 'incomplete',
    content TEXT,
    priority SMALLINT NOT NULL DEFAULT 0,
    last_processed_time TIMESTAMPTZ NOT NULL,
    status TEXT NOT NULL,
    img TEXT
)"#;

const UPSERT_METADATA: &str = r#"
INSERT INTO articles (url, title, published_at, mark, content, priority, last_processed_time, status, img)
VALUES ($1, $2, $3, 'incomplete', NULL, 0, $4, $5, $6)
ON CONFLICT (url) DO UPDATE SET
    title = EXCLUDED.title,
    published_at = EXCLUDED.published_at,
    status = EXCLUDED.status,
    img = EXCLUDED.img,
    last_processed_time = EXCLUDED.last_processed_time,
    mark = CASE WHEN articles.content IS NULL THEN 'incomplete' ELSE articles.mark END"#;

// Column references on the right-hand side read the row before the update.
const UPDATE_CONTENT: &str = r#"
UPDATE articles SET
    content = CASE WHEN articles.mark = 'complete' AND $3 = 'incomplete' THEN articles.content ELSE $2 END,
    priority = CASE WHEN articles.mark = 'complete' AND $3 = 'incomplete' THEN articles.priority ELSE $4 END,
    mark = CASE WHEN articles.mark = 'complete' THEN 'complete' ELSE $3 END,
    last_processed_time = $5
WHERE url = $1"#;

const SELECT_ARTICLE: &str = r#"
SELECT url, title, published_at, mark, content, priority, last_processed_time, status, img
FROM articles WHERE url = $1"#;

#[derive(Debug, Clone)]
pub struct PgArticleStore {
    pool: PgPool,
}

impl PgArticleStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(10).connect(dsn).await?;
        info!("connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ArticleStore for PgArticleStore {
    async fn upsert_metadata(&self, meta: &ArticleMetadata) -> Result<()> {
        sqlx::query(UPSERT_METADATA)
            .bind(&meta.url)
            .bind(&meta.title)
            .bind(meta.published_at)
            .bind(Utc::now())
            .bind(ArticleStatus::Process.as_str())
            .bind(meta.image_url.as_deref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_content(&self, url: &str, update: &ContentUpdate) -> Result<bool> {
        let result = sqlx::query(UPDATE_CONTENT)
            .bind(url)
            .bind(&update.content)
            .bind(update.mark.as_str())
            .bind(update.priority.value())
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, url: &str) -> Result<Option<ArticleRecord>> {
        let row = sqlx::query(SELECT_ARTICLE)
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mark: String = row.try_get("mark")?;
        let priority: i16 = row.try_get("priority")?;
        Ok(Some(ArticleRecord {
            url: row.try_get("url")?,
            title: row.try_get("title")?,
            published_at: row.try_get("published_at")?,
            content: row.try_get("content")?,
            mark: Mark::parse(&mark),
            priority: Priority::from_value(priority),
            status: row.try_get("status")?,
            image_url: row.try_get("img")?,
            last_processed_at: row.try_get("last_processed_time")?,
        }))
    }
}

/// Map-backed store with the same semantics as the Postgres one.
#[derive(Debug, Clone, Default)]
pub struct MemoryArticleStore {
    rows: Arc<RwLock<HashMap<String, ArticleRecord>>>,
}

impl MemoryArticleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl ArticleStore for MemoryArticleStore {
    async fn upsert_metadata(&self, meta: &ArticleMetadata) -> Result<()> {
        let now = Utc::now();
        let mut rows = self.rows.write().await;
        match rows.get_mut(&meta.url) {
            Some(row) => {
                row.title = meta.title.clone();
                row.published_at = Some(meta.published_at);
                row.status = ArticleStatus::Process.as_str().to_owned();
                row.image_url = meta.image_url.clone();
                row.last_processed_at = now;
                if row.content.is_none() {
                    row.mark = Mark::Incomplete;
                }
            }
            None => {
                rows.insert(
                    meta.url.clone(),
                    ArticleRecord {
                        url: meta.url.clone(),
                        title: meta.title.clone(),
                        published_at: Some(meta.published_at),
                        content: None,
                        mark: Mark::Incomplete,
                        priority: Priority::Empty,
                        status: ArticleStatus::Process.as_str().to_owned(),
                        image_url: meta.image_url.clone(),
                        last_processed_at: now,
                    },
                );
            }
        }
        Ok(())
    }

    async fn update_content(&self, url: &str, update: &ContentUpdate) -> Result<bool> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(url) else {
            return Ok(false);
        };
        let keep_existing = row.mark == Mark::Complete && !update.is_complete();
        if !keep_existing {
            row.content = Some(update.content.clone());
            row.priority = update.priority;
            row.mark = update.mark;
        }
        row.last_processed_at = Utc::now();
        Ok(true)
    }

    async fn find(&self, url: &str) -> Result<Option<ArticleRecord>> {
        Ok(self.rows.read().await.get(url).cloned())
    }
}
