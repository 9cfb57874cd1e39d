/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use backfeed_protocol::{Author, InteractionType, Notification, PostSummary, SourceTag, TypeCounts};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ms_to_rfc3339, now_ms};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Deduplicating store for normalized interactions.
///
/// Every write goes through [`ConversationDb::upsert`], keyed on
/// `(canonical_url, platform_id)`; the table carries a UNIQUE constraint on
/// that pair so concurrent cycles cannot create duplicates.
#[derive(Clone)]
pub struct ConversationDb {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ConversationItem {
    pub id: i64,
    pub canonical_url: String,
    pub platform_id: String,
    pub source: SourceTag,
    #[serde(rename = "type")]
    pub kind: InteractionType,
    pub author: Author,
    pub content: Option<String>,
    pub url: String,
    pub published: Option<String>,
    pub received_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewConversationItem {
    pub canonical_url: String,
    pub platform_id: String,
    pub source: SourceTag,
    pub kind: InteractionType,
    pub author: Author,
    pub content: Option<String>,
    pub url: String,
    pub published: Option<String>,
}

impl NewConversationItem {
    pub fn from_notification(n: &Notification, canonical_url: &str) -> Self {
        Self {
            canonical_url: canonical_url.to_string(),
            platform_id: n.platform_id.clone(),
            source: n.source,
            kind: n.kind,
            author: n.author.clone(),
            content: n.content.clone(),
            url: n.url.clone(),
            published: n.published.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

impl ConversationDb {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = open_conn(&path)?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS conversation_items (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              canonical_url TEXT NOT NULL,
              platform_id TEXT NOT NULL,
              source TEXT NOT NULL,
              type TEXT NOT NULL,
              author_name TEXT NOT NULL DEFAULT '',
              author_url TEXT NOT NULL DEFAULT '',
              author_photo TEXT NOT NULL DEFAULT '',
              content TEXT NULL,
              url TEXT NOT NULL DEFAULT '',
              published TEXT NULL,
              received_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE(canonical_url, platform_id)
            );
            CREATE INDEX IF NOT EXISTS idx_conv_canonical_received ON conversation_items(canonical_url, received_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_conv_source_received ON conversation_items(source, received_at_ms DESC);
            CREATE INDEX IF NOT EXISTS idx_conv_author_url ON conversation_items(author_url);

            CREATE TABLE IF NOT EXISTS conversation_state (
              id TEXT PRIMARY KEY,
              state_json TEXT NOT NULL,
              updated_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { path })
    }

    pub(crate) fn conn(&self) -> Result<Connection> {
        open_conn(&self.path)
    }

    pub fn health_check(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    pub fn upsert(&self, item: &NewConversationItem) -> Result<UpsertOutcome> {
        self.upsert_at(item, now_ms())
    }

    /// Atomic find-and-update on `(canonical_url, platform_id)`.
    ///
    /// `received_at_ms` is only written on first insert; `updated_at_ms` on
    /// every call. An empty incoming author photo never clears a stored one.
    pub fn upsert_at(&self, item: &NewConversationItem, at_ms: i64) -> Result<UpsertOutcome> {
        if item.canonical_url.trim().is_empty() {
            anyhow::bail!("canonical_url must not be empty");
        }
        if item.platform_id.trim().is_empty() {
            anyhow::bail!("platform_id must not be empty");
        }
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM conversation_items WHERE canonical_url=?1 AND platform_id=?2",
                params![item.canonical_url, item.platform_id],
                |r| r.get(0),
            )
            .optional()?;
        tx.execute(
            r#"
            INSERT INTO conversation_items(
              canonical_url, platform_id, source, type, author_name, author_url, author_photo,
              content, url, published, received_at_ms, updated_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
            ON CONFLICT(canonical_url, platform_id) DO UPDATE SET
              source=excluded.source,
              type=excluded.type,
              author_name=(CASE WHEN excluded.author_name <> '' THEN excluded.author_name ELSE conversation_items.author_name END),
              author_url=(CASE WHEN excluded.author_url <> '' THEN excluded.author_url ELSE conversation_items.author_url END),
              author_photo=(CASE WHEN excluded.author_photo <> '' THEN excluded.author_photo ELSE conversation_items.author_photo END),
              content=COALESCE(excluded.content, conversation_items.content),
              url=(CASE WHEN excluded.url <> '' THEN excluded.url ELSE conversation_items.url END),
              published=COALESCE(excluded.published, conversation_items.published),
              updated_at_ms=excluded.updated_at_ms
            "#,
            params![
                item.canonical_url,
                item.platform_id,
                item.source.as_str(),
                item.kind.as_str(),
                item.author.name,
                item.author.url,
                item.author.photo,
                item.content,
                item.url,
                item.published,
                at_ms,
            ],
        )?;
        tx.commit()?;
        Ok(if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        })
    }

    pub fn get(&self, canonical_url: &str, platform_id: &str) -> Result<Option<ConversationItem>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {ITEM_COLUMNS} FROM conversation_items WHERE canonical_url=?1 AND platform_id=?2"),
            params![canonical_url, platform_id],
            item_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Items for one canonical post (or every post when `None`), newest first.
    /// An empty `kinds` means every interaction type.
    pub fn items_for(
        &self,
        canonical_url: Option<&str>,
        kinds: &[InteractionType],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<ConversationItem>> {
        let limit = limit.clamp(1, 500) as i64;
        let offset = offset.min(1_000_000) as i64;
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<String> = Vec::new();
        if let Some(url) = canonical_url.map(str::trim).filter(|s| !s.is_empty()) {
            args.push(url.to_string());
            clauses.push(format!("canonical_url=?{}", args.len()));
        }
        if !kinds.is_empty() {
            let mut marks = Vec::with_capacity(kinds.len());
            for kind in kinds {
                args.push(kind.as_str().to_string());
                marks.push(format!("?{}", args.len()));
            }
            clauses.push(format!("type IN ({})", marks.join(",")));
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT {ITEM_COLUMNS} FROM conversation_items {where_sql} ORDER BY received_at_ms DESC, id DESC LIMIT {limit} OFFSET {offset}"
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), item_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Per-post counts, most recently active post first.
    pub fn summaries(&self, limit: u32, offset: u32) -> Result<Vec<PostSummary>> {
        let limit = limit.clamp(1, 500) as i64;
        let offset = offset.min(1_000_000) as i64;
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT canonical_url,
                   SUM(CASE WHEN type='reply' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN type='like' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN type='repost' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN type='bookmark' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN type='mention' THEN 1 ELSE 0 END),
                   MAX(received_at_ms) AS last_activity
            FROM conversation_items
            GROUP BY canonical_url
            ORDER BY last_activity DESC, canonical_url ASC
            LIMIT ?1 OFFSET ?2
            "#,
        )?;
        let rows = stmt.query_map(params![limit, offset], |r| {
            let counts = TypeCounts {
                reply: r.get::<_, i64>(1)? as u64,
                like: r.get::<_, i64>(2)? as u64,
                repost: r.get::<_, i64>(3)? as u64,
                bookmark: r.get::<_, i64>(4)? as u64,
                mention: r.get::<_, i64>(5)? as u64,
            };
            let last: i64 = r.get(6)?;
            Ok(PostSummary {
                canonical_url: r.get(0)?,
                total: counts.total(),
                counts,
                last_activity: ms_to_rfc3339(last).unwrap_or_default(),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn()?;
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM conversation_items", [], |r| r.get(0))?;
        Ok(total as u64)
    }

    /// Distinct author profile URLs that still have no photo.
    pub fn authors_missing_photo(&self, limit: u32) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT DISTINCT author_url FROM conversation_items
            WHERE author_photo='' AND author_url <> ''
            ORDER BY author_url
            LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![limit.max(1) as i64], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn known_photo_for_author(&self, author_url: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT author_photo FROM conversation_items WHERE author_url=?1 AND author_photo <> '' ORDER BY updated_at_ms DESC LIMIT 1",
            params![author_url],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fills the photo on every item by `author_url` that has none; returns rows touched.
    pub fn set_author_photo(&self, author_url: &str, photo: &str) -> Result<u64> {
        if author_url.trim().is_empty() || photo.trim().is_empty() {
            return Ok(0);
        }
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE conversation_items SET author_photo=?2, updated_at_ms=?3 WHERE author_url=?1 AND author_photo=''",
            params![author_url, photo.trim(), now_ms()],
        )?;
        Ok(n as u64)
    }
}

const ITEM_COLUMNS: &str = "id, canonical_url, platform_id, source, type, author_name, author_url, author_photo, content, url, published, received_at_ms, updated_at_ms";

fn item_from_row(r: &Row<'_>) -> rusqlite::Result<ConversationItem> {
    let source: String = r.get(3)?;
    let kind: String = r.get(4)?;
    Ok(ConversationItem {
        id: r.get(0)?,
        canonical_url: r.get(1)?,
        platform_id: r.get(2)?,
        source: SourceTag::parse(&source).unwrap_or(SourceTag::Webmention),
        kind: InteractionType::parse(&kind).unwrap_or(InteractionType::Mention),
        author: Author {
            name: r.get(5)?,
            url: r.get(6)?,
            photo: r.get(7)?,
        },
        content: r.get(8)?,
        url: r.get(9)?,
        published: r.get(10)?,
        received_at_ms: r.get(11)?,
        updated_at_ms: r.get(12)?,
    })
}

/// Concurrent poll cycles write through separate connections; wait for the
/// writer lock instead of failing with SQLITE_BUSY.
fn open_conn(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path).with_context(|| format!("open db: {}", path.display()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}
