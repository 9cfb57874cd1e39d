/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::now_ms;

/// Activities already accepted by the host's ActivityPub inbox, plus its
/// followers table. Read-only from the pipeline's point of view.
#[derive(Clone)]
pub struct LocalActivityStore {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredActivity {
    pub activity_id: String,
    pub created_at_ms: i64,
    pub actor_id: String,
    pub kind: String,
    pub activity: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowerProfile {
    pub name: String,
    pub icon_url: String,
}

const INBOUND_TYPES: &str = "'Like','Announce','Create'";

impl LocalActivityStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let path = db_path.as_ref().to_path_buf();
        let conn = Connection::open(&path).with_context(|| format!("open activity db: {}", path.display()))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ap_activities (
              activity_id TEXT PRIMARY KEY,
              created_at_ms INTEGER NOT NULL,
              actor_id TEXT NULL,
              type TEXT NULL,
              activity_json BLOB NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ap_activities_created ON ap_activities(created_at_ms);

            CREATE TABLE IF NOT EXISTS ap_followers (
              actor_id TEXT PRIMARY KEY,
              name TEXT NOT NULL DEFAULT '',
              icon_url TEXT NOT NULL DEFAULT '',
              created_at_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(Self { path })
    }

    /// Inbound Like/Announce/Create rows ordered by `(created_at_ms, activity_id)`,
    /// strictly after the given position. Without `after_id` every row at
    /// `since_ms` counts as already seen.
    pub fn list_inbound_after(&self, since_ms: i64, after_id: Option<&str>, limit: u32) -> Result<Vec<StoredActivity>> {
        let conn = Connection::open(&self.path)?;
        let limit = limit.clamp(1, 500) as i64;
        let mut stmt = conn.prepare(&format!(
            "SELECT activity_id, created_at_ms, actor_id, type, activity_json FROM ap_activities
             WHERE (created_at_ms > ?1 OR (?2 IS NOT NULL AND created_at_ms = ?1 AND activity_id > ?2))
               AND type IN ({INBOUND_TYPES})
             ORDER BY created_at_ms ASC, activity_id ASC LIMIT ?3"
        ))?;
        let mut rows = stmt.query(params![since_ms, after_id, limit])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let raw: Vec<u8> = row.get(4)?;
            let activity: Value = match serde_json::from_slice(&raw) {
                Ok(v) => v,
                Err(_) => Value::Null,
            };
            out.push(StoredActivity {
                activity_id: row.get(0)?,
                created_at_ms: row.get(1)?,
                actor_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                kind: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                activity,
            });
        }
        Ok(out)
    }

    pub fn follower_profile(&self, actor_id: &str) -> Result<Option<FollowerProfile>> {
        let conn = Connection::open(&self.path)?;
        conn.query_row(
            "SELECT name, icon_url FROM ap_followers WHERE actor_id=?1",
            params![actor_id],
            |r| {
                Ok(FollowerProfile {
                    name: r.get(0)?,
                    icon_url: r.get(1)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    /// Icon URL embedded in any stored activity's `actor` object.
    pub fn actor_icon_from_activities(&self, actor_id: &str) -> Result<Option<String>> {
        let conn = Connection::open(&self.path)?;
        let mut stmt = conn.prepare(
            "SELECT activity_json FROM ap_activities WHERE actor_id=?1 ORDER BY created_at_ms DESC LIMIT 20",
        )?;
        let mut rows = stmt.query(params![actor_id])?;
        while let Some(row) = rows.next()? {
            let raw: Vec<u8> = row.get(0)?;
            let Ok(v) = serde_json::from_slice::<Value>(&raw) else {
                continue;
            };
            if let Some(icon) = v.get("actor").and_then(icon_url_of) {
                return Ok(Some(icon));
            }
        }
        Ok(None)
    }

    pub fn store_activity_at(&self, activity: &Value, created_at_ms: i64) -> Result<()> {
        let id = activity
            .get("id")
            .and_then(|v| v.as_str())
            .context("activity without id")?;
        let actor = actor_id_of(activity);
        let kind = activity.get("type").and_then(|v| v.as_str());
        let bytes = serde_json::to_vec(activity)?;
        let conn = Connection::open(&self.path)?;
        conn.execute(
            "INSERT OR IGNORE INTO ap_activities(activity_id, created_at_ms, actor_id, type, activity_json) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, created_at_ms, actor, kind, bytes],
        )?;
        Ok(())
    }

    pub fn add_follower(&self, actor_id: &str, name: &str, icon_url: &str) -> Result<()> {
        let conn = Connection::open(&self.path)?;
        conn.execute(
            r#"
            INSERT INTO ap_followers(actor_id, name, icon_url, created_at_ms) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(actor_id) DO UPDATE SET name=excluded.name, icon_url=excluded.icon_url
            "#,
            params![actor_id, name, icon_url, now_ms()],
        )?;
        Ok(())
    }
}

/// `actor` may be a bare id or an embedded object.
pub fn actor_id_of(activity: &Value) -> Option<String> {
    match activity.get("actor")? {
        Value::String(s) => Some(s.clone()),
        Value::Object(o) => o.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

/// `icon` may be a string, an Image object, or an array of either.
pub fn icon_url_of(actor: &Value) -> Option<String> {
    fn from_icon(v: &Value) -> Option<String> {
        match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Object(o) => o.get("url").and_then(from_icon),
            Value::Array(a) => a.iter().find_map(from_icon),
            _ => None,
        }
    }
    actor.get("icon").and_then(from_icon)
}
