/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use backfeed_protocol::SourceTag;
use rusqlite::{params, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::conversation_db::ConversationDb;

const POLL_STATE_ID: &str = "poll_state";

/// Resumption state shared by every poll cycle; one document per deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PollCursorState {
    #[serde(default)]
    pub sources: BTreeMap<SourceTag, SourceCursor>,
    #[serde(default)]
    pub avatar_backfill_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCursor {
    /// Opaque to everything but the owning adapter.
    #[serde(default)]
    pub cursor: Option<String>,
    #[serde(default)]
    pub cursor_updated_at_ms: Option<i64>,
    #[serde(default)]
    pub last_poll_at_ms: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at_ms: Option<i64>,
}

impl PollCursorState {
    pub fn cursor_for(&self, source: SourceTag) -> Option<&str> {
        self.sources.get(&source).and_then(|s| s.cursor.as_deref())
    }
}

impl ConversationDb {
    pub fn load_poll_state(&self) -> Result<PollCursorState> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        read_state_tx(&tx)
    }

    /// Success for `source`: clears its error and, only when the adapter
    /// returned one, stores the new cursor.
    pub fn record_poll_success(&self, source: SourceTag, next_cursor: Option<&str>, at_ms: i64) -> Result<()> {
        self.mutate_poll_state(|state| {
            let entry = state.sources.entry(source).or_default();
            entry.last_poll_at_ms = Some(at_ms);
            entry.last_error = None;
            entry.last_error_at_ms = None;
            if let Some(cursor) = next_cursor {
                entry.cursor = Some(cursor.to_string());
                entry.cursor_updated_at_ms = Some(at_ms);
            }
        })
    }

    /// Failure for `source`: the cursor is left untouched.
    pub fn record_poll_failure(&self, source: SourceTag, error: &str, at_ms: i64) -> Result<()> {
        self.mutate_poll_state(|state| {
            let entry = state.sources.entry(source).or_default();
            entry.last_poll_at_ms = Some(at_ms);
            entry.last_error = Some(error.to_string());
            entry.last_error_at_ms = Some(at_ms);
        })
    }

    pub fn mark_avatar_backfill_complete(&self) -> Result<()> {
        self.mutate_poll_state(|state| state.avatar_backfill_complete = true)
    }

    fn mutate_poll_state(&self, f: impl FnOnce(&mut PollCursorState)) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut state = read_state_tx(&tx)?;
        f(&mut state);
        let text = serde_json::to_string(&state).context("encode poll state")?;
        tx.execute(
            r#"
            INSERT INTO conversation_state(id, state_json, updated_at_ms) VALUES (?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET state_json=excluded.state_json, updated_at_ms=excluded.updated_at_ms
            "#,
            params![POLL_STATE_ID, text, crate::now_ms()],
        )?;
        tx.commit()?;
        Ok(())
    }
}

fn read_state_tx(tx: &Transaction<'_>) -> Result<PollCursorState> {
    let raw: Option<String> = tx
        .query_row(
            "SELECT state_json FROM conversation_state WHERE id=?1",
            params![POLL_STATE_ID],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(text) => serde_json::from_str(&text).context("decode poll state"),
        None => Ok(PollCursorState::default()),
    }
}
