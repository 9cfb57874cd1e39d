/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use backfeed_protocol::{Author, InteractionType, Notification, SourceTag};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

use super::{AdapterError, FetchOutcome, SourceAdapter};
use crate::canonical::{is_under_site, CanonicalResolver};
use crate::local_activity::{actor_id_of, icon_url_of, LocalActivityStore, StoredActivity};
use crate::ms_to_rfc3339;

const BATCH_LIMIT: u32 = 200;

/// Reads activities the host's own inbox already accepted. No network.
pub struct ActivityPubAdapter {
    store: Arc<LocalActivityStore>,
    resolver: CanonicalResolver,
    site_url: String,
}

impl ActivityPubAdapter {
    pub fn new(store: Arc<LocalActivityStore>, resolver: CanonicalResolver, site_url: impl Into<String>) -> Self {
        Self {
            store,
            resolver,
            site_url: site_url.into(),
        }
    }

    fn normalize(&self, row: &StoredActivity) -> Result<Option<Notification>, AdapterError> {
        let a = &row.activity;
        let (kind, subject, own_url, content, published) = match row.kind.as_str() {
            "Like" | "Announce" => {
                let Some(subject) = a.get("object").and_then(object_ref) else {
                    return Ok(None);
                };
                let kind = if row.kind == "Like" {
                    InteractionType::Like
                } else {
                    InteractionType::Repost
                };
                (kind, subject, row.activity_id.clone(), None, None)
            }
            "Create" => {
                let Some(obj) = a.get("object").filter(|o| o.is_object()) else {
                    return Ok(None);
                };
                let Some(parent) = obj.get("inReplyTo").and_then(object_ref) else {
                    return Ok(None);
                };
                let own_url = obj
                    .get("url")
                    .and_then(object_ref)
                    .or_else(|| obj.get("id").and_then(|v| v.as_str()).map(str::to_string))
                    .unwrap_or_else(|| row.activity_id.clone());
                let content = obj.get("content").and_then(|v| v.as_str()).map(str::to_string);
                let published = obj.get("published").and_then(|v| v.as_str()).map(str::to_string);
                (InteractionType::Reply, parent, own_url, content, published)
            }
            _ => return Ok(None),
        };

        let canonical = self.resolver.resolve_or_fallback(&subject, &self.site_url)?;
        if !is_under_site(&canonical, &self.site_url) {
            debug!(activity = %row.activity_id, subject = %subject, "activitypub: foreign subject dropped");
            return Ok(None);
        }

        let actor = if row.actor_id.is_empty() {
            actor_id_of(a).unwrap_or_default()
        } else {
            row.actor_id.clone()
        };
        let object_id = match row.kind.as_str() {
            "Create" => a
                .get("object")
                .and_then(|o| o.get("id"))
                .and_then(|v| v.as_str())
                .unwrap_or(own_url.as_str())
                .to_string(),
            _ => subject.clone(),
        };

        Ok(Some(Notification {
            source: SourceTag::Activitypub,
            platform_id: format!("activitypub:{}:{}:{}", row.kind, actor, object_id),
            kind,
            author: self.author_for(&actor, a.get("actor"))?,
            content,
            url: own_url,
            subject_urls: vec![canonical],
            published: published.or_else(|| ms_to_rfc3339(row.created_at_ms)),
        }))
    }

    fn author_for(&self, actor_id: &str, embedded: Option<&Value>) -> Result<Author, AdapterError> {
        let follower = self.store.follower_profile(actor_id)?.unwrap_or_default();
        let embedded_name = embedded
            .and_then(|v| v.get("name").or_else(|| v.get("preferredUsername")))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let name = [follower.name.as_str(), embedded_name, actor_id]
            .into_iter()
            .find(|s| !s.trim().is_empty())
            .unwrap_or_default()
            .to_string();
        let photo = if follower.icon_url.is_empty() {
            embedded.and_then(icon_url_of).unwrap_or_default()
        } else {
            follower.icon_url
        };
        Ok(Author {
            name,
            url: actor_id.to_string(),
            photo,
        })
    }
}

/// An object reference may be a bare id, or an object with `id`/`href`.
fn object_ref(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(o) => o
            .get("id")
            .or_else(|| o.get("href"))
            .and_then(|v| v.as_str())
            .map(str::to_string),
        Value::Array(a) => a.iter().find_map(object_ref),
        _ => None,
    }
}

/// Cursor is `<created_at_ms>:<activity_id>`; a bare millisecond value is
/// also accepted and skips everything at that instant.
fn parse_cursor(cursor: Option<&str>) -> (i64, Option<String>) {
    let Some(c) = cursor.map(str::trim).filter(|c| !c.is_empty()) else {
        return (0, None);
    };
    match c.split_once(':') {
        Some((ms, id)) => (ms.parse().unwrap_or(0), Some(id.to_string())),
        None => (c.parse().unwrap_or(0), None),
    }
}

#[async_trait]
impl SourceAdapter for ActivityPubAdapter {
    fn source(&self) -> SourceTag {
        SourceTag::Activitypub
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchOutcome, AdapterError> {
        let (since, after_id) = parse_cursor(cursor);
        let store = self.store.clone();
        let rows = tokio::task::spawn_blocking(move || store.list_inbound_after(since, after_id.as_deref(), BATCH_LIMIT))
            .await
            .map_err(|e| AdapterError::Store(anyhow::anyhow!("activity listing task: {e}")))??;

        let mut out = FetchOutcome {
            next_cursor: rows.last().map(|r| format!("{}:{}", r.created_at_ms, r.activity_id)),
            ..Default::default()
        };
        for row in &rows {
            match self.normalize(row)? {
                Some(n) => out.items.push(n),
                None => out.skipped += 1,
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::PostsDb;
    use serde_json::json;

    fn setup() -> (tempfile::TempDir, Arc<LocalActivityStore>, ActivityPubAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let posts = PostsDb::open(dir.path().join("posts.db")).unwrap();
        posts
            .add_post("https://owner.example/notes/1", &["https://relay.example/objects/9"])
            .unwrap();
        let store = Arc::new(LocalActivityStore::open(dir.path().join("ap.db")).unwrap());
        let adapter = ActivityPubAdapter::new(
            store.clone(),
            CanonicalResolver::new(Arc::new(posts)),
            "https://owner.example",
        );
        (dir, store, adapter)
    }

    #[tokio::test]
    async fn foreign_like_is_skipped_and_never_emitted() {
        let (_dir, store, adapter) = setup();
        store
            .store_activity_at(
                &json!({"id": "https://remote.example/likes/1", "type": "Like",
                        "actor": "https://remote.example/users/eve", "object": "https://elsewhere.example/posts/5"}),
                100,
            )
            .unwrap();
        let out = adapter.fetch(None).await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(out.skipped, 1);
        assert_eq!(out.next_cursor.as_deref(), Some("100:https://remote.example/likes/1"));
    }

    #[tokio::test]
    async fn likes_announces_and_replies_map_to_owner_posts() {
        let (_dir, store, adapter) = setup();
        store
            .add_follower("https://remote.example/users/ann", "Ann", "https://remote.example/ann.png")
            .unwrap();
        store
            .store_activity_at(
                &json!({"id": "https://remote.example/likes/2", "type": "Like",
                        "actor": "https://remote.example/users/ann", "object": "https://owner.example/notes/1"}),
                10,
            )
            .unwrap();
        store
            .store_activity_at(
                &json!({"id": "https://remote.example/announces/3", "type": "Announce",
                        "actor": "https://remote.example/users/bo", "object": {"id": "https://relay.example/objects/9"}}),
                20,
            )
            .unwrap();
        store
            .store_activity_at(
                &json!({"id": "https://remote.example/create/4", "type": "Create",
                        "actor": {"id": "https://remote.example/users/cy", "name": "Cy", "icon": "https://remote.example/cy.png"},
                        "object": {"id": "https://remote.example/notes/4", "type": "Note", "content": "<p>hello</p>",
                                   "inReplyTo": "https://owner.example/notes/1", "published": "2026-02-01T00:00:00Z"}}),
                30,
            )
            .unwrap();

        let out = adapter.fetch(Some("0")).await.unwrap();
        assert_eq!(out.skipped, 0);
        assert_eq!(out.next_cursor.as_deref(), Some("30:https://remote.example/create/4"));
        assert_eq!(out.items.len(), 3);

        let like = &out.items[0];
        assert_eq!(like.kind, InteractionType::Like);
        assert_eq!(
            like.platform_id,
            "activitypub:Like:https://remote.example/users/ann:https://owner.example/notes/1"
        );
        assert_eq!(like.author.name, "Ann");
        assert_eq!(like.author.photo, "https://remote.example/ann.png");

        let announce = &out.items[1];
        assert_eq!(announce.kind, InteractionType::Repost);
        assert_eq!(announce.subject_urls, vec!["https://owner.example/notes/1".to_string()]);

        let reply = &out.items[2];
        assert_eq!(reply.kind, InteractionType::Reply);
        assert_eq!(reply.author.name, "Cy");
        assert_eq!(reply.author.photo, "https://remote.example/cy.png");
        assert_eq!(reply.content.as_deref(), Some("<p>hello</p>"));
        assert_eq!(reply.url, "https://remote.example/notes/4");
        assert_eq!(
            reply.platform_id,
            "activitypub:Create:https://remote.example/users/cy:https://remote.example/notes/4"
        );
    }

    #[tokio::test]
    async fn cursor_resumes_after_last_row() {
        let (_dir, store, adapter) = setup();
        store
            .store_activity_at(
                &json!({"id": "l", "type": "Like", "actor": "a", "object": "https://owner.example/notes/1"}),
                5,
            )
            .unwrap();
        assert!(adapter.fetch(Some("5")).await.unwrap().next_cursor.is_none());
        assert_eq!(adapter.fetch(Some("4")).await.unwrap().items.len(), 1);
    }

    #[tokio::test]
    async fn rows_sharing_a_timestamp_across_batches_are_all_emitted() {
        let (_dir, store, adapter) = setup();
        for i in 1..=199 {
            store
                .store_activity_at(
                    &json!({"id": format!("https://remote.example/likes/{i:03}"), "type": "Like",
                            "actor": format!("https://remote.example/users/u{i}"), "object": "https://owner.example/notes/1"}),
                    i,
                )
                .unwrap();
        }
        for id in ["https://remote.example/likes/x1", "https://remote.example/likes/x2"] {
            store
                .store_activity_at(
                    &json!({"id": id, "type": "Like", "actor": id, "object": "https://owner.example/notes/1"}),
                    500,
                )
                .unwrap();
        }

        let first = adapter.fetch(None).await.unwrap();
        assert_eq!(first.items.len(), 200);
        assert_eq!(first.next_cursor.as_deref(), Some("500:https://remote.example/likes/x1"));

        let second = adapter.fetch(first.next_cursor.as_deref()).await.unwrap();
        assert_eq!(second.items.len(), 1);
        assert_eq!(second.items[0].url, "https://remote.example/likes/x2");
        assert_eq!(second.next_cursor.as_deref(), Some("500:https://remote.example/likes/x2"));

        let third = adapter.fetch(second.next_cursor.as_deref()).await.unwrap();
        assert!(third.items.is_empty());
        assert!(third.next_cursor.is_none());
    }
}
