/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! One-shot sweep that fills empty author photos.
//!
//! Each author is tried against the cheap local sources first and only then
//! against their public profile document. Every failure is per author and
//! per strategy; nothing here aborts the sweep.

use anyhow::Result;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::conversation_db::ConversationDb;
use crate::http_retry::send_with_retry;
use crate::local_activity::{icon_url_of, LocalActivityStore};

const MAX_AUTHORS_PER_SWEEP: u32 = 10_000;
const AP_ACCEPT: &str = "application/activity+json, application/ld+json; profile=\"https://www.w3.org/ns/activitystreams\"";
pub const BSKY_PUBLIC_API: &str = "https://public.api.bsky.app";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub attempted: u64,
    pub updated: u64,
}

#[derive(Clone)]
pub struct AvatarBackfill {
    store: ConversationDb,
    local: Option<Arc<LocalActivityStore>>,
    http: Client,
    fetch_timeout: Duration,
    live_fetch: bool,
    bsky_public_api: String,
}

impl AvatarBackfill {
    pub fn new(store: ConversationDb, local: Option<Arc<LocalActivityStore>>, http: Client, fetch_timeout: Duration) -> Self {
        Self {
            store,
            local,
            http,
            fetch_timeout,
            live_fetch: true,
            bsky_public_api: BSKY_PUBLIC_API.to_string(),
        }
    }

    pub fn with_live_fetch(mut self, enabled: bool) -> Self {
        self.live_fetch = enabled;
        self
    }

    pub fn with_bsky_public_api(mut self, base: impl Into<String>) -> Self {
        self.bsky_public_api = base.into();
        self
    }

    /// Attempts every distinct author that currently has no photo.
    pub async fn run(&self) -> Result<BackfillReport> {
        let authors = tokio::task::spawn_blocking({
            let store = self.store.clone();
            move || store.authors_missing_photo(MAX_AUTHORS_PER_SWEEP)
        })
        .await??;

        let mut report = BackfillReport::default();
        for author_url in authors {
            report.attempted += 1;
            let Some(photo) = self.find_photo(&author_url).await else {
                continue;
            };
            let updated = tokio::task::spawn_blocking({
                let store = self.store.clone();
                let author_url = author_url.clone();
                move || store.set_author_photo(&author_url, &photo)
            })
            .await?;
            match updated {
                Ok(n) if n > 0 => report.updated += 1,
                Ok(_) => {}
                Err(e) => debug!(author = %author_url, "avatar update failed: {e:#}"),
            }
        }
        info!(attempted = report.attempted, updated = report.updated, "avatar backfill finished");
        Ok(report)
    }

    async fn find_photo(&self, author_url: &str) -> Option<String> {
        let local = tokio::task::spawn_blocking({
            let store = self.store.clone();
            let local = self.local.clone();
            let author_url = author_url.to_string();
            move || local_photo(&store, local.as_deref(), &author_url)
        })
        .await
        .ok()
        .flatten();
        if local.is_some() || !self.live_fetch {
            return local;
        }
        match self.fetch_profile_photo(author_url).await {
            Ok(photo) => photo,
            Err(e) => {
                debug!(author = %author_url, "avatar live fetch failed: {e:#}");
                None
            }
        }
    }

    async fn fetch_profile_photo(&self, author_url: &str) -> Result<Option<String>> {
        if let Some(actor) = bsky_profile_actor(author_url) {
            let url = format!(
                "{}/xrpc/app.bsky.actor.getProfile",
                self.bsky_public_api.trim_end_matches('/')
            );
            let resp = send_with_retry(
                || self.http.get(&url).timeout(self.fetch_timeout).query(&[("actor", actor.as_str())]),
                1,
            )
            .await?;
            if !resp.status().is_success() {
                return Ok(None);
            }
            let v: serde_json::Value = resp.json().await?;
            return Ok(v
                .get("avatar")
                .and_then(|a| a.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string));
        }
        let resp = send_with_retry(
            || {
                self.http
                    .get(author_url)
                    .timeout(self.fetch_timeout)
                    .header("Accept", AP_ACCEPT)
            },
            1,
        )
        .await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let v: serde_json::Value = resp.json().await?;
        Ok(icon_url_of(&v))
    }
}

/// Strategies one to three: a photo already stored for the same author, the
/// followers table, then actor objects embedded in stored activities.
fn local_photo(store: &ConversationDb, local: Option<&LocalActivityStore>, author_url: &str) -> Option<String> {
    match store.known_photo_for_author(author_url) {
        Ok(Some(p)) => return Some(p),
        Ok(None) => {}
        Err(e) => debug!(author = %author_url, "known photo lookup failed: {e:#}"),
    }
    let local = local?;
    match local.follower_profile(author_url) {
        Ok(Some(f)) if !f.icon_url.is_empty() => return Some(f.icon_url),
        Ok(_) => {}
        Err(e) => debug!(author = %author_url, "follower lookup failed: {e:#}"),
    }
    match local.actor_icon_from_activities(author_url) {
        Ok(icon) => icon,
        Err(e) => {
            debug!(author = %author_url, "activity icon lookup failed: {e:#}");
            None
        }
    }
}

fn bsky_profile_actor(url: &str) -> Option<String> {
    let rest = url.trim().strip_prefix("https://bsky.app/profile/")?;
    let actor = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if actor.is_empty() {
        None
    } else {
        Some(actor.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation_db::NewConversationItem;
    use crate::test_support::spawn_mock;
    use axum::{extract::Query, routing::get, Json, Router};
    use backfeed_protocol::{Author, InteractionType, SourceTag};
    use serde_json::json;
    use std::collections::HashMap;

    fn item(pid: &str, author_url: &str, photo: &str) -> NewConversationItem {
        NewConversationItem {
            canonical_url: "https://owner.example/p".to_string(),
            platform_id: pid.to_string(),
            source: SourceTag::Mastodon,
            kind: InteractionType::Like,
            author: Author {
                name: "n".to_string(),
                url: author_url.to_string(),
                photo: photo.to_string(),
            },
            content: None,
            url: String::new(),
            published: None,
        }
    }

    #[tokio::test]
    async fn local_strategies_then_live_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationDb::open(dir.path().join("conv.db")).unwrap();
        let local = Arc::new(LocalActivityStore::open(dir.path().join("ap.db")).unwrap());

        let router = Router::new()
            .route(
                "/users/dee",
                get(|| async { Json(json!({"id": "x", "icon": {"type": "Image", "url": "https://cdn/dee.png"}})) }),
            )
            .route(
                "/xrpc/app.bsky.actor.getProfile",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    Json(json!({"did": "did:plc:e", "avatar": format!("https://cdn/{}.jpg", q["actor"])}))
                }),
            )
            .route("/users/gone", get(|| async { axum::http::StatusCode::NOT_FOUND }));
        let base = spawn_mock(router).await;

        // strategy 1: same author already has a photo elsewhere
        store.upsert(&item("a1", "https://x/ann", "https://cdn/ann.png")).unwrap();
        store.upsert(&item("a2", "https://x/ann", "")).unwrap();
        // strategy 2: follower icon
        local.add_follower("https://x/bo", "Bo", "https://cdn/bo.png").unwrap();
        store.upsert(&item("b", "https://x/bo", "")).unwrap();
        // strategy 4: live fetch (ActivityPub and bsky)
        let dee = format!("{base}/users/dee");
        store.upsert(&item("d", &dee, "")).unwrap();
        store.upsert(&item("e", "https://bsky.app/profile/eve.example", "")).unwrap();
        // nothing anywhere
        let gone = format!("{base}/users/gone");
        store.upsert(&item("g", &gone, "")).unwrap();

        let backfill = AvatarBackfill::new(
            store.clone(),
            Some(local),
            crate::http_retry::build_client(Duration::from_secs(5)).unwrap(),
            Duration::from_secs(2),
        )
        .with_bsky_public_api(base.clone());
        let report = backfill.run().await.unwrap();
        assert_eq!(report, BackfillReport { attempted: 5, updated: 4 });

        let photo = |pid: &str| {
            store
                .get("https://owner.example/p", pid)
                .unwrap()
                .unwrap()
                .author
                .photo
        };
        assert_eq!(photo("a2"), "https://cdn/ann.png");
        assert_eq!(photo("b"), "https://cdn/bo.png");
        assert_eq!(photo("d"), "https://cdn/dee.png");
        assert_eq!(photo("e"), "https://cdn/eve.example.jpg");
        assert_eq!(photo("g"), "");
    }

    #[test]
    fn bsky_actor_from_profile_url() {
        assert_eq!(
            bsky_profile_actor("https://bsky.app/profile/ann.example/post/1").as_deref(),
            Some("ann.example")
        );
        assert!(bsky_profile_actor("https://mastodon.example/@ann").is_none());
    }
}
