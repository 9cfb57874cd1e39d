/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use backfeed_protocol::{Author, InteractionType, Notification, SourceTag};
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ensure_success, read_json, AdapterError, FetchOutcome, SourceAdapter};
use crate::http_retry::send_with_retry;
use crate::{now_ms, rfc3339_to_ms};

const PAGE_LIMIT: u32 = 50;
const MAX_ITEMS_PER_CYCLE: usize = 200;
const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;
const FALLBACK_SESSION_TTL_MS: i64 = 60 * 60 * 1000;

pub const DEFAULT_SERVICE: &str = "https://bsky.social";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default)]
    pub identifier: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for BlueskyConfig {
    fn default() -> Self {
        Self {
            identifier: String::new(),
            password: String::new(),
            service: default_service(),
        }
    }
}

fn default_service() -> String {
    DEFAULT_SERVICE.to_string()
}

impl BlueskyConfig {
    pub fn is_configured(&self) -> bool {
        !self.identifier.trim().is_empty() && !self.password.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
struct Session {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
    handle: String,
    expires_at_ms: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionResponse {
    access_jwt: String,
    refresh_jwt: String,
    did: String,
    #[serde(default)]
    handle: String,
}

impl From<SessionResponse> for Session {
    fn from(r: SessionResponse) -> Self {
        let expires_at_ms = jwt_expiry_ms(&r.access_jwt).unwrap_or_else(|| now_ms() + FALLBACK_SESSION_TTL_MS);
        Self {
            access_jwt: r.access_jwt,
            refresh_jwt: r.refresh_jwt,
            did: r.did,
            handle: r.handle,
            expires_at_ms,
        }
    }
}

#[derive(Debug, Deserialize)]
struct NotificationPage {
    #[serde(default)]
    cursor: Option<String>,
    #[serde(default)]
    notifications: Vec<BskyNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BskyNotification {
    uri: String,
    author: BskyAuthor,
    reason: String,
    #[serde(default)]
    reason_subject: Option<String>,
    #[serde(default)]
    record: Value,
    indexed_at: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BskyAuthor {
    did: String,
    #[serde(default)]
    handle: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

/// Session is kept for the adapter's lifetime and shared by every cycle.
pub struct BlueskyAdapter {
    cfg: BlueskyConfig,
    http: Client,
    session: Mutex<Option<Session>>,
}

enum PageResult {
    Page(NotificationPage),
    Unauthorized,
}

impl BlueskyAdapter {
    pub fn new(cfg: BlueskyConfig, http: Client) -> Self {
        Self {
            cfg,
            http,
            session: Mutex::new(None),
        }
    }

    fn xrpc(&self, method: &str) -> String {
        let base = self.cfg.service.trim().trim_end_matches('/');
        let base = if base.is_empty() { DEFAULT_SERVICE } else { base };
        format!("{base}/xrpc/{method}")
    }

    async fn create_session(&self) -> Result<Session, AdapterError> {
        let url = self.xrpc("com.atproto.server.createSession");
        let body = serde_json::json!({
            "identifier": self.cfg.identifier.trim(),
            "password": self.cfg.password,
        });
        let resp = send_with_retry(|| self.http.post(&url).json(&body), 2).await?;
        let resp = ensure_success(resp, "bluesky createSession")?;
        let r: SessionResponse = read_json(resp, "bluesky createSession").await?;
        info!(did = %r.did, "bluesky session created");
        Ok(r.into())
    }

    async fn refresh_session(&self, current: &Session) -> Result<Session, AdapterError> {
        let url = self.xrpc("com.atproto.server.refreshSession");
        let resp = send_with_retry(|| self.http.post(&url).bearer_auth(&current.refresh_jwt), 2).await?;
        let resp = ensure_success(resp, "bluesky refreshSession")?;
        let r: SessionResponse = read_json(resp, "bluesky refreshSession").await?;
        Ok(r.into())
    }

    /// Cached session, refreshed when close to expiry; a failed refresh falls
    /// back to a full login.
    async fn session(&self, force_login: bool) -> Result<Session, AdapterError> {
        let mut guard = self.session.lock().await;
        if !force_login {
            if let Some(s) = guard.clone() {
                if s.expires_at_ms - now_ms() > REFRESH_MARGIN_MS {
                    return Ok(s);
                }
                match self.refresh_session(&s).await {
                    Ok(fresh) => {
                        *guard = Some(fresh.clone());
                        return Ok(fresh);
                    }
                    Err(e) => warn!("bluesky refresh failed, logging in again: {e}"),
                }
            }
        }
        *guard = None;
        let fresh = self.create_session().await?;
        *guard = Some(fresh.clone());
        Ok(fresh)
    }

    async fn list_page(&self, session: &Session, cursor: Option<&str>) -> Result<PageResult, AdapterError> {
        let url = self.xrpc("app.bsky.notification.listNotifications");
        let mut query: Vec<(&str, String)> = vec![("limit", PAGE_LIMIT.to_string())];
        if let Some(c) = cursor {
            query.push(("cursor", c.to_string()));
        }
        let resp = send_with_retry(
            || self.http.get(&url).bearer_auth(&session.access_jwt).query(&query),
            3,
        )
        .await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            return Ok(PageResult::Unauthorized);
        }
        let resp = ensure_success(resp, "bluesky listNotifications")?;
        Ok(PageResult::Page(read_json(resp, "bluesky listNotifications").await?))
    }

    /// One forced re-login per page on 401; a second 401 is an error.
    async fn page_with_reauth(
        &self,
        session: &mut Session,
        cursor: Option<&str>,
    ) -> Result<NotificationPage, AdapterError> {
        if let PageResult::Page(p) = self.list_page(session, cursor).await? {
            return Ok(p);
        }
        debug!("bluesky 401, re-authenticating once");
        *session = self.session(true).await?;
        match self.list_page(session, cursor).await? {
            PageResult::Page(p) => Ok(p),
            PageResult::Unauthorized => Err(AdapterError::Unauthorized(
                "bluesky listNotifications: 401 after re-authentication".to_string(),
            )),
        }
    }

    fn normalize(&self, n: &BskyNotification, session: &Session) -> Option<Notification> {
        let (kind, subject) = match n.reason.as_str() {
            "like" => (InteractionType::Like, n.reason_subject.clone()?),
            "repost" => (InteractionType::Repost, n.reason_subject.clone()?),
            "reply" => (InteractionType::Reply, reply_parent(&n.record)?),
            "quote" => (
                InteractionType::Mention,
                n.reason_subject.clone().or_else(|| quoted_uri(&n.record))?,
            ),
            "mention" => (InteractionType::Mention, reply_parent(&n.record)?),
            _ => return None,
        };
        let author = Author {
            name: n
                .author
                .display_name
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| n.author.handle.clone()),
            url: profile_url(&n.author),
            photo: n.author.avatar.clone().unwrap_or_default(),
        };
        let url = match kind {
            InteractionType::Like | InteractionType::Repost => author.url.clone(),
            _ => at_uri_to_web_urls(&n.uri, &n.author.did, &n.author.handle)
                .into_iter()
                .next()
                .unwrap_or_else(|| n.uri.clone()),
        };
        let content = match kind {
            InteractionType::Like | InteractionType::Repost => None,
            _ => n.record.get("text").and_then(|v| v.as_str()).map(str::to_string),
        };
        let published = n
            .record
            .get("createdAt")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| Some(n.indexed_at.clone()));
        Some(Notification {
            source: SourceTag::Bluesky,
            platform_id: format!("bluesky:{}", n.uri),
            kind,
            author,
            content,
            url,
            subject_urls: at_uri_to_web_urls(&subject, &session.did, &session.handle),
            published,
        })
    }
}

#[async_trait]
impl SourceAdapter for BlueskyAdapter {
    fn source(&self) -> SourceTag {
        SourceTag::Bluesky
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchOutcome, AdapterError> {
        let marker = cursor.map(str::trim).filter(|s| !s.is_empty());
        let mut session = self.session(false).await?;
        let mut collected: Vec<BskyNotification> = Vec::new();
        let mut api_cursor: Option<String> = None;
        'pages: loop {
            let page = self.page_with_reauth(&mut session, api_cursor.as_deref()).await?;
            if page.notifications.is_empty() {
                break;
            }
            for n in page.notifications {
                if marker.is_some_and(|m| !is_newer(&n.indexed_at, m)) {
                    break 'pages;
                }
                collected.push(n);
                if collected.len() >= MAX_ITEMS_PER_CYCLE {
                    break 'pages;
                }
            }
            match page.cursor.filter(|c| !c.is_empty()) {
                Some(c) => api_cursor = Some(c),
                None => break,
            }
        }

        let next_cursor = collected
            .iter()
            .map(|n| n.indexed_at.as_str())
            .max_by(|a, b| compare_indexed(a, b))
            .map(str::to_string);
        let mut out = FetchOutcome {
            next_cursor,
            ..Default::default()
        };
        for n in &collected {
            match self.normalize(n, &session) {
                Some(item) => out.items.push(item),
                None => out.skipped += 1,
            }
        }
        Ok(out)
    }
}

fn compare_indexed(a: &str, b: &str) -> std::cmp::Ordering {
    match (rfc3339_to_ms(a), rfc3339_to_ms(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn is_newer(indexed_at: &str, marker: &str) -> bool {
    compare_indexed(indexed_at, marker) == std::cmp::Ordering::Greater
}

fn reply_parent(record: &Value) -> Option<String> {
    record
        .pointer("/reply/parent/uri")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn quoted_uri(record: &Value) -> Option<String> {
    record
        .pointer("/embed/record/uri")
        .or_else(|| record.pointer("/embed/record/record/uri"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn profile_url(author: &BskyAuthor) -> String {
    let who = if author.handle.is_empty() {
        &author.did
    } else {
        &author.handle
    };
    format!("https://bsky.app/profile/{who}")
}

/// `at://<did>/app.bsky.feed.post/<rkey>` to its web URLs. When the DID is the
/// given account's, the handle form comes first, then the DID form.
pub fn at_uri_to_web_urls(uri: &str, did: &str, handle: &str) -> Vec<String> {
    let Some(rest) = uri.trim().strip_prefix("at://") else {
        return if uri.starts_with("http://") || uri.starts_with("https://") {
            vec![uri.to_string()]
        } else {
            Vec::new()
        };
    };
    let mut parts = rest.splitn(3, '/');
    let (Some(repo), Some(collection), Some(rkey)) = (parts.next(), parts.next(), parts.next()) else {
        return Vec::new();
    };
    if collection != "app.bsky.feed.post" || rkey.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    if repo == did && !handle.is_empty() {
        out.push(format!("https://bsky.app/profile/{handle}/post/{rkey}"));
    }
    out.push(format!("https://bsky.app/profile/{repo}/post/{rkey}"));
    out
}

fn jwt_expiry_ms(jwt: &str) -> Option<i64> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let v: Value = serde_json::from_slice(&bytes).ok()?;
    v.get("exp").and_then(|e| e.as_i64()).map(|s| s * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::spawn_mock;
    use axum::{
        http::{HeaderMap, StatusCode as AxStatus},
        response::IntoResponse,
        routing::{get, post},
        Json, Router,
    };
    use base64::Engine as _;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    const OWNER_DID: &str = "did:plc:owner";

    fn adapter(base: &str) -> BlueskyAdapter {
        BlueskyAdapter::new(
            BlueskyConfig {
                identifier: "owner.example".to_string(),
                password: "app-pass".to_string(),
                service: base.to_string(),
            },
            crate::http_retry::build_client(Duration::from_secs(5)).unwrap(),
        )
    }

    fn login_route(logins: Arc<AtomicU32>) -> Router {
        Router::new().route(
            "/xrpc/com.atproto.server.createSession",
            post(move || {
                let logins = logins.clone();
                async move {
                    let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                    Json(json!({
                        "accessJwt": format!("access-{n}"),
                        "refreshJwt": format!("refresh-{n}"),
                        "did": OWNER_DID,
                        "handle": "owner.example",
                    }))
                }
            }),
        )
    }

    fn bearer(headers: &HeaderMap) -> String {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    }

    fn sample_page() -> serde_json::Value {
        json!({
            "notifications": [
                {"uri": "at://did:plc:ann/app.bsky.feed.post/r1", "reason": "reply",
                 "author": {"did": "did:plc:ann", "handle": "ann.example", "displayName": "Ann", "avatar": "https://cdn/ann.jpg"},
                 "record": {"text": "great post", "createdAt": "2026-03-02T00:00:00Z",
                            "reply": {"parent": {"uri": "at://did:plc:owner/app.bsky.feed.post/p1"},
                                      "root": {"uri": "at://did:plc:owner/app.bsky.feed.post/p1"}}},
                 "indexedAt": "2026-03-02T00:00:01Z"},
                {"uri": "at://did:plc:bo/app.bsky.feed.like/l1", "reason": "like",
                 "reasonSubject": "at://did:plc:owner/app.bsky.feed.post/p1",
                 "author": {"did": "did:plc:bo", "handle": "bo.example"},
                 "record": {}, "indexedAt": "2026-03-01T00:00:00Z"},
                {"uri": "at://did:plc:cy/app.bsky.graph.follow/f1", "reason": "follow",
                 "author": {"did": "did:plc:cy", "handle": "cy.example"},
                 "record": {}, "indexedAt": "2026-02-28T00:00:00Z"}
            ]
        })
    }

    #[tokio::test]
    async fn normalizes_replies_and_likes_with_handle_substitution() {
        let logins = Arc::new(AtomicU32::new(0));
        let router = login_route(logins.clone()).route(
            "/xrpc/app.bsky.notification.listNotifications",
            get(|| async { Json(sample_page()) }),
        );
        let base = spawn_mock(router).await;
        let out = adapter(&base).fetch(None).await.unwrap();

        assert_eq!(out.next_cursor.as_deref(), Some("2026-03-02T00:00:01Z"));
        assert_eq!(out.skipped, 1);
        assert_eq!(out.items.len(), 2);

        let reply = &out.items[0];
        assert_eq!(reply.kind, InteractionType::Reply);
        assert_eq!(reply.platform_id, "bluesky:at://did:plc:ann/app.bsky.feed.post/r1");
        assert_eq!(reply.url, "https://bsky.app/profile/ann.example/post/r1");
        assert_eq!(
            reply.subject_urls,
            vec![
                "https://bsky.app/profile/owner.example/post/p1".to_string(),
                "https://bsky.app/profile/did:plc:owner/post/p1".to_string()
            ]
        );
        assert_eq!(reply.content.as_deref(), Some("great post"));
        assert_eq!(reply.author.name, "Ann");

        let like = &out.items[1];
        assert_eq!(like.kind, InteractionType::Like);
        assert_eq!(like.author.name, "bo.example");
        assert_eq!(like.url, "https://bsky.app/profile/bo.example");
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stops_at_stored_marker() {
        let logins = Arc::new(AtomicU32::new(0));
        let router = login_route(logins).route(
            "/xrpc/app.bsky.notification.listNotifications",
            get(|| async { Json(sample_page()) }),
        );
        let base = spawn_mock(router).await;
        let out = adapter(&base).fetch(Some("2026-03-01T00:00:00Z")).await.unwrap();
        assert_eq!(out.items.len(), 1);
        assert_eq!(out.items[0].kind, InteractionType::Reply);

        let none = adapter(&base).fetch(Some("2026-03-02T00:00:01Z")).await.unwrap();
        assert!(none.items.is_empty());
        assert!(none.next_cursor.is_none());
    }

    #[tokio::test]
    async fn unauthorized_triggers_exactly_one_relogin() {
        let logins = Arc::new(AtomicU32::new(0));
        let router = login_route(logins.clone()).route(
            "/xrpc/app.bsky.notification.listNotifications",
            get(|headers: HeaderMap| async move {
                if bearer(&headers) == "Bearer access-2" {
                    Json(json!({"notifications": []})).into_response()
                } else {
                    AxStatus::UNAUTHORIZED.into_response()
                }
            }),
        );
        let base = spawn_mock(router).await;
        let out = adapter(&base).fetch(None).await.unwrap();
        assert!(out.items.is_empty());
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_unauthorized_propagates() {
        let logins = Arc::new(AtomicU32::new(0));
        let router = login_route(logins.clone()).route(
            "/xrpc/app.bsky.notification.listNotifications",
            get(|| async { AxStatus::UNAUTHORIZED }),
        );
        let base = spawn_mock(router).await;
        let err = adapter(&base).fetch(None).await.unwrap_err();
        assert!(matches!(err, AdapterError::Unauthorized(_)));
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn at_uri_conversion() {
        assert_eq!(
            at_uri_to_web_urls("at://did:plc:x/app.bsky.feed.post/abc", "did:plc:y", "y.example"),
            vec!["https://bsky.app/profile/did:plc:x/post/abc".to_string()]
        );
        assert!(at_uri_to_web_urls("at://did:plc:x/app.bsky.feed.like/abc", "", "").is_empty());
    }

    #[test]
    fn jwt_expiry_is_read_from_payload() {
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(br#"{"exp":1700000000}"#);
        let jwt = format!("h.{payload}.s");
        assert_eq!(jwt_expiry_ms(&jwt), Some(1_700_000_000_000));
        assert_eq!(jwt_expiry_ms("not-a-jwt"), None);
    }

    fn jwt_expiring_in(secs: i64, tag: &str) -> String {
        let exp = crate::now_ms() / 1000 + secs;
        let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(json!({"exp": exp, "jti": tag}).to_string());
        format!("h.{payload}.s")
    }

    /// Logins hand out tokens that expire inside the refresh margin; a
    /// refresh answers with `refresh_status`, and on success a long-lived token.
    fn near_expiry_router(
        logins: Arc<AtomicU32>,
        refreshes: Arc<AtomicU32>,
        refresh_status: AxStatus,
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    ) -> Router {
        let refresh_seen = seen.clone();
        Router::new()
            .route(
                "/xrpc/com.atproto.server.createSession",
                post(move || {
                    let logins = logins.clone();
                    async move {
                        let n = logins.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(json!({
                            "accessJwt": jwt_expiring_in(60, &format!("login-{n}")),
                            "refreshJwt": format!("refresh-{n}"),
                            "did": OWNER_DID,
                            "handle": "owner.example",
                        }))
                    }
                }),
            )
            .route(
                "/xrpc/com.atproto.server.refreshSession",
                post(move |headers: HeaderMap| {
                    let refreshes = refreshes.clone();
                    let seen = refresh_seen.clone();
                    async move {
                        refreshes.fetch_add(1, Ordering::SeqCst);
                        seen.lock().unwrap().push(bearer(&headers));
                        if refresh_status != AxStatus::OK {
                            return refresh_status.into_response();
                        }
                        Json(json!({
                            "accessJwt": jwt_expiring_in(3600, "refreshed"),
                            "refreshJwt": "refresh-next",
                            "did": OWNER_DID,
                            "handle": "owner.example",
                        }))
                        .into_response()
                    }
                }),
            )
            .route(
                "/xrpc/app.bsky.notification.listNotifications",
                get(move |headers: HeaderMap| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(bearer(&headers));
                        Json(json!({"notifications": []}))
                    }
                }),
            )
    }

    #[tokio::test]
    async fn session_near_expiry_is_refreshed_not_recreated() {
        let logins = Arc::new(AtomicU32::new(0));
        let refreshes = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let base = spawn_mock(near_expiry_router(logins.clone(), refreshes.clone(), AxStatus::OK, seen.clone())).await;
        let bsky = adapter(&base);

        bsky.fetch(None).await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(refreshes.load(Ordering::SeqCst), 0);

        bsky.fetch(None).await.unwrap();
        assert_eq!(logins.load(Ordering::SeqCst), 1);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        // refreshed token is long-lived, so the third cycle reuses it
        bsky.fetch(None).await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(logins.load(Ordering::SeqCst), 1);

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen[1], "Bearer refresh-1");
        assert_ne!(seen[0], seen[2]);
        assert_eq!(seen[2], seen[3]);
        let refreshed_exp = jwt_expiry_ms(seen[2].trim_start_matches("Bearer ")).unwrap();
        assert!(refreshed_exp - crate::now_ms() > REFRESH_MARGIN_MS);
    }

    #[tokio::test]
    async fn failed_refresh_falls_back_to_full_login() {
        let logins = Arc::new(AtomicU32::new(0));
        let refreshes = Arc::new(AtomicU32::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let base = spawn_mock(near_expiry_router(
            logins.clone(),
            refreshes.clone(),
            AxStatus::BAD_REQUEST,
            seen,
        ))
        .await;
        let bsky = adapter(&base);

        bsky.fetch(None).await.unwrap();
        bsky.fetch(None).await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(logins.load(Ordering::SeqCst), 2);
    }
}
