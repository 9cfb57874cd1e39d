/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use axum::{body::Body, response::IntoResponse, routing::any, Router};
use backfeed_protocol::{
    Author, IngestAck, IngestRequest, InteractionType, Jf2Card, Jf2Content, Jf2Entry, Jf2Feed,
};
use http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode};
use regex::Regex;
use serde::Serialize;
use std::sync::{Arc, OnceLock};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::canonical::CanonicalResolver;
use crate::classifier::{classify, generate_platform_id, matching_rule, Reaction};
use crate::conversation_db::{ConversationDb, ConversationItem, NewConversationItem};
use crate::ms_to_rfc3339;
use crate::poll_metrics::PollMetrics;
use crate::scheduler::Scheduler;

const INTERNAL_HEADER: &str = "X-Backfeed-Internal";
const DEFAULT_PER_PAGE: u32 = 20;
const MAX_PER_PAGE: u32 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub site_url: String,
    pub internal_token: String,
    pub store: ConversationDb,
    pub resolver: CanonicalResolver,
    pub scheduler: Scheduler,
    pub metrics: Arc<PollMetrics>,
    pub max_body_bytes: usize,
}

pub fn router(state: Arc<ApiState>) -> Router {
    let max_body_bytes = state.max_body_bytes;
    Router::new()
        .fallback(any(move |req| {
            let st = state.clone();
            async move { handle_request(&st, req).await }
        }))
        .layer(axum::extract::DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
}

pub async fn handle_request(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let path = req.uri().path().to_string();
    let resp = match (req.method().as_str(), path.as_str()) {
        ("GET", "/healthz") => simple(StatusCode::OK, "ok"),
        ("GET", "/readyz") => readyz_get(state).await,
        ("POST", "/webmention") | ("POST", "/_backfeed/ingest") => ingest_post(state, req).await,
        ("GET", "/_backfeed/feed") => feed_get(state, req).await,
        ("GET", "/_backfeed/summaries") => summaries_get(state, req).await,
        ("GET", "/_backfeed/count") => count_get(state).await,
        ("GET", "/_backfeed/status") => status_get(state, req).await,
        ("POST", "/_backfeed/poll") => poll_post(state, req).await,
        ("GET", "/_backfeed/metrics") => metrics_get(state, req),
        ("GET", "/webmention") | ("GET", "/_backfeed/ingest") => {
            simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
        }
        _ => simple(StatusCode::NOT_FOUND, "not found"),
    };
    add_security_headers(resp)
}

fn simple(status: StatusCode, msg: &str) -> Response<Body> {
    let mut resp = Response::new(Body::from(msg.to_string()));
    *resp.status_mut() = status;
    resp
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_string(body) {
        Ok(text) => (
            status,
            [("Content-Type", "application/json; charset=utf-8"), ("Cache-Control", "no-store")],
            text,
        )
            .into_response(),
        Err(e) => simple(StatusCode::INTERNAL_SERVER_ERROR, &format!("encode error: {e}")),
    }
}

fn add_security_headers(mut resp: Response<Body>) -> Response<Body> {
    let headers = resp.headers_mut();
    headers
        .entry("X-Content-Type-Options")
        .or_insert(HeaderValue::from_static("nosniff"));
    headers
        .entry("X-Frame-Options")
        .or_insert(HeaderValue::from_static("DENY"));
    headers
        .entry("Referrer-Policy")
        .or_insert(HeaderValue::from_static("no-referrer"));
    headers
        .entry("Permissions-Policy")
        .or_insert(HeaderValue::from_static("camera=(), microphone=(), geolocation=()"));
    resp
}

fn require_internal(state: &ApiState, headers: &HeaderMap) -> Result<(), Response<Body>> {
    if state.internal_token.is_empty() {
        return Ok(());
    }
    let token = headers
        .get(INTERNAL_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if token != state.internal_token {
        return Err(simple(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(())
}

async fn readyz_get(state: &ApiState) -> Response<Body> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.health_check()).await {
        Ok(Ok(())) => simple(StatusCode::OK, "ready"),
        _ => simple(StatusCode::SERVICE_UNAVAILABLE, "db not ready"),
    }
}

fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    url::form_urlencoded::parse(query.unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn query_get<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn parse_ingest_body(headers: &HeaderMap, bytes: &[u8]) -> Result<IngestRequest, String> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let pairs: Vec<(String, String)> = url::form_urlencoded::parse(bytes)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        let field = |k: &str| query_get(&pairs, k).map(str::to_string).filter(|s| !s.is_empty());
        let author = Author {
            name: field("author_name").unwrap_or_default(),
            url: field("author_url").unwrap_or_default(),
            photo: field("author_photo").unwrap_or_default(),
        };
        let has_author = !(author.name.is_empty() && author.url.is_empty() && author.photo.is_empty());
        return Ok(IngestRequest {
            source: field("source"),
            target: field("target"),
            author: has_author.then_some(author),
            content: field("content"),
            property: field("property"),
        });
    }
    serde_json::from_slice(bytes).map_err(|e| format!("invalid json: {e}"))
}

/// `Err` carries the client-facing reason.
fn validate_ingest(req: &IngestRequest) -> Result<(String, String, Option<InteractionType>), &'static str> {
    let source = req.source.as_deref().map(str::trim).filter(|s| !s.is_empty()).ok_or("missing source")?;
    let target = req.target.as_deref().map(str::trim).filter(|s| !s.is_empty()).ok_or("missing target")?;
    if !is_http_url(source) {
        return Err("invalid source url");
    }
    if !is_http_url(target) {
        return Err("invalid target url");
    }
    if source == target {
        return Err("source and target must differ");
    }
    let property = match req.property.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        None => None,
        Some(p) => Some(
            InteractionType::from_wm_property(p)
                .or_else(|| InteractionType::parse(p))
                .ok_or("invalid property")?,
        ),
    };
    Ok((source.to_string(), target.to_string(), property))
}

fn is_http_url(s: &str) -> bool {
    url::Url::parse(s)
        .map(|u| matches!(u.scheme(), "http" | "https") && u.host_str().is_some())
        .unwrap_or(false)
}

async fn ingest_post(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(b) => b,
        Err(_) => {
            state.metrics.ingest_rejected();
            return simple(StatusCode::PAYLOAD_TOO_LARGE, "body too large");
        }
    };
    let ingest = match parse_ingest_body(&parts.headers, &bytes) {
        Ok(r) => r,
        Err(msg) => {
            state.metrics.ingest_rejected();
            return simple(StatusCode::BAD_REQUEST, &msg);
        }
    };
    let (source, target, property) = match validate_ingest(&ingest) {
        Ok(v) => v,
        Err(msg) => {
            state.metrics.ingest_rejected();
            return simple(StatusCode::BAD_REQUEST, msg);
        }
    };
    let author = ingest.author.clone().unwrap_or_default();
    let reaction = Reaction {
        source_url: source.clone(),
        author_url: Some(author.url.clone()).filter(|u| !u.is_empty()),
        property,
    };
    let classification = classify(&reaction);
    let platform_id = generate_platform_id(&reaction);

    let result = tokio::task::spawn_blocking({
        let resolver = state.resolver.clone();
        let store = state.store.clone();
        let site_url = state.site_url.clone();
        let item_target = target.clone();
        let item = NewConversationItem {
            canonical_url: String::new(),
            platform_id: platform_id.clone(),
            source: classification.source,
            kind: classification.kind,
            author,
            content: ingest.content.clone().filter(|c| !c.trim().is_empty()),
            url: source.clone(),
            published: None,
        };
        move || -> anyhow::Result<String> {
            // Unresolved pushes are kept against the literal target.
            let canonical = resolver.resolve_or_fallback(&item_target, &site_url)?;
            store.upsert(&NewConversationItem {
                canonical_url: canonical.clone(),
                ..item
            })?;
            Ok(canonical)
        }
    })
    .await;
    let canonical_url = match result {
        Ok(Ok(c)) => c,
        Ok(Err(e)) => {
            warn!("ingest store failed: {e:#}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR, "store error");
        }
        Err(e) => {
            warn!("ingest task failed: {e}");
            return simple(StatusCode::INTERNAL_SERVER_ERROR, "store error");
        }
    };
    state.metrics.ingest_accepted();
    info!(
        source = %source,
        canonical = %canonical_url,
        rule = matching_rule(&reaction),
        platform = %classification.source,
        "ingest accepted"
    );
    json_response(
        StatusCode::ACCEPTED,
        &IngestAck {
            status: "accepted".to_string(),
            source,
            target,
            canonical_url,
            platform_id,
            classification,
        },
    )
}

async fn feed_get(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let pairs = query_pairs(req.uri().query());
    let target = query_get(&pairs, "target").map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
    let mut kinds = Vec::new();
    for (k, v) in &pairs {
        if k == "wm-property" || k == "wm-property[]" {
            match InteractionType::from_wm_property(v) {
                Some(kind) if !kinds.contains(&kind) => kinds.push(kind),
                Some(_) => {}
                None => return simple(StatusCode::BAD_REQUEST, "invalid wm-property"),
            }
        }
    }
    let per_page = query_get(&pairs, "per-page")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let page = query_get(&pairs, "page")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0)
        .min(10_000);

    let store = state.store.clone();
    let items = tokio::task::spawn_blocking(move || store.items_for(target.as_deref(), &kinds, per_page, page * per_page)).await;
    let items = match items {
        Ok(Ok(items)) => items,
        Ok(Err(e)) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
        Err(e) => return simple(StatusCode::INTERNAL_SERVER_ERROR, &format!("task error: {e}")),
    };
    let feed = Jf2Feed {
        ty: "feed".to_string(),
        name: "Webmentions".to_string(),
        children: items.iter().map(to_jf2).collect(),
    };
    json_response(StatusCode::OK, &feed)
}

fn to_jf2(item: &ConversationItem) -> Jf2Entry {
    let target = Some(item.canonical_url.clone());
    let of = |k: InteractionType| if item.kind == k { target.clone() } else { None };
    Jf2Entry {
        ty: "entry".to_string(),
        author: Jf2Card {
            ty: "card".to_string(),
            name: item.author.name.clone(),
            photo: item.author.photo.clone(),
            url: item.author.url.clone(),
        },
        url: if item.url.is_empty() {
            item.canonical_url.clone()
        } else {
            item.url.clone()
        },
        published: item.published.clone(),
        wm_received: ms_to_rfc3339(item.received_at_ms).unwrap_or_default(),
        wm_id: item.id,
        wm_source: item.url.clone(),
        wm_target: item.canonical_url.clone(),
        wm_property: item.kind.wm_property().to_string(),
        wm_private: false,
        content: item.content.as_ref().map(|html| Jf2Content {
            html: html.clone(),
            text: html_to_text(html),
        }),
        in_reply_to: of(InteractionType::Reply),
        like_of: of(InteractionType::Like),
        repost_of: of(InteractionType::Repost),
        bookmark_of: of(InteractionType::Bookmark),
        mention_of: of(InteractionType::Mention),
        platform: item.source.as_str().to_string(),
        platform_id: item.platform_id.clone(),
    }
}

fn html_to_text(html: &str) -> String {
    static TAG: OnceLock<Regex> = OnceLock::new();
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    let tag = TAG.get_or_init(|| Regex::new(r"(?s)<[^>]*>").expect("static regex"));
    let entity = ENTITY.get_or_init(|| {
        Regex::new(r"&(?:#([0-9]{1,7})|#[xX]([0-9a-fA-F]{1,6})|([a-zA-Z]+));").expect("static regex")
    });
    let stripped = tag.replace_all(html, " ");
    // one pass, so "&amp;lt;" stays "&lt;"
    let decoded = entity.replace_all(&stripped, |c: &regex::Captures<'_>| {
        let code = if let Some(dec) = c.get(1) {
            dec.as_str().parse::<u32>().ok()
        } else if let Some(hex) = c.get(2) {
            u32::from_str_radix(hex.as_str(), 16).ok()
        } else {
            None
        };
        if let Some(code) = code {
            return char::from_u32(code)
                .filter(|ch| *ch != '\0')
                .map(String::from)
                .unwrap_or_else(|| "\u{FFFD}".to_string());
        }
        let named = c.get(3).map(|m| m.as_str()).unwrap_or_default();
        match named {
            "amp" => "&",
            "lt" => "<",
            "gt" => ">",
            "quot" => "\"",
            "apos" => "'",
            "nbsp" => " ",
            _ => return c[0].to_string(),
        }
        .to_string()
    });
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

async fn summaries_get(state: &ApiState, req: Request<Body>) -> Response<Body> {
    let pairs = query_pairs(req.uri().query());
    let limit = query_get(&pairs, "limit")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let offset = query_get(&pairs, "offset").and_then(|v| v.parse::<u32>().ok()).unwrap_or(0);
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.summaries(limit, offset)).await {
        Ok(Ok(items)) => json_response(StatusCode::OK, &serde_json::json!({ "items": items, "limit": limit, "offset": offset })),
        Ok(Err(e)) => simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
        Err(e) => simple(StatusCode::INTERNAL_SERVER_ERROR, &format!("task error: {e}")),
    }
}

async fn count_get(state: &ApiState) -> Response<Body> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.count()).await {
        Ok(Ok(n)) => json_response(StatusCode::OK, &serde_json::json!({ "count": n })),
        Ok(Err(e)) => simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
        Err(e) => simple(StatusCode::INTERNAL_SERVER_ERROR, &format!("task error: {e}")),
    }
}

async fn status_get(state: &ApiState, req: Request<Body>) -> Response<Body> {
    if let Err(resp) = require_internal(state, req.headers()) {
        return resp;
    }
    let poll_state = match state.scheduler.load_poll_state().await {
        Ok(s) => s,
        Err(e) => return simple(StatusCode::BAD_GATEWAY, &format!("db error: {e}")),
    };
    let store = state.store.clone();
    let count = tokio::task::spawn_blocking(move || store.count())
        .await
        .ok()
        .and_then(|r| r.ok());
    json_response(
        StatusCode::OK,
        &serde_json::json!({
            "version": crate::backfeed_core_version(),
            "site_url": state.site_url,
            "scheduler": state.scheduler.state().await,
            "sources": state.scheduler.source_status().await,
            "poll_state": poll_state,
            "count": count,
        }),
    )
}

async fn poll_post(state: &ApiState, req: Request<Body>) -> Response<Body> {
    if let Err(resp) = require_internal(state, req.headers()) {
        return resp;
    }
    let report = state.scheduler.trigger_once().await;
    json_response(StatusCode::OK, &report)
}

fn metrics_get(state: &ApiState, req: Request<Body>) -> Response<Body> {
    if let Err(resp) = require_internal(state, req.headers()) {
        return resp;
    }
    json_response(StatusCode::OK, &state.metrics.snapshot_json())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::canonical::PostsDb;
    use crate::scheduler::{SchedulerParts, DEFAULT_MAX_POLL_INTERVAL, DEFAULT_POLL_INTERVAL};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        store: ConversationDb,
        app: Router,
    }

    fn fixture(token: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = ConversationDb::open(dir.path().join("conv.db")).unwrap();
        let posts = PostsDb::open(dir.path().join("posts.db")).unwrap();
        posts
            .add_post("https://owner.example/notes/1", &["https://mastodon.example/@owner/111"])
            .unwrap();
        let resolver = CanonicalResolver::new(Arc::new(posts));
        let metrics = Arc::new(PollMetrics::new());
        let scheduler = Scheduler::new(SchedulerParts {
            registry: AdapterRegistry::new(),
            store: store.clone(),
            resolver: resolver.clone(),
            site_url: "https://owner.example".to_string(),
            backfill: None,
            metrics: metrics.clone(),
            default_interval: DEFAULT_POLL_INTERVAL,
            max_interval: DEFAULT_MAX_POLL_INTERVAL,
        });
        let app = router(Arc::new(ApiState {
            site_url: "https://owner.example".to_string(),
            internal_token: token.to_string(),
            store: store.clone(),
            resolver,
            scheduler,
            metrics,
            max_body_bytes: 64 * 1024,
        }));
        Fixture { _dir: dir, store, app }
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Vec<u8>) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn post_json(path: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn plain_text_decodes_numeric_and_named_entities() {
        assert_eq!(html_to_text("<p>It&#8217;s here</p>"), "It\u{2019}s here");
        assert_eq!(html_to_text("caf&#xE9; &#X263A;"), "caf\u{e9} \u{263a}");
        assert_eq!(html_to_text("a&nbsp;&amp;&nbsp;b"), "a & b");
        assert_eq!(html_to_text("&amp;lt;b&amp;gt;"), "&lt;b&gt;");
        assert_eq!(html_to_text("&#0; &#99999999; &bogus;"), "\u{fffd} &#99999999; &bogus;");
    }

    #[tokio::test]
    async fn bridged_reply_is_classified_and_stored_on_target() {
        let f = fixture("");
        let (status, headers, body) = send(
            &f.app,
            post_json(
                "/webmention",
                json!({
                    "source": "https://brid.gy/comment/mastodon/https://instance/@user/1",
                    "target": "https://owner.example/post",
                    "author": {"name": "User", "url": "https://instance/@user", "photo": ""},
                    "content": "<p>hi &amp; welcome</p>"
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
        let ack: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack["status"], "accepted");
        assert_eq!(ack["canonical_url"], "https://owner.example/post");
        assert_eq!(ack["classification"]["source"], "mastodon");
        assert_eq!(ack["classification"]["type"], "reply");
        assert_eq!(ack["classification"]["confidence"], "high");
        assert_eq!(ack["platform_id"], "mastodon:1");

        let item = f.store.get("https://owner.example/post", "mastodon:1").unwrap().unwrap();
        assert_eq!(item.kind, InteractionType::Reply);
        assert_eq!(item.author.name, "User");

        let (status, _, body) = send(&f.app, get("/_backfeed/feed?target=https%3A%2F%2Fowner.example%2Fpost")).await;
        assert_eq!(status, StatusCode::OK);
        let feed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(feed["type"], "feed");
        let entry = &feed["children"][0];
        assert_eq!(entry["type"], "entry");
        assert_eq!(entry["wm-property"], "in-reply-to");
        assert_eq!(entry["in-reply-to"], "https://owner.example/post");
        assert_eq!(entry["author"]["type"], "card");
        assert_eq!(entry["content"]["text"], "hi & welcome");
        assert_eq!(entry["platform"], "mastodon");
        assert!(entry.get("like-of").is_none());
    }

    #[tokio::test]
    async fn syndicated_target_resolves_and_unknown_target_is_kept_literally() {
        let f = fixture("");
        let (status, _, body) = send(
            &f.app,
            post_json(
                "/_backfeed/ingest",
                json!({"source": "https://blog.example/likes/1", "target": "https://mastodon.example/@owner/111"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let ack: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack["canonical_url"], "https://owner.example/notes/1");
        assert_eq!(ack["classification"]["confidence"], "low");
        assert_eq!(ack["classification"]["type"], "like");

        let (status, _, body) = send(
            &f.app,
            post_json(
                "/webmention",
                json!({"source": "https://blog.example/a", "target": "https://elsewhere.example/b"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let ack: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(ack["canonical_url"], "https://elsewhere.example/b");
        assert_eq!(f.store.count().unwrap(), 2);
    }

    #[tokio::test]
    async fn invalid_ingest_is_rejected_without_writes() {
        let f = fixture("");
        for body in [
            json!({"target": "https://owner.example/p"}),
            json!({"source": "https://a.example/x"}),
            json!({"source": "not a url", "target": "https://owner.example/p"}),
            json!({"source": "ftp://a.example/x", "target": "https://owner.example/p"}),
            json!({"source": "https://owner.example/p", "target": "https://owner.example/p"}),
            json!({"source": "https://a.example/x", "target": "https://owner.example/p", "property": "nope"}),
        ] {
            let (status, _, _) = send(&f.app, post_json("/webmention", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }
        assert_eq!(f.store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn form_bodies_and_property_filters() {
        let f = fixture("");
        let form = "source=https%3A%2F%2Fblog.example%2Fx&target=https%3A%2F%2Fowner.example%2Fp&property=bookmark-of&author_name=Zed";
        let req = Request::builder()
            .method("POST")
            .uri("/webmention")
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(Body::from(form))
            .unwrap();
        let (status, _, _) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        send(
            &f.app,
            post_json(
                "/webmention",
                json!({"source": "https://blog.example/y", "target": "https://owner.example/p", "property": "like-of"}),
            ),
        )
        .await;

        let (_, _, body) = send(&f.app, get("/_backfeed/feed?wm-property[]=bookmark-of")).await;
        let feed: Value = serde_json::from_slice(&body).unwrap();
        let children = feed["children"].as_array().unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0]["author"]["name"], "Zed");
        assert_eq!(children[0]["bookmark-of"], "https://owner.example/p");

        let (_, _, body) = send(&f.app, get("/_backfeed/feed?wm-property=bookmark-of&wm-property=like-of&per-page=1&page=1")).await;
        let feed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(feed["children"].as_array().unwrap().len(), 1);

        let (_, _, body) = send(&f.app, get("/_backfeed/count")).await;
        assert_eq!(serde_json::from_slice::<Value>(&body).unwrap()["count"], 2);

        let (_, _, body) = send(&f.app, get("/_backfeed/summaries")).await;
        let summaries: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(summaries["items"][0]["canonical_url"], "https://owner.example/p");
        assert_eq!(summaries["items"][0]["total"], 2);
    }

    #[tokio::test]
    async fn internal_endpoints_require_token() {
        let f = fixture("sekret");
        let (status, _, _) = send(&f.app, get("/_backfeed/status")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let req = Request::builder()
            .method("POST")
            .uri("/_backfeed/poll")
            .header(INTERNAL_HEADER, "sekret")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::OK);
        let report: Value = serde_json::from_slice(&body).unwrap();
        assert!(report["sources"].as_array().unwrap().is_empty());

        let req = Request::builder()
            .uri("/_backfeed/status")
            .header(INTERNAL_HEADER, "sekret")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&f.app, req).await;
        assert_eq!(status, StatusCode::OK);
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["scheduler"], "stopped");
        assert_eq!(v["count"], 0);

        let (status, _, _) = send(&f.app, get("/healthz")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = send(&f.app, get("/readyz")).await;
        assert_eq!(status, StatusCode::OK);
    }
}
