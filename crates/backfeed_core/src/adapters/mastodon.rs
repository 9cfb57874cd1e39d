/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use async_trait::async_trait;
use backfeed_protocol::{Author, InteractionType, Notification, SourceTag};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ensure_success, read_json, AdapterError, FetchOutcome, SourceAdapter};
use crate::http_retry::send_with_retry;

const PAGE_LIMIT: usize = 40;
const MAX_ITEMS_PER_CYCLE: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MastodonConfig {
    #[serde(default)]
    pub instance_url: String,
    #[serde(default)]
    pub access_token: String,
}

impl MastodonConfig {
    pub fn is_configured(&self) -> bool {
        !self.instance_url.trim().is_empty() && !self.access_token.trim().is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct MastoNotification {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created_at: Option<String>,
    account: MastoAccount,
    #[serde(default)]
    status: Option<MastoStatus>,
}

#[derive(Debug, Deserialize)]
struct MastoAccount {
    id: String,
    #[serde(default)]
    username: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    avatar: String,
}

#[derive(Debug, Deserialize)]
struct MastoStatus {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    uri: String,
    #[serde(default)]
    in_reply_to_id: Option<String>,
    #[serde(default)]
    content: String,
    #[serde(default)]
    created_at: Option<String>,
}

impl MastoStatus {
    fn public_urls(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(u) = self.url.as_deref().filter(|u| !u.is_empty()) {
            out.push(u.to_string());
        }
        if !self.uri.is_empty() && !out.iter().any(|u| u == &self.uri) {
            out.push(self.uri.clone());
        }
        out
    }
}

pub struct MastodonAdapter {
    cfg: MastodonConfig,
    http: Client,
}

impl MastodonAdapter {
    pub fn new(cfg: MastodonConfig, http: Client) -> Self {
        Self { cfg, http }
    }

    fn base(&self) -> &str {
        self.cfg.instance_url.trim().trim_end_matches('/')
    }

    async fn fetch_page(&self, since_id: Option<&str>, max_id: Option<&str>) -> Result<Vec<MastoNotification>, AdapterError> {
        let mut query: Vec<(&str, String)> = vec![
            ("limit", PAGE_LIMIT.to_string()),
            ("types[]", "mention".to_string()),
            ("types[]", "favourite".to_string()),
            ("types[]", "reblog".to_string()),
        ];
        if let Some(id) = since_id {
            query.push(("since_id", id.to_string()));
        }
        if let Some(id) = max_id {
            query.push(("max_id", id.to_string()));
        }
        let url = format!("{}/api/v1/notifications", self.base());
        let resp = send_with_retry(
            || {
                self.http
                    .get(&url)
                    .bearer_auth(self.cfg.access_token.trim())
                    .query(&query)
            },
            3,
        )
        .await?;
        let resp = ensure_success(resp, "mastodon notifications")?;
        read_json(resp, "mastodon notifications").await
    }

    /// `Ok(None)` when the parent is gone (deleted or no longer visible).
    async fn fetch_status(&self, id: &str) -> Result<Option<MastoStatus>, AdapterError> {
        let url = format!("{}/api/v1/statuses/{}", self.base(), urlencoding::encode(id));
        let resp = send_with_retry(|| self.http.get(&url).bearer_auth(self.cfg.access_token.trim()), 3).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let resp = ensure_success(resp, "mastodon status")?;
        read_json(resp, "mastodon status").await.map(Some)
    }

    async fn normalize(&self, n: MastoNotification) -> Result<Option<Notification>, AdapterError> {
        let author = author_of(&n.account);
        match n.kind.as_str() {
            "favourite" | "reblog" => {
                let Some(status) = n.status else {
                    return Ok(None);
                };
                let kind = if n.kind == "favourite" {
                    InteractionType::Like
                } else {
                    InteractionType::Repost
                };
                Ok(Some(Notification {
                    source: SourceTag::Mastodon,
                    platform_id: format!("mastodon:{}:{}:{}", n.kind, n.account.id, status.id),
                    kind,
                    url: if n.account.url.is_empty() {
                        status.url.clone().unwrap_or_else(|| status.uri.clone())
                    } else {
                        n.account.url.clone()
                    },
                    subject_urls: status.public_urls(),
                    author,
                    content: None,
                    published: n.created_at,
                }))
            }
            "mention" => {
                let Some(status) = n.status else {
                    return Ok(None);
                };
                let Some(parent_id) = status.in_reply_to_id.as_deref().filter(|s| !s.is_empty()) else {
                    return Ok(None);
                };
                let Some(parent) = self.fetch_status(parent_id).await? else {
                    debug!(status = %status.id, parent = %parent_id, "mastodon parent status missing");
                    return Ok(None);
                };
                let url = status.url.clone().filter(|u| !u.is_empty()).unwrap_or_else(|| status.uri.clone());
                Ok(Some(Notification {
                    source: SourceTag::Mastodon,
                    platform_id: format!("mastodon:{}", status.id),
                    kind: InteractionType::Reply,
                    author,
                    content: Some(status.content).filter(|c| !c.is_empty()),
                    url,
                    subject_urls: parent.public_urls(),
                    published: status.created_at.or(n.created_at),
                }))
            }
            _ => Ok(None),
        }
    }
}

fn author_of(account: &MastoAccount) -> Author {
    let name = if account.display_name.trim().is_empty() {
        account.username.clone()
    } else {
        account.display_name.clone()
    };
    Author {
        name,
        url: account.url.clone(),
        photo: account.avatar.clone(),
    }
}

#[async_trait]
impl SourceAdapter for MastodonAdapter {
    fn source(&self) -> SourceTag {
        SourceTag::Mastodon
    }

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchOutcome, AdapterError> {
        let since_id = cursor.map(str::trim).filter(|s| !s.is_empty());
        let mut raw: Vec<MastoNotification> = Vec::new();
        let mut max_id: Option<String> = None;
        loop {
            let page = self.fetch_page(since_id, max_id.as_deref()).await?;
            let n = page.len();
            if n == 0 {
                break;
            }
            max_id = page.last().map(|p| p.id.clone());
            raw.extend(page);
            if n < PAGE_LIMIT || raw.len() >= MAX_ITEMS_PER_CYCLE {
                break;
            }
        }
        raw.truncate(MAX_ITEMS_PER_CYCLE);

        let next_cursor = raw.first().map(|n| n.id.clone());
        let mut out = FetchOutcome {
            next_cursor,
            ..Default::default()
        };
        for n in raw {
            match self.normalize(n).await? {
                Some(item) => out.items.push(item),
                None => out.skipped += 1,
            }
        }
        Ok(out)
    }
}
