/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

pub mod activitypub;
pub mod bluesky;
pub mod mastodon;

use async_trait::async_trait;
use backfeed_protocol::{Notification, SourceTag};
use reqwest::{Response, StatusCode};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("transient: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("store: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl AdapterError {
    /// Throttling errors double the source's poll interval.
    pub fn is_throttling(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::Unauthorized(_))
    }
}

impl From<reqwest::Error> for AdapterError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            if let Some(err) = classify_status(status, &e.to_string()) {
                return err;
            }
        }
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else {
            Self::Transient(e.to_string())
        }
    }
}

/// `None` for success statuses.
pub fn classify_status(status: StatusCode, what: &str) -> Option<AdapterError> {
    if status.is_success() {
        return None;
    }
    let msg = format!("{what}: {status}");
    Some(match status {
        StatusCode::TOO_MANY_REQUESTS => AdapterError::RateLimited(msg),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AdapterError::Unauthorized(msg),
        s if s.is_server_error() || s == StatusCode::REQUEST_TIMEOUT => AdapterError::Transient(msg),
        _ => AdapterError::Malformed(msg),
    })
}

pub(crate) fn ensure_success(resp: Response, what: &str) -> Result<Response, AdapterError> {
    match classify_status(resp.status(), what) {
        Some(err) => Err(err),
        None => Ok(resp),
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(resp: Response, what: &str) -> Result<T, AdapterError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| AdapterError::Malformed(format!("{what}: {e}")))
}

#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Fetch order, newest first for the network sources.
    pub items: Vec<Notification>,
    /// `None` leaves the stored cursor untouched.
    pub next_cursor: Option<String>,
    /// Events dropped by the adapter itself (unsupported kind, foreign domain, missing parent).
    pub skipped: u64,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceTag;

    async fn fetch(&self, cursor: Option<&str>) -> Result<FetchOutcome, AdapterError>;
}

/// Sources that are actually available in this deployment, in poll order.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces an adapter already registered for the same source.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        let tag = adapter.source();
        match self.adapters.iter().position(|a| a.source() == tag) {
            Some(idx) => self.adapters[idx] = adapter,
            None => self.adapters.push(adapter),
        }
    }

    pub fn get(&self, source: SourceTag) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.source() == source).cloned()
    }

    pub fn sources(&self) -> Vec<SourceTag> {
        self.adapters.iter().map(|a| a.source()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
