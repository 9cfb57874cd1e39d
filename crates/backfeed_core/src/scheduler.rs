/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Poll driver.
//!
//! Every registered source carries its own [`Backoff`] and due time. A single
//! driver task sleeps until the earliest due source, polls every due source in
//! registry order, then runs the avatar sweep until it has completed once.
//! [`Scheduler::trigger_once`] runs the same cycle over all sources and is not
//! serialized against the driver: writes are idempotent upserts, and the last
//! cursor write wins.

use anyhow::Result;
use backfeed_protocol::{Notification, SourceTag};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::adapters::{AdapterError, AdapterRegistry};
use crate::avatar_backfill::{AvatarBackfill, BackfillReport};
use crate::canonical::CanonicalResolver;
use crate::conversation_db::{ConversationDb, NewConversationItem};
use crate::poll_metrics::PollMetrics;
use crate::poll_state::PollCursorState;
use crate::now_ms;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_secs(1800);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    Running,
    Backoff,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// `min(default * 2^k, max)` after `k` consecutive throttling failures.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    default: Duration,
    max: Duration,
    current: Duration,
    throttles: u32,
}

impl Backoff {
    pub fn new(default: Duration, max: Duration) -> Self {
        let default = default.max(Duration::from_secs(1));
        Self {
            default,
            max: max.max(default),
            current: default,
            throttles: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn throttles(&self) -> u32 {
        self.throttles
    }

    pub fn mode(&self) -> SourceMode {
        if self.current > self.default {
            SourceMode::Backoff
        } else {
            SourceMode::Running
        }
    }

    pub fn on_throttled(&mut self) -> Duration {
        self.throttles = self.throttles.saturating_add(1);
        let factor = 2u32.saturating_pow(self.throttles);
        self.current = self.default.saturating_mul(factor).min(self.max);
        self.current
    }

    pub fn on_success(&mut self) {
        self.throttles = 0;
        self.current = self.default;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source: SourceTag,
    pub fetched: u64,
    pub stored: u64,
    pub skipped: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub throttled: bool,
}

impl SourceReport {
    fn new(source: SourceTag) -> Self {
        Self {
            source,
            fetched: 0,
            stored: 0,
            skipped: 0,
            error: None,
            throttled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub started_at_ms: i64,
    pub sources: Vec<SourceReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<BackfillReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub source: SourceTag,
    pub mode: SourceMode,
    pub interval_secs: u64,
    pub throttles: u32,
    pub next_due_in_secs: u64,
}

pub struct SchedulerParts {
    pub registry: AdapterRegistry,
    pub store: ConversationDb,
    pub resolver: CanonicalResolver,
    pub site_url: String,
    pub backfill: Option<AvatarBackfill>,
    pub metrics: Arc<PollMetrics>,
    pub default_interval: Duration,
    pub max_interval: Duration,
}

struct SourceSchedule {
    backoff: Backoff,
    next_due: Instant,
}

struct Inner {
    registry: AdapterRegistry,
    store: ConversationDb,
    resolver: CanonicalResolver,
    site_url: String,
    backfill: Option<AvatarBackfill>,
    metrics: Arc<PollMetrics>,
    default_interval: Duration,
    schedules: Mutex<HashMap<SourceTag, SourceSchedule>>,
}

struct Driver {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
    driver: Arc<Mutex<Option<Driver>>>,
}

impl Scheduler {
    pub fn new(parts: SchedulerParts) -> Self {
        let now = Instant::now();
        let schedules = parts
            .registry
            .sources()
            .into_iter()
            .map(|tag| {
                (
                    tag,
                    SourceSchedule {
                        backoff: Backoff::new(parts.default_interval, parts.max_interval),
                        next_due: now,
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                store: parts.store,
                resolver: parts.resolver,
                site_url: parts.site_url,
                backfill: parts.backfill,
                metrics: parts.metrics,
                default_interval: parts.default_interval,
                schedules: Mutex::new(schedules),
            }),
            driver: Arc::new(Mutex::new(None)),
        }
    }

    /// Starts the driver; the first cycle runs immediately. No-op when running.
    pub async fn start(&self) {
        let mut driver = self.driver.lock().await;
        if driver.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return;
        }
        {
            let now = Instant::now();
            let mut schedules = self.inner.schedules.lock().await;
            for s in schedules.values_mut() {
                s.next_due = now;
            }
        }
        let (tx, rx) = watch::channel(false);
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { drive(inner, rx).await });
        *driver = Some(Driver { shutdown: tx, task });
        info!(sources = ?self.inner.registry.sources(), "poll scheduler started");
    }

    /// Clears the timer and waits for the driver; a cycle already in flight
    /// runs to completion first.
    pub async fn stop(&self) {
        let driver = self.driver.lock().await.take();
        if let Some(d) = driver {
            let _ = d.shutdown.send(true);
            if let Err(e) = d.task.await {
                warn!("poll driver ended abnormally: {e}");
            }
            info!("poll scheduler stopped");
        }
    }

    pub async fn state(&self) -> SchedulerState {
        match self.driver.lock().await.as_ref() {
            Some(d) if !d.task.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Polls every registered source now, regardless of due times.
    pub async fn trigger_once(&self) -> CycleReport {
        let sources = self.inner.registry.sources();
        self.inner.run_cycle(&sources, false).await
    }

    pub async fn source_status(&self) -> Vec<SourceStatus> {
        let now = Instant::now();
        let schedules = self.inner.schedules.lock().await;
        self.inner
            .registry
            .sources()
            .into_iter()
            .filter_map(|tag| {
                let s = schedules.get(&tag)?;
                Some(SourceStatus {
                    source: tag,
                    mode: s.backoff.mode(),
                    interval_secs: s.backoff.current().as_secs(),
                    throttles: s.backoff.throttles(),
                    next_due_in_secs: s.next_due.saturating_duration_since(now).as_secs(),
                })
            })
            .collect()
    }

    pub async fn load_poll_state(&self) -> Result<PollCursorState> {
        let store = self.inner.store.clone();
        tokio::task::spawn_blocking(move || store.load_poll_state()).await?
    }
}

async fn drive(inner: Arc<Inner>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let wait = inner.time_until_next_due().await;
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        if *shutdown.borrow() {
            break;
        }
        let due = inner.due_sources(Instant::now()).await;
        if due.is_empty() && inner.backfill_pending().await == Some(false) {
            continue;
        }
        inner.run_cycle(&due, true).await;
    }
}

impl Inner {
    async fn time_until_next_due(&self) -> Duration {
        let now = Instant::now();
        let schedules = self.schedules.lock().await;
        schedules
            .values()
            .map(|s| s.next_due.saturating_duration_since(now))
            .min()
            .unwrap_or(self.default_interval)
    }

    async fn due_sources(&self, now: Instant) -> Vec<SourceTag> {
        let schedules = self.schedules.lock().await;
        self.registry
            .sources()
            .into_iter()
            .filter(|tag| schedules.get(tag).is_some_and(|s| s.next_due <= now))
            .collect()
    }

    /// `Some(false)` once the sweep is done or when there is none to run.
    async fn backfill_pending(&self) -> Option<bool> {
        if self.backfill.is_none() {
            return Some(false);
        }
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.load_poll_state()).await {
            Ok(Ok(state)) => Some(!state.avatar_backfill_complete),
            _ => None,
        }
    }

    async fn run_cycle(&self, sources: &[SourceTag], reschedule: bool) -> CycleReport {
        let mut report = CycleReport {
            started_at_ms: now_ms(),
            ..Default::default()
        };
        let store = self.store.clone();
        let state = match tokio::task::spawn_blocking(move || store.load_poll_state()).await {
            Ok(Ok(state)) => state,
            Ok(Err(e)) => {
                error!("poll state unavailable, skipping cycle: {e:#}");
                return report;
            }
            Err(e) => {
                error!("poll state task failed: {e}");
                return report;
            }
        };

        for &tag in sources {
            let Some(adapter) = self.registry.get(tag) else {
                continue;
            };
            let mut sr = SourceReport::new(tag);
            let outcome = adapter.fetch(state.cursor_for(tag)).await;
            let result = match outcome {
                Ok(outcome) => {
                    sr.fetched = outcome.items.len() as u64;
                    sr.skipped = outcome.skipped;
                    self.store_batch(tag, outcome.items, outcome.next_cursor, &mut sr).await
                }
                Err(e) => Err(e),
            };
            let throttled = match &result {
                Ok(()) => false,
                Err(e) => e.is_throttling(),
            };
            if let Err(e) = result {
                warn!(source = %tag, throttled, "poll failed: {e}");
                sr.error = Some(e.to_string());
                sr.throttled = throttled;
                self.metrics.adapter_error(throttled);
                let store = self.store.clone();
                let msg = e.to_string();
                match tokio::task::spawn_blocking(move || store.record_poll_failure(tag, &msg, now_ms())).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(source = %tag, "record poll failure: {e:#}"),
                    Err(e) => error!(source = %tag, "record poll failure task: {e}"),
                }
            }
            self.after_poll(tag, sr.error.is_none(), throttled, reschedule).await;
            self.metrics.fetched_add(sr.fetched);
            self.metrics.stored_add(sr.stored);
            self.metrics.skipped_add(sr.skipped);
            info!(
                source = %tag,
                fetched = sr.fetched,
                stored = sr.stored,
                skipped = sr.skipped,
                "poll finished"
            );
            report.sources.push(sr);
        }

        if let Some(backfill) = &self.backfill {
            if !state.avatar_backfill_complete {
                report.backfill = self.run_backfill(backfill).await;
            }
        }
        self.metrics.cycle_done();
        report
    }

    /// Resolves and upserts in fetch order, then advances the cursor. Any
    /// store failure aborts before the cursor is touched.
    async fn store_batch(
        &self,
        tag: SourceTag,
        items: Vec<Notification>,
        next_cursor: Option<String>,
        sr: &mut SourceReport,
    ) -> Result<(), AdapterError> {
        let store = self.store.clone();
        let resolver = self.resolver.clone();
        let site_url = self.site_url.clone();
        let (stored, dropped) = tokio::task::spawn_blocking(move || -> Result<(u64, u64)> {
            let mut stored = 0u64;
            let mut dropped = 0u64;
            for n in &items {
                match resolver.resolve_candidates(&n.subject_urls, &site_url)? {
                    Some(canonical) => {
                        store.upsert(&NewConversationItem::from_notification(n, &canonical))?;
                        stored += 1;
                    }
                    None => dropped += 1,
                }
            }
            store.record_poll_success(tag, next_cursor.as_deref(), now_ms())?;
            Ok((stored, dropped))
        })
        .await
        .map_err(|e| AdapterError::Store(anyhow::anyhow!("store task: {e}")))??;
        sr.stored = stored;
        sr.skipped += dropped;
        Ok(())
    }

    async fn after_poll(&self, tag: SourceTag, ok: bool, throttled: bool, reschedule: bool) {
        let mut schedules = self.schedules.lock().await;
        let Some(s) = schedules.get_mut(&tag) else {
            return;
        };
        let before = s.backoff.current();
        if ok {
            s.backoff.on_success();
        } else if throttled {
            s.backoff.on_throttled();
        }
        let after = s.backoff.current();
        if after != before {
            info!(source = %tag, interval_secs = after.as_secs(), mode = ?s.backoff.mode(), "poll interval changed");
        }
        if reschedule {
            s.next_due = Instant::now() + after;
        }
    }

    async fn run_backfill(&self, backfill: &AvatarBackfill) -> Option<BackfillReport> {
        match backfill.run().await {
            Ok(r) => {
                let store = self.store.clone();
                match tokio::task::spawn_blocking(move || store.mark_avatar_backfill_complete()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!("mark avatar backfill complete: {e:#}"),
                    Err(e) => error!("mark avatar backfill task: {e}"),
                }
                Some(r)
            }
            Err(e) => {
                warn!("avatar backfill failed: {e:#}");
                None
            }
        }
    }
}
