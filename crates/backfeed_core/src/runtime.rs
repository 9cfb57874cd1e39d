/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use crate::adapters::activitypub::ActivityPubAdapter;
use crate::adapters::bluesky::{BlueskyAdapter, BlueskyConfig};
use crate::adapters::mastodon::{MastodonAdapter, MastodonConfig};
use crate::adapters::AdapterRegistry;
use crate::api::{router, ApiState};
use crate::avatar_backfill::AvatarBackfill;
use crate::canonical::{CanonicalResolver, PostsDb};
use crate::conversation_db::ConversationDb;
use crate::http_retry::build_client;
use crate::local_activity::LocalActivityStore;
use crate::poll_metrics::PollMetrics;
use crate::scheduler::{Scheduler, SchedulerParts};
use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::{
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};
use tokio::sync::watch;
use tracing::{error, info};

static HANDLE_SEQ: AtomicU64 = AtomicU64::new(1);
static REGISTRY: Mutex<Vec<(u64, RunningCore)>> = Mutex::new(Vec::new());

struct RunningCore {
    shutdown_tx: watch::Sender<bool>,
    join: Option<thread::JoinHandle<()>>,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct CoreStartConfig {
    /// Owner's site root, e.g. `https://owner.example`.
    pub site_url: String,
    pub bind: String,
    pub data_dir: Option<String>,
    /// Defaults to `<data_dir>/backfeed.db`.
    pub db_path: Option<String>,
    /// Posts and syndication links; defaults to the main db file.
    pub posts_db_path: Option<String>,
    /// Local ActivityPub activity store. The ActivityPub source is only
    /// registered when this is set.
    pub activitypub_db_path: Option<String>,
    pub poll_interval_secs: u64,
    pub max_poll_interval_secs: u64,
    pub http_timeout_secs: u64,
    pub avatar_fetch_timeout_secs: u64,
    pub max_body_bytes: usize,
    pub internal_token: Option<String>,
    pub enable_avatar_backfill: bool,
    pub mastodon: Option<MastodonConfig>,
    pub bluesky: Option<BlueskyConfig>,
}

impl Default for CoreStartConfig {
    fn default() -> Self {
        Self {
            site_url: String::new(),
            bind: "127.0.0.1:8787".to_string(),
            data_dir: None,
            db_path: None,
            posts_db_path: None,
            activitypub_db_path: None,
            poll_interval_secs: 300,
            max_poll_interval_secs: 1800,
            http_timeout_secs: 30,
            avatar_fetch_timeout_secs: 10,
            max_body_bytes: 64 * 1024,
            internal_token: None,
            enable_avatar_backfill: true,
            mastodon: None,
            bluesky: None,
        }
    }
}

impl CoreStartConfig {
    /// Fills source credentials missing from the file from the environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, get: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let masto = self.mastodon.get_or_insert_with(MastodonConfig::default);
        if masto.instance_url.trim().is_empty() {
            masto.instance_url = get("MASTODON_INSTANCE_URL").unwrap_or_default();
        }
        if masto.access_token.trim().is_empty() {
            masto.access_token = get("MASTODON_ACCESS_TOKEN").unwrap_or_default();
        }
        if masto.instance_url.is_empty() && masto.access_token.is_empty() {
            self.mastodon = None;
        }

        let bsky = self.bluesky.get_or_insert_with(BlueskyConfig::default);
        if bsky.identifier.trim().is_empty() {
            bsky.identifier = get("BLUESKY_IDENTIFIER").unwrap_or_default();
        }
        if bsky.password.trim().is_empty() {
            bsky.password = get("BLUESKY_PASSWORD").unwrap_or_default();
        }
        if let Some(service) = get("BLUESKY_SERVICE") {
            if bsky.service.trim().is_empty() || bsky.service == crate::adapters::bluesky::DEFAULT_SERVICE {
                bsky.service = service;
            }
        }
        if bsky.identifier.is_empty() && bsky.password.is_empty() {
            self.bluesky = None;
        }

        if self.data_dir.is_none() {
            self.data_dir = get("BACKFEED_DATA_DIR");
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.clamp(30, 86_400))
    }

    pub fn max_poll_interval(&self) -> Duration {
        Duration::from_secs(self.max_poll_interval_secs).max(self.poll_interval())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.clamp(5, 120))
    }

    pub fn avatar_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.avatar_fetch_timeout_secs.clamp(1, 120))
    }

    fn resolved_data_dir(&self) -> Result<PathBuf> {
        match self.data_dir.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(dir) => Ok(PathBuf::from(dir)),
            None => default_data_dir(),
        }
    }
}

pub fn default_data_dir() -> Result<PathBuf> {
    if let Ok(v) = std::env::var("BACKFEED_DATA_DIR") {
        return Ok(PathBuf::from(v));
    }
    let proj = ProjectDirs::from("net", "backfeed", "backfeed").context("unable to determine platform data dir")?;
    Ok(proj.data_local_dir().to_path_buf())
}

pub fn default_config_path() -> Result<PathBuf> {
    let proj = ProjectDirs::from("net", "backfeed", "backfeed").context("unable to determine platform config dir")?;
    Ok(proj.config_dir().join("config.json"))
}

/// Everything the HTTP surface and the scheduler share for one running core.
pub struct Core {
    pub api: Arc<ApiState>,
    pub scheduler: Scheduler,
    pub bind: SocketAddr,
}

/// Opens the stores and wires adapters, scheduler and HTTP state. Nothing
/// is started yet.
pub fn build_core(cfg: &CoreStartConfig) -> Result<Core> {
    let site_url = cfg.site_url.trim().trim_end_matches('/').to_string();
    if site_url.is_empty() {
        anyhow::bail!("site_url missing");
    }
    url::Url::parse(&site_url).with_context(|| format!("parse site_url: {site_url}"))?;
    let bind: SocketAddr = cfg.bind.parse().context("parse bind")?;

    let data_dir = cfg.resolved_data_dir()?;
    std::fs::create_dir_all(&data_dir).with_context(|| format!("create data dir: {}", data_dir.display()))?;
    info!("data dir: {}", data_dir.display());
    let db_path = cfg
        .db_path
        .as_deref()
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("backfeed.db"));
    let posts_path = cfg.posts_db_path.as_deref().map(PathBuf::from).unwrap_or_else(|| db_path.clone());

    let store = ConversationDb::open(&db_path).with_context(|| format!("open store {}", db_path.display()))?;
    let posts = PostsDb::open(&posts_path).with_context(|| format!("open posts {}", posts_path.display()))?;
    let resolver = CanonicalResolver::new(Arc::new(posts));
    let local = match cfg.activitypub_db_path.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(path) => Some(Arc::new(
            LocalActivityStore::open(path).with_context(|| format!("open activitypub store {path}"))?,
        )),
        None => None,
    };

    let http = build_client(cfg.http_timeout()).context("build http client")?;

    let mut registry = AdapterRegistry::new();
    if let Some(masto) = cfg.mastodon.clone().filter(MastodonConfig::is_configured) {
        info!(instance = %masto.instance_url, "mastodon source enabled");
        registry.register(Arc::new(MastodonAdapter::new(masto, http.clone())));
    }
    if let Some(bsky) = cfg.bluesky.clone().filter(BlueskyConfig::is_configured) {
        info!(service = %bsky.service, "bluesky source enabled");
        registry.register(Arc::new(BlueskyAdapter::new(bsky, http.clone())));
    }
    if let Some(local) = &local {
        info!("activitypub source enabled");
        registry.register(Arc::new(ActivityPubAdapter::new(
            local.clone(),
            resolver.clone(),
            site_url.clone(),
        )));
    }
    if registry.is_empty() {
        info!("no poll sources configured; push ingest only");
    }

    let backfill = cfg
        .enable_avatar_backfill
        .then(|| AvatarBackfill::new(store.clone(), local.clone(), http.clone(), cfg.avatar_fetch_timeout()));

    let metrics = Arc::new(PollMetrics::new());
    let scheduler = Scheduler::new(SchedulerParts {
        registry,
        store: store.clone(),
        resolver: resolver.clone(),
        site_url: site_url.clone(),
        backfill,
        metrics: metrics.clone(),
        default_interval: cfg.poll_interval(),
        max_interval: cfg.max_poll_interval(),
    });

    let api = Arc::new(ApiState {
        site_url,
        internal_token: cfg
            .internal_token
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        store,
        resolver,
        scheduler: scheduler.clone(),
        metrics,
        max_body_bytes: cfg.max_body_bytes.clamp(1024, 16 * 1024 * 1024),
    });
    Ok(Core { api, scheduler, bind })
}

pub fn start(cfg: CoreStartConfig) -> Result<u64> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .try_init()
        .ok();

    let handle = HANDLE_SEQ.fetch_add(1, Ordering::Relaxed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let join = thread::spawn(move || {
        if let Err(e) = run_core(cfg, shutdown_rx) {
            error!("core runtime failed: {e:#}");
        }
    });

    let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    reg.push((
        handle,
        RunningCore {
            shutdown_tx,
            join: Some(join),
        },
    ));
    Ok(handle)
}

/// Signals the core and waits for its thread. An in-flight poll cycle
/// finishes before the scheduler exits.
pub fn stop(handle: u64) -> Result<()> {
    let join = {
        let mut reg = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
        let idx = reg
            .iter()
            .position(|(h, _)| *h == handle)
            .context("invalid handle")?;
        let (_, mut running) = reg.swap_remove(idx);
        let _ = running.shutdown_tx.send(true);
        running.join.take()
    };
    if let Some(j) = join {
        let _ = j.join();
    }
    Ok(())
}

fn run_core(cfg: CoreStartConfig, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;

    rt.block_on(async move {
        let core = build_core(&cfg)?;
        let app = router(core.api.clone());

        let listener = tokio::net::TcpListener::bind(core.bind).await.context("bind")?;
        info!("backfeed listening on http://{}", core.bind);

        let (server_shutdown_tx, mut server_shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = server_shutdown_rx.changed().await;
            };
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(shutdown)
                .await
        });

        core.scheduler.start().await;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            if shutdown_rx.changed().await.is_err() {
                break;
            }
        }
        core.scheduler.stop().await;
        let _ = server_shutdown_tx.send(true);
        match server.await {
            Ok(Err(e)) => error!("http server failed: {e}"),
            Err(e) => error!("http server task failed: {e}"),
            Ok(Ok(())) => {}
        }
        info!("backfeed stopped");
        Ok::<(), anyhow::Error>(())
    })
}
