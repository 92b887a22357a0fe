use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use gdrive_core::DriveClient;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::sync::backoff::RetryPolicy;
use crate::sync::engine::{EngineConfig, ListMode, SyncEngine};
use crate::sync::events::{EventBus, SyncEvent};
use crate::sync::files::FilesSnapshot;
use crate::sync::persist::{load_json_or_default, write_json_atomic};
use crate::sync::quota::{DEFAULT_CONCURRENCY_CAP, QuotaConfig, QuotaLimiter, QuotaSnapshot};
use crate::sync::transform::TransformSnapshot;

const DEFAULT_MIRROR_DIR_NAME: &str = "Google Drive Mirror";
const DEFAULT_ROOT_FOLDER_ID: &str = "root";
const DEFAULT_POLL_SECS: u64 = 60;
const DEFAULT_FULL_SYNC_EVERY: u64 = 10;
const DEFAULT_QUOTA_QUERIES: u64 = 20;
const DEFAULT_QUOTA_SECONDS: u64 = 10;
const DEFAULT_POOL_CAPACITY: u64 = 16;
const DEFAULT_RETRY_ATTEMPTS: u64 = 5;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

const FILES_STATE: &str = "files.json";
const TRANSFORM_STATE: &str = "transform.json";
const QUOTA_STATE: &str = "quota.json";

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub access_token: String,
    /// Overrides the Drive endpoint, mostly for tests.
    pub api_base_url: Option<String>,
    pub root_folder_id: String,
    pub mirror_dir: PathBuf,
    pub state_dir: PathBuf,
    pub poll_interval: Duration,
    /// Every n-th pass walks the whole tree instead of asking for changes.
    pub full_sync_every: u64,
    pub quota_queries: u32,
    pub quota_seconds: u32,
    pub concurrency_cap: usize,
    pub pool_capacity: usize,
    pub retry_attempts: u32,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let access_token = std::env::var("GDRIVE_ACCESS_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .context("GDRIVE_ACCESS_TOKEN is not set")?;
        let mirror_dir = std::env::var("GDRIVE_MIRROR_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_MIRROR_DIR_NAME));
        let state_dir = std::env::var("GDRIVE_STATE_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(default_state_dir);
        let root_folder_id = std::env::var("GDRIVE_ROOT_FOLDER_ID")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ROOT_FOLDER_ID.to_string());

        Ok(Self {
            access_token,
            api_base_url: std::env::var("GDRIVE_API_BASE_URL").ok(),
            root_folder_id,
            mirror_dir,
            state_dir,
            poll_interval: Duration::from_secs(read_u64_env("GDRIVE_POLL_SECS", DEFAULT_POLL_SECS)),
            full_sync_every: read_u64_env("GDRIVE_FULL_SYNC_EVERY", DEFAULT_FULL_SYNC_EVERY),
            quota_queries: read_u32_env("GDRIVE_QUOTA_QUERIES", DEFAULT_QUOTA_QUERIES),
            quota_seconds: read_u32_env("GDRIVE_QUOTA_SECONDS", DEFAULT_QUOTA_SECONDS),
            concurrency_cap: read_u64_env(
                "GDRIVE_CONCURRENCY_CAP",
                DEFAULT_CONCURRENCY_CAP as u64,
            ) as usize,
            pool_capacity: read_u64_env("GDRIVE_POOL_CAPACITY", DEFAULT_POOL_CAPACITY) as usize,
            retry_attempts: read_u32_env("GDRIVE_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS),
        })
    }

    fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    engine: SyncEngine,
    quota_rx: watch::Receiver<Option<QuotaSnapshot>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl DaemonRuntime {
    /// Restores persisted state, starts the limiter and download pool, and
    /// checks the root folder. A missing or non-folder root is fatal.
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.mirror_dir)
            .await
            .with_context(|| format!("failed to create mirror dir at {:?}", config.mirror_dir))?;
        tokio::fs::create_dir_all(&config.state_dir)
            .await
            .with_context(|| format!("failed to create state dir at {:?}", config.state_dir))?;

        let files: FilesSnapshot = load_json_or_default(&config.state_file(FILES_STATE)).await;
        let transforms: TransformSnapshot =
            load_json_or_default(&config.state_file(TRANSFORM_STATE)).await;
        let quota: QuotaSnapshot = load_json_or_default(&config.state_file(QUOTA_STATE)).await;
        tracing::info!(
            records = files.len(),
            transforms = transforms.len(),
            restored_limit = quota.limit.is_some(),
            "state loaded"
        );

        let client = build_client(&config)?;
        let events = EventBus::new();
        let limiter = QuotaLimiter::new(
            QuotaConfig {
                concurrency_cap: config.concurrency_cap,
                ..QuotaConfig::default()
            },
            events.clone(),
        );
        limiter.restore(quota);
        limiter
            .set_initial_limit(config.quota_queries, config.quota_seconds)
            .context("invalid quota limit")?;

        let (quota_tx, quota_rx) = watch::channel(None);
        limiter.set_save_handler(move |snapshot| {
            quota_tx.send_replace(Some(snapshot));
        });

        let staging_dir = config.state_dir.join("staging");
        let mut engine_config = EngineConfig::new(
            config.root_folder_id.clone(),
            config.mirror_dir.clone(),
            staging_dir,
        );
        engine_config.pool_capacity = config.pool_capacity;
        engine_config.retry =
            RetryPolicy::new(config.retry_attempts, RetryPolicy::default().backoff);
        let engine = SyncEngine::new(client, limiter, engine_config)
            .with_state(files, transforms)
            .with_events(events);

        let cancel = CancellationToken::new();
        let handles = engine.start(cancel.clone());
        let runtime = Self {
            config,
            engine,
            quota_rx,
            cancel,
            handles,
        };

        match runtime.engine.validate_root().await {
            Ok(root) => {
                tracing::info!(root_id = %root.id, name = %root.name, "root folder validated");
                Ok(runtime)
            }
            Err(err) => {
                let root_id = runtime.config.root_folder_id.clone();
                runtime.shutdown().await?;
                Err(anyhow::Error::new(err)
                    .context(format!("root folder {root_id} is not usable")))
            }
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        tracing::info!(
            mirror_dir = %self.config.mirror_dir.display(),
            state_dir = %self.config.state_dir.display(),
            root = %self.config.root_folder_id,
            "started"
        );

        let events_handle = tokio::spawn(log_events(
            self.engine.events().subscribe(),
            self.cancel.clone(),
        ));
        let flush_handle = tokio::spawn(flush_loop(
            self.engine.clone(),
            self.quota_rx.clone(),
            self.config.state_dir.clone(),
            self.cancel.clone(),
        ));
        let sync_handle = tokio::spawn(sync_loop(
            self.engine.clone(),
            self.config.poll_interval,
            self.config.full_sync_every,
            self.cancel.clone(),
        ));
        self.handles
            .extend([events_handle, flush_handle, sync_handle]);

        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for shutdown signal")?;
        tracing::info!("shutdown requested");
        self.shutdown().await
    }

    /// Stops every loop and writes whatever state is still pending.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
        flush_state_once(&self.engine, &mut self.quota_rx, &self.config.state_dir)
            .await
            .context("failed to flush state on shutdown")?;
        Ok(())
    }
}

async fn sync_loop(
    engine: SyncEngine,
    poll_interval: Duration,
    full_sync_every: u64,
    cancel: CancellationToken,
) {
    let mut pass = 0u64;
    loop {
        let mode = list_mode_for_pass(pass, full_sync_every);
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = engine.sync_once(mode) => match result {
                Ok(report) => tracing::info!(
                    ?mode,
                    listed = report.listed,
                    inserted = report.inserted,
                    updated = report.updated,
                    removed = report.removed,
                    queued = report.queued,
                    completed = report.completed,
                    failed = report.failed,
                    "sync pass finished"
                ),
                Err(err) => tracing::warn!(?mode, error = %err, "sync pass failed"),
            },
        }
        pass += 1;
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

async fn flush_loop(
    engine: SyncEngine,
    mut quota_rx: watch::Receiver<Option<QuotaSnapshot>>,
    state_dir: PathBuf,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = flush_state_once(&engine, &mut quota_rx, &state_dir).await {
                    tracing::warn!(error = %err, "state flush failed");
                }
            }
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<SyncEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => log_event(&event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, "event log lagging");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
