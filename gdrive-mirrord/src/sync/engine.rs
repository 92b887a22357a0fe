use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gdrive_core::{DriveClient, DriveError, DriveFile, children_query, modified_since_query};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::RetryPolicy;
use super::events::{EventBus, SyncEvent};
use super::files::{FileRecord, FileStore, FilesSnapshot, RemoteFile};
use super::paths::{PathError, export_mime_for, mirror_path_for};
use super::queue::{JobError, JobPool};
use super::quota::{QuotaError, QuotaLimiter, RunError};
use super::transfer::{TransferError, save_response};
use super::transform::{
    PassthroughTransformer, TransformError, TransformLog, TransformSnapshot, Transformer,
};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("api error: {0}")]
    Api(#[from] DriveError),
    #[error("quota error: {0}")]
    Quota(#[from] QuotaError),
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),
    #[error("transform error: {0}")]
    Transform(#[from] TransformError),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("time format error: {0}")]
    TimeFormat(#[from] time::error::Format),
    #[error("root {0} is not a folder")]
    InvalidRoot(String),
    #[error("job cancelled")]
    Cancelled,
}

impl From<RunError<DriveError>> for EngineError {
    fn from(err: RunError<DriveError>) -> Self {
        match err {
            RunError::Quota(err) => EngineError::Quota(err),
            RunError::Job(err) => EngineError::Api(err),
        }
    }
}

impl EngineError {
    /// Minimum wait before another attempt, or `None` when retrying is
    /// pointless.
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            EngineError::Api(err) if err.is_retryable() => {
                Some(err.retry_after().unwrap_or_default())
            }
            EngineError::Transfer(err) if err.is_retryable() => Some(Duration::ZERO),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::Api(err) if err.is_not_found())
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub root_id: String,
    pub mirror_dir: PathBuf,
    /// Downloads land here before they are transformed into the mirror.
    pub staging_dir: PathBuf,
    pub pool_capacity: usize,
    pub pool_interval: Duration,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn new(root_id: impl Into<String>, mirror_dir: PathBuf, staging_dir: PathBuf) -> Self {
        Self {
            root_id: root_id.into(),
            mirror_dir,
            staging_dir,
            pool_capacity: 16,
            pool_interval: Duration::from_millis(100),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    /// Walks the whole tree and drops records the remote no longer lists.
    Full,
    /// Lists only items modified after the store's high-water mark. Falls
    /// back to a full walk when the store has none.
    Incremental,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub listed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub redirected: usize,
    pub deleted_paths: usize,
    pub queued: usize,
    pub skipped: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Downloaded,
    Rendered,
    /// The remote item vanished; its record was dropped.
    Removed,
    /// Nothing to write (folders and stand-ins for folders).
    Settled,
}

#[derive(Clone)]
pub struct SyncEngine {
    client: DriveClient,
    limiter: QuotaLimiter,
    pool: JobPool<ItemOutcome, EngineError>,
    store: Arc<Mutex<FileStore>>,
    transforms: Arc<Mutex<TransformLog>>,
    transformer: Arc<dyn Transformer>,
    events: EventBus,
    config: Arc<EngineConfig>,
}

impl SyncEngine {
    pub fn new(client: DriveClient, limiter: QuotaLimiter, config: EngineConfig) -> Self {
        let store = FileStore::new(Some(config.root_id.clone()));
        Self {
            client,
            limiter,
            pool: JobPool::new(config.pool_capacity),
            store: Arc::new(Mutex::new(store)),
            transforms: Arc::new(Mutex::new(TransformLog::default())),
            transformer: Arc::new(PassthroughTransformer),
            events: EventBus::new(),
            config: Arc::new(config),
        }
    }

    pub fn with_state(mut self, files: FilesSnapshot, transforms: TransformSnapshot) -> Self {
        let store = FileStore::from_snapshot(Some(self.config.root_id.clone()), files);
        self.store = Arc::new(Mutex::new(store));
        self.transforms = Arc::new(Mutex::new(TransformLog::from_snapshot(transforms)));
        self
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn limiter(&self) -> &QuotaLimiter {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<Mutex<FileStore>> {
        &self.store
    }

    pub fn transforms(&self) -> &Arc<Mutex<TransformLog>> {
        &self.transforms
    }

    /// Spawns the limiter tick loop and the download pool loop.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.limiter.start(cancel.clone()),
            self.pool.start(self.config.pool_interval, cancel),
        ]
    }

    /// Confirms the configured root exists and is a folder.
    pub async fn validate_root(&self) -> Result<DriveFile, EngineError> {
        let root_id = self.config.root_id.as_str();
        let root = self
            .config
            .retry
            .retry(EngineError::retry_delay, |_| async move {
                self.limiter
                    .run("get root", false, || self.client.get_file(root_id))
                    .await
                    .map_err(EngineError::from)
            })
            .await?;
        if !root.is_folder() || root.trashed {
            return Err(EngineError::InvalidRoot(root_id.to_string()));
        }
        Ok(root)
    }

    /// Snapshot of the metadata store when it changed since the last call.
    pub async fn take_files_snapshot(&self) -> Option<FilesSnapshot> {
        let mut store = self.store.lock().await;
        store.take_needs_flush().then(|| store.snapshot())
    }

    pub async fn take_transform_snapshot(&self) -> Option<TransformSnapshot> {
        let mut log = self.transforms.lock().await;
        log.take_needs_flush().then(|| log.snapshot())
    }

    /// Undoes [`SyncEngine::take_files_snapshot`] when the write failed.
    pub async fn restore_files_flush(&self) {
        self.store.lock().await.restore_needs_flush();
    }

    pub async fn restore_transform_flush(&self) {
        self.transforms.lock().await.restore_needs_flush();
    }
}

include!("engine_impl.rs");

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
