fn build_client(config: &DaemonConfig) -> anyhow::Result<DriveClient> {
    let client = match config.api_base_url.as_deref() {
        Some(base_url) => DriveClient::with_base_url(base_url, config.access_token.clone()),
        None => DriveClient::new(config.access_token.clone()),
    };
    client.context("failed to build Drive client")
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("gdrive-mirrord")
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_u32_env(name: &str, default: u64) -> u32 {
    u32::try_from(read_u64_env(name, default)).unwrap_or(u32::MAX)
}

/// Pass 0 always walks the tree; afterwards every `full_sync_every`-th pass
/// does, so deletions the change listing cannot report are still noticed.
fn list_mode_for_pass(pass: u64, full_sync_every: u64) -> ListMode {
    if full_sync_every > 0 && pass % full_sync_every == 0 {
        ListMode::Full
    } else {
        ListMode::Incremental
    }
}

/// Writes each state file whose owner flagged changes. Returns how many
/// files were written. A failed write leaves its owner flagged so the next
/// flush tries again.
async fn flush_state_once(
    engine: &SyncEngine,
    quota_rx: &mut watch::Receiver<Option<QuotaSnapshot>>,
    state_dir: &Path,
) -> std::io::Result<usize> {
    let mut written = 0;
    if let Some(files) = engine.take_files_snapshot().await {
        if let Err(err) = write_json_atomic(&state_dir.join(FILES_STATE), &files).await {
            engine.restore_files_flush().await;
            return Err(err);
        }
        written += 1;
    }
    if let Some(transforms) = engine.take_transform_snapshot().await {
        if let Err(err) = write_json_atomic(&state_dir.join(TRANSFORM_STATE), &transforms).await {
            engine.restore_transform_flush().await;
            return Err(err);
        }
        written += 1;
    }
    if quota_rx.has_changed().unwrap_or(false) {
        let quota = quota_rx.borrow_and_update().clone();
        if let Some(quota) = quota {
            if let Err(err) = write_json_atomic(&state_dir.join(QUOTA_STATE), &quota).await {
                quota_rx.mark_changed();
                return Err(err);
            }
            written += 1;
        }
    }
    if written > 0 {
        tracing::trace!(written, "state flushed");
    }
    Ok(written)
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::QuotaLimit { queries, seconds } => {
            tracing::info!(queries, seconds, "quota limit now in effect");
        }
        SyncEvent::SyncProgress {
            completed,
            failed,
            total,
        } => tracing::debug!(completed, failed, total, "sync progress"),
        SyncEvent::DownloadProgress { id, bytes } => {
            tracing::trace!(%id, bytes, "download progress");
        }
        SyncEvent::TransformDone { id, local_path } => {
            tracing::debug!(%id, %local_path, "artifact written");
        }
    }
}
