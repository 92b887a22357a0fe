impl SyncEngine {
    /// One pass: list, merge, clean up the mirror, then download and
    /// transform every dirty record through the pool. Item failures leave
    /// their record dirty for the next pass and do not fail the pass.
    pub async fn sync_once(&self, mode: ListMode) -> Result<SyncReport, EngineError> {
        let listing = self.list_remote(mode).await?;
        let mut report = SyncReport {
            listed: listing.len(),
            ..SyncReport::default()
        };

        let outcome = self.store.lock().await.merge(listing);
        report.inserted = outcome.inserted.len();
        report.updated = outcome.updated.len();
        report.removed = outcome.removed.len();
        report.redirected = outcome.redirected.len();
        {
            let mut transforms = self.transforms.lock().await;
            for id in &outcome.removed {
                transforms.forget(id);
            }
        }
        report.deleted_paths = self.delete_orphans(&outcome.orphaned_paths).await;
        let missing = self.mark_missing_artifacts().await?;
        if missing > 0 {
            tracing::info!(missing, "artifacts missing on disk, marked dirty");
        }

        let dirty = self.store.lock().await.dirty_records();
        let mut handles = Vec::with_capacity(dirty.len());
        for record in dirty {
            if self.already_transformed(&record).await? {
                report.skipped += 1;
                continue;
            }
            let id = record.id.clone();
            let engine = self.clone();
            let handle = self
                .pool
                .push(move || async move { engine.process_record(record).await });
            handles.push((id, handle));
        }
        report.queued = handles.len();

        let total = handles.len();
        for (id, handle) in handles {
            match handle.result().await {
                Ok(outcome) => {
                    tracing::debug!(id = %id, ?outcome, "item synced");
                    report.completed += 1;
                }
                Err(JobError::Failed(err)) => {
                    tracing::warn!(id = %id, error = %err, "item sync failed, will retry next pass");
                    report.failed += 1;
                }
                Err(JobError::Panicked(message)) => {
                    tracing::error!(id = %id, %message, "item sync panicked");
                    report.failed += 1;
                }
                Err(JobError::Cancelled) => {
                    tracing::debug!(id = %id, "item sync cancelled");
                    report.failed += 1;
                }
            }
            self.events.emit(SyncEvent::SyncProgress {
                completed: report.completed,
                failed: report.failed,
                total,
            });
        }

        tracing::info!(
            listed = report.listed,
            inserted = report.inserted,
            updated = report.updated,
            removed = report.removed,
            queued = report.queued,
            skipped = report.skipped,
            completed = report.completed,
            failed = report.failed,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn list_remote(&self, mode: ListMode) -> Result<Vec<RemoteFile>, EngineError> {
        let since = match mode {
            ListMode::Full => None,
            ListMode::Incremental => self.store.lock().await.max_modified_time(),
        };
        match since {
            Some(since) => self.list_incremental(since).await,
            None => self.list_full().await,
        }
    }

    async fn list_full(&self) -> Result<Vec<RemoteFile>, EngineError> {
        let mut listing = self.list_tree(&self.config.root_id).await?;
        let listed: HashSet<&str> = listing.iter().map(|file| file.id.as_str()).collect();
        let gone: Vec<RemoteFile> = self
            .store
            .lock()
            .await
            .find_files(|record| !record.is_synthetic() && !listed.contains(record.id.as_str()))
            .into_iter()
            .map(|record| {
                RemoteFile::new(&record.id, &record.name, &record.mime_type).trashed()
            })
            .collect();
        if !gone.is_empty() {
            tracing::info!(count = gone.len(), "records no longer listed remotely");
        }
        listing.extend(gone);
        Ok(listing)
    }

    /// Breadth-first walk below `folder_id`. Each item is attributed to the
    /// folder it was listed from.
    async fn list_tree(&self, folder_id: &str) -> Result<Vec<RemoteFile>, EngineError> {
        let mut pending = VecDeque::from([folder_id.to_string()]);
        let mut visited = HashSet::from([folder_id.to_string()]);
        let mut listing = Vec::new();
        while let Some(folder) = pending.pop_front() {
            for file in self.list_query(&children_query(&folder)).await? {
                if file.is_folder() && !file.trashed && visited.insert(file.id.clone()) {
                    pending.push_back(file.id.clone());
                }
                listing.push(remote_file(file, Some(&folder)));
            }
        }
        Ok(listing)
    }

    async fn list_incremental(&self, since: OffsetDateTime) -> Result<Vec<RemoteFile>, EngineError> {
        let stamp = since.format(&Rfc3339)?;
        let changed = self.list_query(&modified_since_query(&stamp)).await?;

        let (mut known_folders, known_ids) = {
            let store = self.store.lock().await;
            let folders: HashSet<String> = store
                .find_files(|record| record.is_folder())
                .into_iter()
                .map(|record| record.id.clone())
                .collect();
            let ids: HashSet<String> = store
                .find_files(|record| !record.is_synthetic())
                .into_iter()
                .map(|record| record.id.clone())
                .collect();
            (folders, ids)
        };
        known_folders.insert(self.config.root_id.clone());

        // A changed folder can be the parent of other changed items.
        let mut placed: HashMap<String, String> = HashMap::new();
        loop {
            let mut progressed = false;
            for file in &changed {
                if placed.contains_key(&file.id) {
                    continue;
                }
                if let Some(parent) = file.parents.iter().find(|p| known_folders.contains(*p)) {
                    placed.insert(file.id.clone(), parent.clone());
                    if file.is_folder() && !file.trashed {
                        known_folders.insert(file.id.clone());
                    }
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
        }

        let mut listing = Vec::with_capacity(changed.len());
        let mut entered = Vec::new();
        for file in changed {
            match placed.get(&file.id).cloned() {
                Some(parent) => {
                    if file.is_folder() && !file.trashed && !known_ids.contains(&file.id) {
                        entered.push(file.id.clone());
                    }
                    listing.push(remote_file(file, Some(&parent)));
                }
                None if known_ids.contains(&file.id) => {
                    tracing::debug!(id = %file.id, "item left the mirrored tree");
                    listing.push(RemoteFile::new(file.id, file.name, file.mime_type).trashed());
                }
                None => {}
            }
        }

        // Children of a folder moved into the tree keep their old timestamps.
        let mut seen: HashSet<String> = listing.iter().map(|file| file.id.clone()).collect();
        for folder in entered {
            for child in self.list_tree(&folder).await? {
                if seen.insert(child.id.clone()) {
                    listing.push(child);
                }
            }
        }
        Ok(listing)
    }

    async fn list_query(&self, query: &str) -> Result<Vec<DriveFile>, EngineError> {
        self.config
            .retry
            .retry(EngineError::retry_delay, |_| async move {
                self.limiter
                    .run("list", false, || self.client.list_all(query))
                    .await
                    .map_err(EngineError::from)
            })
            .await
    }

    /// Deletes whatever sits at local paths no record holds any more. A
    /// directory is only removed when no record lives below it.
    async fn delete_orphans(&self, paths: &[String]) -> usize {
        let mut deleted = 0;
        for local in paths {
            let Ok(target) = mirror_path_for(&self.config.mirror_dir, local) else {
                continue;
            };
            let result = match tokio::fs::symlink_metadata(&target).await {
                Ok(meta) if meta.is_dir() => {
                    if self.path_in_use(local).await {
                        continue;
                    }
                    tokio::fs::remove_dir_all(&target).await
                }
                Ok(_) => tokio::fs::remove_file(&target).await,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => {
                    tracing::debug!(path = %local, "deleted orphaned artifact");
                    deleted += 1;
                }
                Err(err) => {
                    tracing::warn!(path = %local, error = %err, "failed to delete orphaned artifact");
                }
            }
        }
        deleted
    }

    async fn path_in_use(&self, local: &str) -> bool {
        let prefix = format!("{local}/");
        self.store
            .lock()
            .await
            .find_file(|record| record.local_path.starts_with(&prefix))
            .is_some()
    }

    /// Marks clean records dirty when their artifact is gone from disk.
    async fn mark_missing_artifacts(&self) -> Result<usize, EngineError> {
        let candidates: Vec<(String, String)> = {
            let store = self.store.lock().await;
            store
                .find_files(|record| !record.dirty && writes_artifact(&store, record))
                .into_iter()
                .map(|record| (record.id.clone(), record.local_path.clone()))
                .collect()
        };
        let mut missing = Vec::new();
        for (id, local) in candidates {
            let target = mirror_path_for(&self.config.mirror_dir, &local)?;
            if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
                missing.push(id);
            }
        }
        Ok(self.store.lock().await.mark_dirty(&missing))
    }

    /// Clears a dirty record whose current version was already transformed
    /// to its current path and is still on disk.
    async fn already_transformed(&self, record: &FileRecord) -> Result<bool, EngineError> {
        if record.is_synthetic() || record.is_folder() {
            return Ok(false);
        }
        if !self.transforms.lock().await.matches(record) {
            return Ok(false);
        }
        let target = mirror_path_for(&self.config.mirror_dir, &record.local_path)?;
        if !tokio::fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(false);
        }
        Ok(self
            .store
            .lock()
            .await
            .mark_clean(&record.id, record.modified_time))
    }

    async fn process_record(&self, record: FileRecord) -> Result<ItemOutcome, EngineError> {
        if record.is_folder() {
            self.store
                .lock()
                .await
                .mark_clean(&record.id, record.modified_time);
            return Ok(ItemOutcome::Settled);
        }
        if record.is_conflict() {
            return self.render_conflict(&record).await;
        }
        if record.is_redirect() {
            return self.render_redirect(&record).await;
        }
        self.download_record(&record).await
    }

    async fn render_conflict(&self, record: &FileRecord) -> Result<ItemOutcome, EngineError> {
        let members: Vec<FileRecord> = {
            let store = self.store.lock().await;
            record
                .conflicting
                .iter()
                .filter_map(|id| store.get(id).cloned())
                .collect()
        };
        if members.iter().any(FileRecord::is_folder) {
            self.store.lock().await.mark_clean(&record.id, None);
            return Ok(ItemOutcome::Settled);
        }
        let target = mirror_path_for(&self.config.mirror_dir, &record.local_path)?;
        self.transformer
            .render_conflict(record, &members, &target)
            .await?;
        self.finish(record).await;
        Ok(ItemOutcome::Rendered)
    }

    async fn render_redirect(&self, record: &FileRecord) -> Result<ItemOutcome, EngineError> {
        let destination = {
            let store = self.store.lock().await;
            record
                .redirect_to
                .as_deref()
                .and_then(|id| store.get(id).cloned())
        };
        let Some(destination) = destination.filter(|dest| !dest.is_folder()) else {
            self.store.lock().await.mark_clean(&record.id, None);
            return Ok(ItemOutcome::Settled);
        };
        let target = mirror_path_for(&self.config.mirror_dir, &record.local_path)?;
        self.transformer
            .render_redirect(record, &destination, &target)
            .await?;
        self.finish(record).await;
        Ok(ItemOutcome::Rendered)
    }

    async fn download_record(&self, record: &FileRecord) -> Result<ItemOutcome, EngineError> {
        let staging = self.config.staging_dir.join(staging_name(&record.id));
        let fetched = self
            .config
            .retry
            .retry(EngineError::retry_delay, |attempt| {
                if attempt > 0 {
                    tracing::debug!(id = %record.id, attempt, "retrying download");
                }
                self.fetch(record, &staging)
            })
            .await;

        match fetched {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::info!(id = %record.id, "remote item gone, dropping record");
                let outcome = self.store.lock().await.remove(&record.id);
                {
                    let mut transforms = self.transforms.lock().await;
                    for id in &outcome.removed {
                        transforms.forget(id);
                    }
                }
                self.delete_orphans(&outcome.orphaned_paths).await;
                return Ok(ItemOutcome::Removed);
            }
            Err(err) => return Err(err),
        }

        let target = mirror_path_for(&self.config.mirror_dir, &record.local_path)?;
        let transformed = self.transformer.transform(record, &staging, &target).await;
        let _ = tokio::fs::remove_file(&staging).await;
        transformed?;

        self.transforms.lock().await.record(record);
        self.finish(record).await;
        Ok(ItemOutcome::Downloaded)
    }

    /// One download attempt through the limiter. Native documents are
    /// exported, binaries downloaded and checked against their md5.
    async fn fetch(&self, record: &FileRecord, staging: &Path) -> Result<u64, EngineError> {
        let label = format!("download {}", record.id);
        let export_mime = export_mime_for(&record.mime_type);
        let response = match export_mime {
            Some(mime) => {
                self.limiter
                    .run(&label, true, || self.client.export(&record.id, mime))
                    .await?
            }
            None => {
                self.limiter
                    .run(&label, true, || self.client.download(&record.id))
                    .await?
            }
        };
        let expected_md5 = match export_mime {
            Some(_) => None,
            None => record.md5_checksum.as_deref(),
        };
        let events = self.events.clone();
        let id = record.id.clone();
        let written = save_response(response, staging, expected_md5, move |bytes| {
            events.emit(SyncEvent::DownloadProgress {
                id: id.clone(),
                bytes,
            })
        })
        .await?;
        Ok(written)
    }

    async fn finish(&self, record: &FileRecord) {
        let clean = self
            .store
            .lock()
            .await
            .mark_clean(&record.id, record.modified_time);
        if !clean {
            tracing::debug!(id = %record.id, "newer version listed meanwhile, staying dirty");
        }
        self.events.emit(SyncEvent::TransformDone {
            id: record.id.clone(),
            local_path: record.local_path.clone(),
        });
    }
}

/// Whether the engine writes a file for `record`. Folders and stand-ins
/// for folders have nothing on disk of their own.
fn writes_artifact(store: &FileStore, record: &FileRecord) -> bool {
    if record.is_folder() {
        return false;
    }
    if record.is_redirect() {
        return record
            .redirect_to
            .as_deref()
            .and_then(|id| store.get(id))
            .is_some_and(|target| !target.is_folder());
    }
    if record.is_conflict() {
        return record
            .conflicting
            .iter()
            .all(|id| store.get(id).is_some_and(|member| !member.is_folder()));
    }
    true
}

fn remote_file(file: DriveFile, parent: Option<&str>) -> RemoteFile {
    let modified_time = file
        .modified_time
        .as_deref()
        .and_then(|raw| match OffsetDateTime::parse(raw, &Rfc3339) {
            Ok(parsed) => Some(parsed),
            Err(err) => {
                tracing::warn!(id = %file.id, value = raw, error = %err, "unparseable modifiedTime");
                None
            }
        });
    let size = file.size_bytes();
    let parent_id = parent
        .map(str::to_string)
        .or_else(|| file.parents.first().cloned());
    RemoteFile {
        id: file.id,
        parent_id,
        name: file.name,
        mime_type: file.mime_type,
        modified_time,
        trashed: file.trashed,
        last_author: file.last_modifying_user.and_then(|user| user.display_name),
        version: file.version,
        md5_checksum: file.md5_checksum,
        size,
    }
}

fn staging_name(id: &str) -> String {
    let safe: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{safe}.download")
}
