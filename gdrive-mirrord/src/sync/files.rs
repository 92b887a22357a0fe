//! In-memory metadata for every mirrored item, keyed by remote id.
//!
//! The store is fully resident; `files.json` is a write-behind snapshot of it.
//! All mutating operations read-modify-write the whole map and must not be
//! interleaved: the engine owns the store behind a mutex and never runs two
//! merges at once.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::paths::{FOLDER_MIME, join_local, local_file_name, with_counter_suffix};

pub const CONFLICT_MIME: &str = "conflict";
pub const REDIRECT_MIME: &str = "redirect";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub desired_local_path: String,
    pub local_path: String,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified_time: Option<OffsetDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5_checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default)]
    pub dirty: bool,
    #[serde(default)]
    pub trashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicting: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    /// Order of first observation; fixes conflict counter assignment.
    #[serde(default)]
    pub seq: u64,
}

impl FileRecord {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    pub fn is_conflict(&self) -> bool {
        self.mime_type == CONFLICT_MIME
    }

    pub fn is_redirect(&self) -> bool {
        self.mime_type == REDIRECT_MIME
    }

    /// Conflict and redirect records have no remote counterpart.
    pub fn is_synthetic(&self) -> bool {
        self.is_conflict() || self.is_redirect()
    }

    fn is_live(&self) -> bool {
        !self.is_synthetic() && !self.trashed
    }

    fn from_remote(remote: RemoteFile, desired: String, seq: u64) -> Self {
        let dirty = remote.mime_type != FOLDER_MIME;
        Self {
            id: remote.id,
            parent_id: remote.parent_id,
            name: remote.name,
            mime_type: remote.mime_type,
            local_path: desired.clone(),
            desired_local_path: desired,
            modified_time: remote.modified_time,
            last_author: remote.last_author,
            version: remote.version,
            md5_checksum: remote.md5_checksum,
            size: remote.size,
            dirty,
            trashed: false,
            conflict_id: None,
            counter: None,
            conflicting: Vec::new(),
            redirect_to: None,
            seq,
        }
    }

    fn synthetic(id: String, mime_type: &str, name: String, path: String, seq: u64) -> Self {
        Self {
            id,
            parent_id: None,
            name,
            mime_type: mime_type.to_string(),
            desired_local_path: path.clone(),
            local_path: path,
            modified_time: None,
            last_author: None,
            version: None,
            md5_checksum: None,
            size: None,
            dirty: true,
            trashed: false,
            conflict_id: None,
            counter: None,
            conflicting: Vec::new(),
            redirect_to: None,
            seq,
        }
    }
}

/// One entry of a remote listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub parent_id: Option<String>,
    pub name: String,
    pub mime_type: String,
    pub modified_time: Option<OffsetDateTime>,
    pub trashed: bool,
    pub last_author: Option<String>,
    pub version: Option<String>,
    pub md5_checksum: Option<String>,
    pub size: Option<u64>,
}

impl RemoteFile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, mime_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            name: name.into(),
            mime_type: mime_type.into(),
            modified_time: None,
            trashed: false,
            last_author: None,
            version: None,
            md5_checksum: None,
            size: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_modified_time(mut self, modified_time: OffsetDateTime) -> Self {
        self.modified_time = Some(modified_time);
        self
    }

    pub fn trashed(mut self) -> Self {
        self.trashed = true;
        self
    }
}

/// What a merge changed. `orphaned_paths` are local paths that no record
/// holds any more; the engine deletes whatever sits there on disk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub inserted: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
    pub redirected: Vec<String>,
    pub orphaned_paths: Vec<String>,
}

impl MergeOutcome {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.redirected.is_empty()
            && self.orphaned_paths.is_empty()
    }
}

pub type FilesSnapshot = BTreeMap<String, FileRecord>;

/// Paths waiting for a conflict check, deduplicated, plus the ids inserted
/// during the current merge (those never get redirects).
#[derive(Default)]
struct Pending {
    paths: VecDeque<String>,
    queued: HashSet<String>,
    fresh: HashSet<String>,
}

impl Pending {
    fn push(&mut self, path: &str) {
        if self.queued.insert(path.to_string()) {
            self.paths.push_back(path.to_string());
        }
    }

    fn pop(&mut self) -> Option<String> {
        let path = self.paths.pop_front()?;
        self.queued.remove(&path);
        Some(path)
    }
}

#[derive(Debug, Default)]
pub struct FileStore {
    records: HashMap<String, FileRecord>,
    root_id: Option<String>,
    next_seq: u64,
    needs_flush: bool,
}

impl FileStore {
    pub fn new(root_id: Option<String>) -> Self {
        Self {
            records: HashMap::new(),
            root_id,
            next_seq: 1,
            needs_flush: false,
        }
    }

    pub fn from_snapshot(root_id: Option<String>, snapshot: FilesSnapshot) -> Self {
        let next_seq = snapshot.values().map(|r| r.seq).max().unwrap_or(0) + 1;
        Self {
            records: snapshot.into_iter().collect(),
            root_id,
            next_seq,
            needs_flush: false,
        }
    }

    pub fn snapshot(&self) -> FilesSnapshot {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect()
    }

    /// True once after any mutation; drives the debounced flush.
    pub fn take_needs_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    /// Re-arms the flush flag after a snapshot failed to reach disk.
    pub fn restore_needs_flush(&mut self) {
        self.needs_flush = true;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.records.get(id)
    }

    pub fn find_file<P>(&self, mut predicate: P) -> Option<&FileRecord>
    where
        P: FnMut(&FileRecord) -> bool,
    {
        self.records.values().find(|record| predicate(record))
    }

    pub fn find_files<P>(&self, mut predicate: P) -> Vec<&FileRecord>
    where
        P: FnMut(&FileRecord) -> bool,
    {
        let mut found: Vec<_> = self
            .records
            .values()
            .filter(|record| predicate(record))
            .collect();
        found.sort_by_key(|record| record.seq);
        found
    }

    pub fn dirty_records(&self) -> Vec<FileRecord> {
        self.find_files(|record| record.dirty)
            .into_iter()
            .cloned()
            .collect()
    }

    /// High-water mark for incremental listings.
    pub fn max_modified_time(&self) -> Option<OffsetDateTime> {
        self.records
            .values()
            .filter(|record| !record.is_synthetic())
            .filter_map(|record| record.modified_time)
            .max()
    }

    pub fn mark_dirty<S: AsRef<str>>(&mut self, ids: &[S]) -> usize {
        let mut marked = 0;
        for id in ids {
            if let Some(record) = self.records.get_mut(id.as_ref())
                && !record.is_folder()
                && !record.dirty
            {
                record.dirty = true;
                marked += 1;
            }
        }
        if marked > 0 {
            self.needs_flush = true;
        }
        marked
    }

    /// Clears `dirty` when the artifact was produced from the version the
    /// store still holds. A newer listing that arrived meanwhile keeps the
    /// record dirty.
    pub fn mark_clean(&mut self, id: &str, confirmed: Option<OffsetDateTime>) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.modified_time != confirmed {
            return false;
        }
        if record.dirty {
            record.dirty = false;
            self.needs_flush = true;
        }
        true
    }

    /// Drops a record whose remote item is gone, along with its descendants.
    pub fn remove(&mut self, id: &str) -> MergeOutcome {
        let before = self.held_paths();
        let mut pending = Pending::default();
        let mut outcome = MergeOutcome {
            removed: self.remove_subtree(id, &mut pending),
            ..MergeOutcome::default()
        };
        self.settle(&mut pending);
        outcome.orphaned_paths = self.orphaned_since(&before);
        self.needs_flush = true;
        outcome
    }

    /// Reconciles a remote listing into the store, in listing order.
    pub fn merge<I>(&mut self, listing: I) -> MergeOutcome
    where
        I: IntoIterator<Item = RemoteFile>,
    {
        let before = self.held_paths();
        let mut pending = Pending::default();
        let mut outcome = MergeOutcome::default();

        for remote in listing {
            if remote.trashed {
                outcome
                    .removed
                    .extend(self.remove_subtree(&remote.id, &mut pending));
                continue;
            }

            let desired = self.desired_path_for(
                remote.parent_id.as_deref(),
                &remote.name,
                &remote.mime_type,
            );
            let id = remote.id.clone();
            if self.records.contains_key(&id) {
                if self.update_file(&remote) {
                    outcome.updated.push(id.clone());
                }
                if self.relocate(&id, desired.clone(), &mut pending) {
                    outcome.redirected.push(id.clone());
                }
                pending.push(&desired);
            } else {
                pending.fresh.insert(id.clone());
                pending.push(&desired);
                self.insert_file(remote, desired, &mut pending);
                outcome.inserted.push(id);
            }
        }

        self.settle(&mut pending);
        outcome.orphaned_paths = self.orphaned_since(&before);
        self.needs_flush = true;
        tracing::debug!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            removed = outcome.removed.len(),
            redirected = outcome.redirected.len(),
            "merged remote listing"
        );
        outcome
    }

    fn insert_file(&mut self, remote: RemoteFile, desired: String, pending: &mut Pending) {
        let seq = self.bump_seq();
        let record = FileRecord::from_remote(remote, desired, seq);
        let id = record.id.clone();
        let is_folder = record.is_folder();
        self.records.insert(id.clone(), record);
        if is_folder {
            // Children listed before their folder were placed at the root.
            self.cascade_children(&id, pending);
        }
    }

    /// Copies mutable remote fields. Returns whether the content changed.
    fn update_file(&mut self, remote: &RemoteFile) -> bool {
        let Some(record) = self.records.get_mut(&remote.id) else {
            return false;
        };
        let content_changed = record.modified_time != remote.modified_time;
        let changed = content_changed
            || record.name != remote.name
            || record.parent_id != remote.parent_id
            || record.mime_type != remote.mime_type
            || record.last_author != remote.last_author
            || record.version != remote.version
            || record.md5_checksum != remote.md5_checksum
            || record.size != remote.size;

        record.name = remote.name.clone();
        record.parent_id = remote.parent_id.clone();
        record.mime_type = remote.mime_type.clone();
        record.modified_time = remote.modified_time;
        record.last_author = remote.last_author.clone();
        record.version = remote.version.clone();
        record.md5_checksum = remote.md5_checksum.clone();
        record.size = remote.size;
        if content_changed && !record.is_folder() {
            record.dirty = true;
        }
        changed
    }

    /// Moves a record to a new desired path, leaving a redirect at the old
    /// local path. Returns false when the path did not change.
    fn relocate(&mut self, id: &str, desired: String, pending: &mut Pending) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.desired_local_path == desired {
            return false;
        }
        let old_desired = std::mem::replace(&mut record.desired_local_path, desired.clone());
        let old_local = record.local_path.clone();
        let name = record.name.clone();
        if !record.is_folder() {
            record.dirty = true;
        }

        if !pending.fresh.contains(id) {
            let seq = self.bump_seq();
            let mut redirect = FileRecord::synthetic(
                redirect_record_id(&old_local),
                REDIRECT_MIME,
                name,
                old_local,
                seq,
            );
            redirect.redirect_to = Some(id.to_string());
            self.records.insert(redirect.id.clone(), redirect);
        }

        pending.push(&old_desired);
        pending.push(&desired);
        true
    }

    fn remove_subtree(&mut self, id: &str, pending: &mut Pending) -> Vec<String> {
        let mut removed = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            let Some(record) = self.records.remove(&current) else {
                continue;
            };
            pending.push(&record.desired_local_path);
            stack.extend(
                self.records
                    .values()
                    .filter(|child| child.parent_id.as_deref() == Some(current.as_str()))
                    .map(|child| child.id.clone()),
            );
            removed.push(current);
        }
        removed
    }

    /// Re-derives the desired path of every child of `folder_id` from the
    /// folder's current local path.
    fn cascade_children(&mut self, folder_id: &str, pending: &mut Pending) {
        let Some(folder) = self.records.get(folder_id) else {
            return;
        };
        let parent_local = folder.local_path.clone();
        let moves: Vec<(String, String)> = self
            .records
            .values()
            .filter(|child| child.is_live() && child.parent_id.as_deref() == Some(folder_id))
            .map(|child| {
                (
                    child.id.clone(),
                    join_local(&parent_local, &local_file_name(&child.name, &child.mime_type)),
                )
            })
            .collect();
        for (id, desired) in moves {
            self.relocate(&id, desired, pending);
        }
    }

    fn desired_path_for(&self, parent_id: Option<&str>, name: &str, mime_type: &str) -> String {
        let parent_local = match parent_id {
            Some(parent) if Some(parent) != self.root_id.as_deref() => self
                .records
                .get(parent)
                .filter(|record| record.is_folder())
                .map(|record| record.local_path.as_str())
                .unwrap_or(""),
            _ => "",
        };
        join_local(parent_local, &local_file_name(name, mime_type))
    }

    /// Runs conflict checks until no touched path is left, cascading folder
    /// moves into their children, then collects stale redirects.
    fn settle(&mut self, pending: &mut Pending) {
        while let Some(path) = pending.pop() {
            for folder_id in self.check_conflicts(&path) {
                self.cascade_children(&folder_id, pending);
            }
        }
        self.drop_shadowed_redirects();
        self.collect_redirects();
    }

    fn held_paths(&self) -> HashSet<String> {
        self.records
            .values()
            .map(|record| record.local_path.clone())
            .collect()
    }

    fn orphaned_since(&self, before: &HashSet<String>) -> Vec<String> {
        let now = self.held_paths();
        let mut orphaned: Vec<String> = before.difference(&now).cloned().collect();
        orphaned.sort();
        orphaned
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn redirect_record_id(local_path: &str) -> String {
    format!("{REDIRECT_MIME}:{local_path}")
}

fn conflict_record_id(desired_path: &str) -> String {
    format!("{CONFLICT_MIME}:{desired_path}")
}

include!("conflict.rs");

#[cfg(test)]
#[path = "files_tests.rs"]
mod tests;
