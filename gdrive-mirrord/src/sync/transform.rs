use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use super::files::FileRecord;
use super::persist::temp_path;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot transform {id}: {message}")]
    Failed { id: String, message: String },
}

/// Turns downloaded sources into mirror artifacts and renders the pages that
/// stand in for conflicts and redirects. `target` is the absolute artifact
/// path; implementations create parent directories as needed.
#[async_trait]
pub trait Transformer: Send + Sync {
    async fn transform(
        &self,
        record: &FileRecord,
        source: &Path,
        target: &Path,
    ) -> Result<(), TransformError>;

    async fn render_conflict(
        &self,
        record: &FileRecord,
        members: &[FileRecord],
        target: &Path,
    ) -> Result<(), TransformError>;

    async fn render_redirect(
        &self,
        record: &FileRecord,
        destination: &FileRecord,
        target: &Path,
    ) -> Result<(), TransformError>;
}

/// Copies sources unchanged and writes small Markdown stand-in pages.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughTransformer;

#[async_trait]
impl Transformer for PassthroughTransformer {
    async fn transform(
        &self,
        _record: &FileRecord,
        source: &Path,
        target: &Path,
    ) -> Result<(), TransformError> {
        ensure_parent(target).await?;
        let tmp = temp_path(target);
        tokio::fs::copy(source, &tmp).await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }

    async fn render_conflict(
        &self,
        record: &FileRecord,
        members: &[FileRecord],
        target: &Path,
    ) -> Result<(), TransformError> {
        let mut page = format!(
            "# {}\n\nSeveral remote files map to this path:\n\n",
            record.name
        );
        for member in members {
            page.push_str(&format!(
                "- [{}]({})\n",
                member.name,
                relative_link(&record.local_path, &member.local_path)
            ));
        }
        write_page(target, &page).await
    }

    async fn render_redirect(
        &self,
        record: &FileRecord,
        destination: &FileRecord,
        target: &Path,
    ) -> Result<(), TransformError> {
        let page = format!(
            "# {}\n\nThis file moved to [{}]({}).\n",
            record.name,
            destination.name,
            relative_link(&record.local_path, &destination.local_path)
        );
        write_page(target, &page).await
    }
}

async fn ensure_parent(target: &Path) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn write_page(target: &Path, page: &str) -> Result<(), TransformError> {
    ensure_parent(target).await?;
    let tmp = temp_path(target);
    tokio::fs::write(&tmp, page.as_bytes()).await?;
    tokio::fs::rename(&tmp, target).await?;
    Ok(())
}

/// Link from the page at mirror path `from` to mirror path `to`.
pub fn relative_link(from: &str, to: &str) -> String {
    let from_dirs: Vec<&str> = match from.rsplit_once('/') {
        Some((dir, _)) => dir.split('/').collect(),
        None => Vec::new(),
    };
    let to_parts: Vec<&str> = to.split('/').collect();
    let shared = from_dirs
        .iter()
        .zip(&to_parts)
        .take_while(|(a, b)| a == b)
        .count()
        .min(to_parts.len().saturating_sub(1));

    let mut parts: Vec<&str> = vec![".."; from_dirs.len() - shared];
    parts.extend(&to_parts[shared..]);
    parts.join("/")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformEntry {
    pub id: String,
    pub local_path: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub modified_time: Option<OffsetDateTime>,
}

pub type TransformSnapshot = BTreeMap<String, TransformEntry>;

/// Which artifact version was last produced for each record, persisted as
/// `transform.json`.
#[derive(Debug, Default)]
pub struct TransformLog {
    entries: TransformSnapshot,
    needs_flush: bool,
}

impl TransformLog {
    pub fn from_snapshot(entries: TransformSnapshot) -> Self {
        Self {
            entries,
            needs_flush: false,
        }
    }

    pub fn snapshot(&self) -> TransformSnapshot {
        self.entries.clone()
    }

    pub fn get(&self, id: &str) -> Option<&TransformEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn record(&mut self, record: &FileRecord) {
        let entry = TransformEntry {
            id: record.id.clone(),
            local_path: record.local_path.clone(),
            modified_time: record.modified_time,
        };
        if self.entries.get(&record.id) != Some(&entry) {
            self.entries.insert(record.id.clone(), entry);
            self.needs_flush = true;
        }
    }

    /// True when the last artifact for `record` was produced at its current
    /// local path from its current version.
    pub fn matches(&self, record: &FileRecord) -> bool {
        self.entries.get(&record.id).is_some_and(|entry| {
            entry.local_path == record.local_path && entry.modified_time == record.modified_time
        })
    }

    pub fn forget(&mut self, id: &str) {
        if self.entries.remove(id).is_some() {
            self.needs_flush = true;
        }
    }

    pub fn take_needs_flush(&mut self) -> bool {
        std::mem::take(&mut self.needs_flush)
    }

    pub fn restore_needs_flush(&mut self) {
        self.needs_flush = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::files::{FileStore, RemoteFile};
    use crate::sync::paths::DOCUMENT_MIME;
    use tempfile::tempdir;
    use time::macros::datetime;

    fn record(id: &str, name: &str) -> FileRecord {
        let mut store = FileStore::new(None);
        store.merge(vec![
            RemoteFile::new(id, name, DOCUMENT_MIME)
                .with_modified_time(datetime!(2024-05-01 12:00 UTC)),
        ]);
        store.get(id).unwrap().clone()
    }

    #[test]
    fn relative_links_walk_up_and_down() {
        assert_eq!(relative_link("a.md", "b.md"), "b.md");
        assert_eq!(relative_link("docs/a.md", "docs/a_1.md"), "a_1.md");
        assert_eq!(relative_link("old/deep/a.md", "new/a.md"), "../../new/a.md");
        assert_eq!(relative_link("a.md", "guides/a.md"), "guides/a.md");
        assert_eq!(relative_link("guides/a.md", "guides"), "../guides");
    }

    #[tokio::test]
    async fn passthrough_copies_into_nested_target() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.html");
        tokio::fs::write(&source, b"<p>hi</p>").await.unwrap();
        let target = dir.path().join("mirror/docs/page.md");

        PassthroughTransformer
            .transform(&record("a", "Page"), &source, &target)
            .await
            .unwrap();

        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"<p>hi</p>");
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn conflict_page_links_every_member() {
        let dir = tempdir().unwrap();
        let mut conflict = record("conflict:docs/page.md", "page.md");
        conflict.local_path = "docs/page.md".into();
        let mut first = record("a", "Page");
        first.local_path = "docs/page_1.md".into();
        let mut second = record("b", "page");
        second.local_path = "docs/page_2.md".into();
        let target = dir.path().join("docs/page.md");

        PassthroughTransformer
            .render_conflict(&conflict, &[first, second], &target)
            .await
            .unwrap();

        let page = tokio::fs::read_to_string(&target).await.unwrap();
        assert!(page.contains("- [Page](page_1.md)"));
        assert!(page.contains("- [page](page_2.md)"));
    }

    #[tokio::test]
    async fn redirect_page_points_at_new_location() {
        let dir = tempdir().unwrap();
        let mut redirect = record("redirect:old/a.md", "A");
        redirect.local_path = "old/a.md".into();
        let mut moved = record("a", "A");
        moved.local_path = "new/a.md".into();
        let target = dir.path().join("old/a.md");

        PassthroughTransformer
            .render_redirect(&redirect, &moved, &target)
            .await
            .unwrap();

        let page = tokio::fs::read_to_string(&target).await.unwrap();
        assert!(page.contains("[A](../new/a.md)"));
    }

    #[test]
    fn log_matches_only_same_path_and_version() {
        let mut log = TransformLog::default();
        let mut page = record("a", "Page");
        assert!(!log.matches(&page));

        log.record(&page);
        assert!(log.matches(&page));
        assert!(log.take_needs_flush());

        log.record(&page);
        assert!(!log.take_needs_flush(), "unchanged entry is not rewritten");

        page.local_path = "moved.md".into();
        assert!(!log.matches(&page));

        page.local_path = "page.md".into();
        page.modified_time = Some(datetime!(2024-06-01 00:00 UTC));
        assert!(!log.matches(&page));

        log.forget("a");
        assert!(log.is_empty());
    }

    #[test]
    fn log_snapshot_round_trips_through_json() {
        let mut log = TransformLog::default();
        log.record(&record("a", "Page"));
        let json = serde_json::to_string(&log.snapshot()).unwrap();
        assert!(json.contains("\"localPath\":\"page.md\""));

        let restored = TransformLog::from_snapshot(serde_json::from_str(&json).unwrap());
        assert!(restored.matches(&record("a", "Page")));
    }
}
