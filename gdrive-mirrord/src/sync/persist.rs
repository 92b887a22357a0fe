use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Reads a JSON state file. A missing, unreadable or malformed file yields
/// `T::default()` so a bad shutdown never blocks the next start.
pub async fn load_json_or_default<T>(path: &Path) -> T
where
    T: DeserializeOwned + Default,
{
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return T::default(),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "state file unreadable, starting empty");
            return T::default();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "state file is corrupt, starting empty");
            T::default()
        }
    }
}

/// Replaces `path` with the JSON encoding of `value` via a sibling temp file
/// and a rename, so readers see either the old or the new content.
pub async fn write_json_atomic<T>(path: &Path, value: &T) -> io::Result<()>
where
    T: Serialize + ?Sized,
{
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = temp_path(path);
    tokio::fs::write(&tmp, &bytes).await?;
    let file = tokio::fs::File::open(&tmp).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await
}

pub(crate) fn temp_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[tokio::test]
    async fn missing_file_loads_default() {
        let dir = tempdir().unwrap();
        let value: BTreeMap<String, u32> = load_json_or_default(&dir.path().join("none.json")).await;
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn corrupt_file_loads_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("files.json");
        std::fs::write(&path, b"{\"a\": 1,,,").unwrap();
        let value: BTreeMap<String, u32> = load_json_or_default(&path).await;
        assert!(value.is_empty());
    }

    #[tokio::test]
    async fn atomic_write_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/files.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u32);
        write_json_atomic(&path, &value).await.unwrap();
        value.insert("b".to_string(), 2u32);
        write_json_atomic(&path, &value).await.unwrap();

        let loaded: BTreeMap<String, u32> = load_json_or_default(&path).await;
        assert_eq!(loaded, value);
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn temp_path_keeps_extension() {
        assert_eq!(
            temp_path(Path::new("/s/files.json")),
            PathBuf::from("/s/files.json.partial")
        );
        assert_eq!(temp_path(Path::new("/s/raw")), PathBuf::from("/s/raw.partial"));
    }
}
