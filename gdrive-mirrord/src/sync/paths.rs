use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub use gdrive_core::FOLDER_MIME;

pub const DOCUMENT_MIME: &str = "application/vnd.google-apps.document";
pub const DRAWING_MIME: &str = "application/vnd.google-apps.drawing";
pub const SPREADSHEET_MIME: &str = "application/vnd.google-apps.spreadsheet";
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("local path is empty")]
    Empty,
    #[error("local path contains unsupported component")]
    UnsupportedComponent,
}

/// Lowercases `name` and collapses every run of characters that are not
/// alphanumeric into a single `-`.
pub fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

/// File name an item occupies inside its parent directory.
pub fn local_file_name(name: &str, mime_type: &str) -> String {
    match mime_type {
        FOLDER_MIME => slugify(name),
        DOCUMENT_MIME => format!("{}.md", slugify(name)),
        DRAWING_MIME => format!("{}.svg", slugify(name)),
        SPREADSHEET_MIME => format!("{}.csv", slugify(name)),
        other if other.starts_with(NATIVE_MIME_PREFIX) => slugify(name),
        _ => match name.rsplit_once('.') {
            Some((stem, ext))
                if !stem.trim().is_empty()
                    && !ext.is_empty()
                    && ext.chars().all(|c| c.is_ascii_alphanumeric()) =>
            {
                format!("{}.{}", slugify(stem), ext.to_ascii_lowercase())
            }
            _ => slugify(name),
        },
    }
}

pub fn join_local(parent: &str, file_name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        file_name.to_string()
    } else {
        format!("{parent}/{file_name}")
    }
}

/// `docs/a.md` + 2 -> `docs/a_2.md`. The suffix goes before the extension of
/// the last component only.
pub fn with_counter_suffix(path: &str, counter: u32) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem}_{counter}.{ext}");
    }

    format!("{dir}{name}_{counter}")
}

/// Format native documents are exported as before transformation, or `None`
/// for binary files that are downloaded as-is.
pub fn export_mime_for(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        DOCUMENT_MIME => Some("text/html"),
        DRAWING_MIME => Some("image/svg+xml"),
        SPREADSHEET_MIME => Some("text/csv"),
        other if other.starts_with(NATIVE_MIME_PREFIX) => Some("application/pdf"),
        _ => None,
    }
}

/// Maps a mirror-relative path ("docs/a.md") under `root`.
pub fn mirror_path_for(root: &Path, local_path: &str) -> Result<PathBuf, PathError> {
    if local_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(local_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}
