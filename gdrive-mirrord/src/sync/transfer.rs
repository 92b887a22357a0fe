use std::io;
use std::path::Path;

use futures_util::StreamExt;
use md5::Context;
use reqwest::Response;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use super::persist::temp_path;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransferError {
    /// Broken streams and bad checksums are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(_) | TransferError::IntegrityMismatch { .. } => true,
            TransferError::Io(_) => false,
        }
    }
}

/// Streams `response` into `target` through a sibling `.partial` file that
/// is renamed into place only once complete and, when `expected_md5` is
/// given, verified. `on_progress` sees the running byte count after every
/// chunk. Returns the number of bytes written. On any failure the partial
/// file is removed and an existing `target` is left untouched.
pub async fn save_response<F>(
    response: Response,
    target: &Path,
    expected_md5: Option<&str>,
    on_progress: F,
) -> Result<u64, TransferError>
where
    F: FnMut(u64) + Send,
{
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = temp_path(target);
    let saved = match write_partial(response, &partial, expected_md5, on_progress).await {
        Ok(written) => tokio::fs::rename(&partial, target)
            .await
            .map(|()| written)
            .map_err(TransferError::from),
        Err(err) => Err(err),
    };
    match saved {
        Ok(written) => {
            tracing::debug!(target = %target.display(), bytes = written, "download saved");
            Ok(written)
        }
        Err(err) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(err)
        }
    }
}

async fn write_partial<F>(
    response: Response,
    partial: &Path,
    expected_md5: Option<&str>,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    F: FnMut(u64) + Send,
{
    let mut file = tokio::fs::File::create(partial).await?;
    let mut stream = response.bytes_stream();
    let mut md5 = expected_md5.map(|_| Context::new());
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&chunk);
        }
        written += chunk.len() as u64;
        on_progress(written);
    }
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    if let (Some(expected), Some(ctx)) = (expected_md5, md5) {
        let actual_md5 = format!("{:x}", ctx.compute());
        if actual_md5 != expected.to_ascii_lowercase() {
            return Err(TransferError::IntegrityMismatch {
                expected_md5: expected.to_ascii_lowercase(),
                actual_md5,
            });
        }
    }
    Ok(written)
}
