//! Bulk file downloads: attachments, emoji images, and avatars all go
//! through the same skip-if-present-unless-redownload helper. Directories
//! are created lazily — only once the first file in a batch actually needs
//! writing.

use std::path::{Path, PathBuf};

use archive_client::ServerClient;
use tokio::io::AsyncWriteExt;

use crate::error::AppError;

/// Guesses a filename suffix from a `Content-Type` header value: a small
/// table of the common cases, falling back to whatever follows the `/` in
/// `type/subtype`.
fn suffix_from_content_type(content_type: &str) -> String {
    let content_type = content_type.split(';').next().unwrap_or(content_type).trim();
    match content_type {
        "image/jpeg" => ".jpg".to_string(),
        "image/png" => ".png".to_string(),
        "image/gif" => ".gif".to_string(),
        "image/webp" => ".webp".to_string(),
        "image/svg+xml" => ".svg".to_string(),
        "application/pdf" => ".pdf".to_string(),
        "text/plain" => ".txt".to_string(),
        "application/json" => ".json".to_string(),
        "video/mp4" => ".mp4".to_string(),
        "audio/mpeg" => ".mp3".to_string(),
        other => match other.split_once('/') {
            Some((_, subtype)) if !subtype.is_empty() => format!(".{subtype}"),
            _ => {
                log::warn!("can't guess extension from content type {other:?}, leaving empty");
                String::new()
            }
        },
    }
}

/// Finds a pre-existing file in `directory` whose stem matches `stem`,
/// regardless of suffix.
fn find_existing(directory: &Path, stem: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(directory).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.file_stem().and_then(|s| s.to_str()) == Some(stem) {
            return Some(path);
        }
    }
    None
}

/// Downloads `url` into `directory/<stem><suffix>` unless a same-stemmed
/// file is already present and `redownload` is false. Returns the filename
/// (not full path) actually used on disk. Refuses stems containing `/`.
pub async fn store_file(
    client: &ServerClient,
    url: &str,
    stem: &str,
    directory: &Path,
    suffix_hint: Option<String>,
    redownload: bool,
) -> Result<String, AppError> {
    if stem.contains('/') {
        return Err(AppError::Io {
            path: directory.join(stem),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "refusing to store file with '/' in its name"),
        });
    }

    if !redownload {
        if let Some(existing) = find_existing(directory, stem) {
            return Ok(existing.file_name().unwrap().to_string_lossy().into_owned());
        }
    }

    let response = client.download(url).await?;

    let suffix = match suffix_hint {
        Some(s) => s,
        None => response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(suffix_from_content_type)
            .unwrap_or_default(),
    };

    let filename = format!("{stem}{suffix}");
    let path = directory.join(&filename);

    let bytes = response.bytes().await.map_err(|source| AppError::Client(
        archive_client::ClientError::RequestExecute { endpoint: url.to_string(), source },
    ))?;

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|source| AppError::Io { path: path.clone(), source })?;
    file.write_all(&bytes).await.map_err(|source| AppError::Io { path, source })?;

    Ok(filename)
}

/// Ensures `directory` exists, creating it (and logging) only on first use.
pub async fn ensure_directory(directory: &Path) -> Result<(), AppError> {
    if !directory.is_dir() {
        tokio::fs::create_dir_all(directory)
            .await
            .map_err(|source| AppError::CreateOutputDirectory { path: directory.to_path_buf(), source })?;
    }
    Ok(())
}
