use std::path::{Path, PathBuf};

use muse_contracts::images::ImageId;
use reqwest::header::USER_AGENT;
use tracing::{debug, info};

use crate::config::{DOWNLOAD_TIMEOUT, FETCH_USER_AGENT};
use crate::error::DownloadError;

const KNOWN_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "gif", "webp"];

/// Fetches a remote reference into `<reference_dir>/<id><ext>`.
///
/// Always fetches: ids restart with every session, so a file already sitting
/// at the target path may belong to an unrelated image and is replaced.
pub async fn download_reference(
    http: &reqwest::Client,
    url: &str,
    reference_dir: &Path,
    id: ImageId,
) -> Result<PathBuf, DownloadError> {
    let local_path = reference_path(reference_dir, id, url);
    let response = http
        .get(url)
        .header(USER_AGENT, FETCH_USER_AGENT)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|source| DownloadError::Request {
            url: url.to_string(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(DownloadError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|source| DownloadError::Request {
            url: url.to_string(),
            source,
        })?;
    if bytes.is_empty() {
        return Err(DownloadError::EmptyBody {
            url: url.to_string(),
        });
    }

    let write_err = |source| DownloadError::Write {
        path: local_path.display().to_string(),
        source,
    };
    tokio::fs::create_dir_all(reference_dir)
        .await
        .map_err(write_err)?;
    let staging = local_path.with_extension("part");
    tokio::fs::write(&staging, &bytes)
        .await
        .map_err(write_err)?;
    tokio::fs::rename(&staging, &local_path)
        .await
        .map_err(write_err)?;
    info!(id, url, bytes = bytes.len(), "downloaded reference");
    Ok(local_path)
}

/// Copies a local image file into `<reference_dir>/<id><ext>`, keeping its
/// extension (`.png` when it has none).
pub async fn copy_reference(
    source: &Path,
    reference_dir: &Path,
    id: ImageId,
) -> Result<PathBuf, DownloadError> {
    let ext = source
        .extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        .filter(|ext| !ext.is_empty())
        .unwrap_or_else(|| "png".to_string());
    let target = reference_dir.join(format!("{id}.{ext}"));
    let copy_err = |err| DownloadError::Copy {
        path: target.display().to_string(),
        source: err,
    };
    tokio::fs::create_dir_all(reference_dir)
        .await
        .map_err(copy_err)?;
    tokio::fs::copy(source, &target).await.map_err(copy_err)?;
    debug!(id, from = %source.display(), to = %target.display(), "copied local reference");
    Ok(target)
}

pub fn reference_path(reference_dir: &Path, id: ImageId, url: &str) -> PathBuf {
    reference_dir.join(format!("{id}{}", extension_for_url(url)))
}

/// Extension taken from the URL path (query stripped), `.jpg` when unknown.
pub fn extension_for_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let file_name = path.rsplit('/').next().unwrap_or_default();
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if KNOWN_EXTENSIONS.contains(&ext.as_str()) {
        format!(".{ext}")
    } else {
        ".jpg".to_string()
    }
}
