use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use image::DynamicImage;
use reqwest::header::USER_AGENT;

use crate::config::{DOWNLOAD_TIMEOUT, FETCH_USER_AGENT};
use crate::error::LoadError;

/// Loads one cell image. `local` is the registry's local copy, tried before
/// `reference` whenever it exists on disk.
pub(crate) async fn load_cell_image(
    http: &reqwest::Client,
    reference: &str,
    local: Option<&str>,
) -> Result<DynamicImage, LoadError> {
    let bytes = if let Some(payload) = reference.strip_prefix("data:") {
        decode_data_url(payload)?
    } else if let Some(local) = local.filter(|path| Path::new(path).is_file()) {
        read_file(local).await?
    } else if reference.starts_with("http://") || reference.starts_with("https://") {
        fetch(http, reference).await?
    } else if let Some(path) = reference.strip_prefix("file://") {
        read_file(path).await?
    } else if reference.contains("://") {
        return Err(LoadError::UnsupportedScheme(reference.to_string()));
    } else {
        read_file(reference).await?
    };

    if bytes.is_empty() {
        return Err(LoadError::EmptyPayload(describe(reference)));
    }
    let image = image::load_from_memory(&bytes)?;
    if image.width() == 0 || image.height() == 0 {
        return Err(LoadError::ZeroDimensions);
    }
    Ok(image)
}

fn decode_data_url(payload: &str) -> Result<Vec<u8>, LoadError> {
    let (meta, data) = payload.split_once(',').ok_or(LoadError::DataUrl)?;
    if !meta.ends_with(";base64") {
        return Err(LoadError::DataUrl);
    }
    BASE64.decode(data.trim()).map_err(|_| LoadError::DataUrl)
}

async fn read_file(path: &str) -> Result<Vec<u8>, LoadError> {
    tokio::fs::read(path).await.map_err(|source| LoadError::Read {
        path: path.to_string(),
        source,
    })
}

async fn fetch(http: &reqwest::Client, url: &str) -> Result<Vec<u8>, LoadError> {
    let response = http
        .get(url)
        .header(USER_AGENT, FETCH_USER_AGENT)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|err| LoadError::Fetch(url.to_string(), err.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(LoadError::Fetch(url.to_string(), format!("HTTP {status}")));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|err| LoadError::Fetch(url.to_string(), err.to_string()))?;
    Ok(bytes.to_vec())
}

fn describe(reference: &str) -> String {
    if reference.starts_with("data:") {
        "data URL".to_string()
    } else {
        reference.to_string()
    }
}
