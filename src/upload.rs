//! Paste-host upload for the URL list: primary host first, fallback on
//! any failure.

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::multipart::{Form, Part};

const PRIMARY_HOST: &str = "https://0x0.st";
const FALLBACK_HOST: &str = "https://paste.rs/";

/// Upload the URL list and return the public link.
pub async fn upload_url_list(client: &reqwest::Client, path: &Path) -> Result<String> {
    let contents = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;

    match upload_primary(client, path, contents.clone()).await {
        Ok(link) => Ok(link),
        Err(error) => {
            tracing::warn!(%error, "primary paste host failed, trying fallback");
            upload_fallback(client, contents).await
        }
    }
}

/// Multipart `file=` upload; the response body is the link.
async fn upload_primary(
    client: &reqwest::Client,
    path: &Path,
    contents: Vec<u8>,
) -> Result<String> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "urls.txt".to_string());

    let form = Form::new().part(
        "file",
        Part::bytes(contents)
            .file_name(file_name)
            .mime_str("text/plain")?,
    );

    let response = client.post(PRIMARY_HOST).multipart(form).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        anyhow::bail!("{} returned {}", PRIMARY_HOST, status);
    }
    Ok(body.trim().to_string())
}

/// Raw body upload; the response body is the link.
async fn upload_fallback(client: &reqwest::Client, contents: Vec<u8>) -> Result<String> {
    let response = client.post(FALLBACK_HOST).body(contents).send().await?;
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() && status.as_u16() != 206 {
        anyhow::bail!("{} returned {}", FALLBACK_HOST, status);
    }
    Ok(body.trim().to_string())
}
