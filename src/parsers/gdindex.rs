//! GdIndex / GoIndex parser.
//!
//! GoIndex-style sites front a Google Drive through a serverless worker;
//! the landing page is a JS shell, but the listing is served as JSON in
//! response to a POST against the directory path. Once a GoIndex site is
//! recognized, the root id is kept as a session parameter so every later
//! directory of the session dispatches here directly.

use async_trait::async_trait;
use serde_json::{json, Value};
use url::Url;

use super::{ListingParser, ParsedListing, ResponseContext};
use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;
use crate::session::{Session, PARAM_GDINDEX_ROOT_ID};
use crate::types::FileEntry;

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const BODY_MARKERS: &[&str] = &["GoIndex", "go2index", "goindex-theme"];

pub struct GdIndexParser;

#[async_trait]
impl ListingParser for GdIndexParser {
    fn label(&self) -> &'static str {
        "gdindex"
    }

    fn detect(&self, session: &Session, ctx: &ResponseContext<'_>) -> bool {
        session.parameters.contains_key(PARAM_GDINDEX_ROOT_ID)
            || BODY_MARKERS.iter().any(|marker| ctx.body.contains(marker))
    }

    async fn parse(
        &self,
        session: &Session,
        fetcher: &Fetcher,
        ctx: &ResponseContext<'_>,
    ) -> Result<ParsedListing, CrawlError> {
        session
            .parameters
            .entry(PARAM_GDINDEX_ROOT_ID.to_string())
            .or_insert_with(|| "root".to_string());

        let request = json!({
            "page_token": null,
            "page_index": 0,
            "q": "",
        });
        let text = fetcher.post_json(ctx.url, &request).await?;
        let payload: Value =
            serde_json::from_str(&text).map_err(|e| CrawlError::Parse(e.to_string()))?;

        let mut listing = ParsedListing {
            parser: self.label().to_string(),
            ..Default::default()
        };
        collect_entries(ctx.url, &payload, &mut listing)?;
        Ok(listing)
    }
}

/// Entries live under `data.files` on current workers and `files` on
/// older ones.
fn collect_entries(
    base: &Url,
    payload: &Value,
    listing: &mut ParsedListing,
) -> Result<(), CrawlError> {
    let files = payload["data"]["files"]
        .as_array()
        .or_else(|| payload["files"].as_array())
        .ok_or_else(|| CrawlError::Parse("no file array in GoIndex response".to_string()))?;

    for entry in files {
        let Some(name) = entry["name"].as_str() else {
            continue;
        };
        let mime = entry["mimeType"].as_str().unwrap_or("");

        if mime == FOLDER_MIME {
            if let Ok(url) = base.join(&format!("{}/", name)) {
                listing.subdirectories.push(url);
            }
        } else if let Ok(url) = base.join(name) {
            let mut file = FileEntry::new(url, name);
            // Workers serialize size as either a JSON number or a string
            file.size = entry["size"]
                .as_u64()
                .or_else(|| entry["size"].as_str().and_then(|s| s.parse().ok()));
            listing.files.push(file);
        }
    }
    Ok(())
}
