//! Google Drive folder parser.
//!
//! Drive folders are listed through the embedded folder view, which is
//! plain HTML. File URLs point at Drive's download endpoint and live on
//! different storage hosts than the listing, which is why Drive hosts are
//! exempt from the scope predicate.

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use super::{ListingParser, ParsedListing, ResponseContext};
use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;
use crate::session::Session;
use crate::types::FileEntry;

const DRIVE_HOSTS: &[&str] = &["drive.google.com", "docs.google.com"];

pub struct GoogleDriveParser;

#[async_trait]
impl ListingParser for GoogleDriveParser {
    fn label(&self) -> &'static str {
        "google_drive"
    }

    fn detect(&self, _session: &Session, ctx: &ResponseContext<'_>) -> bool {
        ctx.url
            .host_str()
            .map(|host| DRIVE_HOSTS.contains(&host))
            .unwrap_or(false)
    }

    async fn parse(
        &self,
        _session: &Session,
        fetcher: &Fetcher,
        ctx: &ResponseContext<'_>,
    ) -> Result<ParsedListing, CrawlError> {
        let folder_id = folder_id(ctx.url).ok_or_else(|| {
            CrawlError::Parse("no folder id in Google Drive URL".to_string())
        })?;

        let view_url = Url::parse(&format!(
            "https://drive.google.com/embeddedfolderview?id={}#list",
            folder_id
        ))
        .map_err(|e| CrawlError::Parse(e.to_string()))?;

        let response = fetcher.get_streaming(&view_url).await?;
        let body = response.text().await.map_err(CrawlError::from_reqwest)?;

        let mut listing = parse_folder_view(&body);
        listing.parser = self.label().to_string();
        Ok(listing)
    }
}

/// Folder id from `/drive/folders/<id>` or an `id=` query parameter.
fn folder_id(url: &Url) -> Option<String> {
    if let Some(segments) = url.path_segments() {
        let segments: Vec<&str> = segments.collect();
        if let Some(idx) = segments.iter().position(|s| *s == "folders") {
            if let Some(id) = segments.get(idx + 1) {
                return Some(id.to_string());
            }
        }
    }
    url.query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.into_owned())
}

/// Walk the embedded folder view entries. Parsing stays in a sync helper
/// so the DOM never crosses an await point.
fn parse_folder_view(body: &str) -> ParsedListing {
    let mut listing = ParsedListing::default();
    let document = Html::parse_document(body);

    let (Ok(entry_selector), Ok(anchor_selector), Ok(title_selector)) = (
        Selector::parse("div.flip-entry"),
        Selector::parse("a[href]"),
        Selector::parse(".flip-entry-title"),
    ) else {
        return listing;
    };

    for entry in document.select(&entry_selector) {
        let Some(anchor) = entry.select(&anchor_selector).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let title = entry
            .select(&title_selector)
            .next()
            .map(|t| t.text().collect::<String>())
            .unwrap_or_default();

        let entry_id = entry
            .value()
            .attr("id")
            .and_then(|id| id.strip_prefix("entry-"))
            .map(str::to_string);

        if href.contains("/folders/") {
            if let Ok(folder_url) = Url::parse(href) {
                listing.subdirectories.push(folder_url);
            }
        } else if let Some(id) = entry_id {
            let Ok(file_url) = Url::parse(&format!(
                "https://drive.google.com/uc?id={}&export=download",
                id
            )) else {
                continue;
            };
            listing.files.push(FileEntry::new(file_url, title));
        }
    }

    listing
}
