//! Calibre content-server parser.
//!
//! Detected by the `Server` response header or the `CALIBRE_VERSION`
//! marker in the landing page. The catalog is walked through the ajax
//! API in pages of 100 books, paced to at most one page per 30 seconds
//! so the server's own rate limiting never trips.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use url::Url;

use super::{ListingParser, ParsedListing, ResponseContext};
use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;
use crate::session::Session;
use crate::types::FileEntry;

const VERSION_MARKER: &str = "CALIBRE_VERSION = \"";
const BOOKS_PER_PAGE: usize = 100;
const PAGE_INTERVAL: Duration = Duration::from_secs(30);
/// Backstop against servers that report absurd catalog sizes.
const MAX_PAGES: usize = 500;

pub struct CalibreParser;

#[async_trait]
impl ListingParser for CalibreParser {
    fn label(&self) -> &'static str {
        "calibre"
    }

    fn detect(&self, _session: &Session, ctx: &ResponseContext<'_>) -> bool {
        let server_match = ctx
            .server
            .map(|server| server.to_ascii_lowercase().contains("calibre"))
            .unwrap_or(false);
        server_match || ctx.body.contains(VERSION_MARKER)
    }

    async fn parse(
        &self,
        _session: &Session,
        fetcher: &Fetcher,
        ctx: &ResponseContext<'_>,
    ) -> Result<ParsedListing, CrawlError> {
        if let Some(version) = extract_version(ctx.body) {
            tracing::info!(version = %version, "calibre content server detected");
        }

        let origin = server_origin(ctx.url)?;
        let mut listing = ParsedListing {
            parser: self.label().to_string(),
            flat: true,
            ..Default::default()
        };

        let mut offset = 0usize;
        for page in 0..MAX_PAGES {
            if page > 0 {
                tokio::time::sleep(PAGE_INTERVAL).await;
            }

            let search_url = Url::parse(&format!(
                "{}/ajax/search?num={}&offset={}&sort=timestamp&sort_order=desc",
                origin, BOOKS_PER_PAGE, offset
            ))
            .map_err(|e| CrawlError::Parse(e.to_string()))?;

            let search = fetch_json(fetcher, &search_url).await?;
            let total = search["total_num"].as_u64().unwrap_or(0) as usize;
            let book_ids: Vec<u64> = search["book_ids"]
                .as_array()
                .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
                .unwrap_or_default();

            if book_ids.is_empty() {
                break;
            }

            let ids_param = book_ids
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let books_url = Url::parse(&format!("{}/ajax/books?ids={}", origin, ids_param))
                .map_err(|e| CrawlError::Parse(e.to_string()))?;
            let books = fetch_json(fetcher, &books_url).await?;

            for id in &book_ids {
                if let Some(book) = books.get(id.to_string()) {
                    collect_book_files(&origin, *id, book, &mut listing.files);
                }
            }

            offset += book_ids.len();
            if offset >= total {
                break;
            }
        }

        if listing.files.is_empty() {
            return Err(CrawlError::EmptyListing);
        }
        Ok(listing)
    }
}

/// One downloadable file per book format.
fn collect_book_files(origin: &str, id: u64, book: &Value, files: &mut Vec<FileEntry>) {
    let title = book["title"].as_str().unwrap_or("untitled");

    let formats: Vec<String> = book["formats"]
        .as_array()
        .map(|formats| {
            formats
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    for format in formats {
        let Ok(url) = Url::parse(&format!("{}/get/{}/{}", origin, format.to_uppercase(), id))
        else {
            continue;
        };
        let mut file = FileEntry::new(url, format!("{}.{}", title, format.to_lowercase()));

        if let Some(meta) = book["format_metadata"].get(format.to_lowercase()) {
            file.size = meta["size"].as_u64();
            file.timestamp = meta["mtime"]
                .as_str()
                .and_then(|mtime| DateTime::parse_from_rfc3339(mtime).ok())
                .map(|dt| dt.with_timezone(&Utc));
        }
        files.push(file);
    }
}

async fn fetch_json(fetcher: &Fetcher, url: &Url) -> Result<Value, CrawlError> {
    let response = fetcher.get_streaming(url).await?;
    let text = response.text().await.map_err(CrawlError::from_reqwest)?;
    serde_json::from_str(&text).map_err(|e| CrawlError::Parse(e.to_string()))
}

/// scheme://host[:port] without any path.
fn server_origin(url: &Url) -> Result<String, CrawlError> {
    let host = url
        .host_str()
        .ok_or_else(|| CrawlError::Parse("listing URL has no host".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// The quoted value following the version marker.
fn extract_version(body: &str) -> Option<String> {
    let start = body.find(VERSION_MARKER)? + VERSION_MARKER.len();
    let rest = &body[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}
