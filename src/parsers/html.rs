//! Generic HTML directory-listing parsers.
//!
//! Three strategies are tried in order, most structured first:
//! table listings (Apache fancy indexing, h5ai and friends), `<pre>`
//! listings (nginx autoindex, older Apache), and a plain anchor walk as
//! the last resort. Size and timestamp columns are sniffed from the text
//! around each link when present.
//!
//! Pages produced by one-shot tree dumpers enumerate every file of the
//! whole tree on a single page; those are flagged `flat` so the engine
//! does not recurse into subdirectories it has already seen the contents
//! of.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use percent_encoding::percent_decode_str;
use scraper::{Html, Selector};
use url::Url;

use super::{ListingParser, ParsedListing, ResponseContext};
use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;
use crate::session::Session;
use crate::types::FileEntry;

pub struct HtmlListingParser;

#[async_trait]
impl ListingParser for HtmlListingParser {
    fn label(&self) -> &'static str {
        "html_listing"
    }

    fn detect(&self, _session: &Session, _ctx: &ResponseContext<'_>) -> bool {
        true
    }

    async fn parse(
        &self,
        _session: &Session,
        _fetcher: &Fetcher,
        ctx: &ResponseContext<'_>,
    ) -> Result<ParsedListing, CrawlError> {
        Ok(parse_listing(ctx.url, ctx.body))
    }
}

/// One resolved link from a listing page.
enum Entry {
    Dir(Url),
    File(Url),
}

/// Parse a listing body with the structured strategies first.
pub fn parse_listing(base: &Url, body: &str) -> ParsedListing {
    let document = Html::parse_document(body);

    let mut listing = parse_table(&document, base)
        .or_else(|| parse_pre(&document, base))
        .unwrap_or_else(|| parse_anchor_wall(&document, base));

    if is_flat_tree_dump(base, &listing.files) {
        listing.parser = "html_flat_index".to_string();
        listing.flat = true;
    }
    listing
}

/// Table-based listings: one row per entry, size/date in sibling cells.
fn parse_table(document: &Html, base: &Url) -> Option<ParsedListing> {
    let row_selector = Selector::parse("table tr").ok()?;
    let anchor_selector = Selector::parse("a[href]").ok()?;
    let cell_selector = Selector::parse("td, th").ok()?;

    let mut listing = ParsedListing {
        parser: "html_table".to_string(),
        ..Default::default()
    };
    let mut matched = 0usize;

    for row in document.select(&row_selector) {
        let Some(anchor) = row.select(&anchor_selector).next() else {
            continue;
        };
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(entry) = resolve_entry(base, href) else {
            continue;
        };
        matched += 1;

        match entry {
            Entry::Dir(url) => listing.subdirectories.push(url),
            Entry::File(url) => {
                let mut file = FileEntry::new(url.clone(), file_display_name(&url));
                for cell in row.select(&cell_selector) {
                    let text: String = cell.text().collect::<String>();
                    let text = text.trim();
                    if file.timestamp.is_none() {
                        if let Some(ts) = parse_listing_timestamp(text) {
                            file.timestamp = Some(ts);
                            continue;
                        }
                    }
                    if file.size.is_none() && !text.contains(&file.name) {
                        if let Some(size) = parse_size_token(text) {
                            file.size = Some(size);
                        }
                    }
                }
                listing.files.push(file);
            }
        }
    }

    (matched > 0).then_some(listing)
}

/// `<pre>` listings: anchors followed by a raw text column of date + size.
fn parse_pre(document: &Html, base: &Url) -> Option<ParsedListing> {
    let anchor_selector = Selector::parse("pre a[href]").ok()?;

    let mut listing = ParsedListing {
        parser: "html_pre".to_string(),
        ..Default::default()
    };
    let mut matched = 0usize;

    for anchor in document.select(&anchor_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(entry) = resolve_entry(base, href) else {
            continue;
        };
        matched += 1;

        match entry {
            Entry::Dir(url) => listing.subdirectories.push(url),
            Entry::File(url) => {
                let mut file = FileEntry::new(url.clone(), file_display_name(&url));
                // The size/date column is the text node right after the link
                if let Some(text) = anchor
                    .next_sibling()
                    .and_then(|node| node.value().as_text().map(|t| t.to_string()))
                {
                    let line = text.lines().next().unwrap_or("");
                    file.timestamp = parse_listing_timestamp_in(line);
                    file.size = line
                        .split_whitespace()
                        .last()
                        .and_then(parse_size_token);
                }
                listing.files.push(file);
            }
        }
    }

    (matched > 0).then_some(listing)
}

/// Last resort: every anchor on the page, no metadata.
fn parse_anchor_wall(document: &Html, base: &Url) -> ParsedListing {
    let mut listing = ParsedListing {
        parser: "html_listing".to_string(),
        ..Default::default()
    };
    let Ok(anchor_selector) = Selector::parse("a[href]") else {
        return listing;
    };

    for anchor in document.select(&anchor_selector) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        match resolve_entry(base, href) {
            Some(Entry::Dir(url)) => listing.subdirectories.push(url),
            Some(Entry::File(url)) => {
                let name = file_display_name(&url);
                listing.files.push(FileEntry::new(url, name));
            }
            None => {}
        }
    }
    listing
}

/// Resolve an href against the listing URL, dropping self links, sort
/// links, ancestor backlinks, and non-crawlable schemes.
fn resolve_entry(base: &Url, href: &str) -> Option<Entry> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') || href.starts_with('?') {
        return None;
    }
    let lowered = href.to_ascii_lowercase();
    if lowered.starts_with("mailto:") || lowered.starts_with("javascript:") || lowered.starts_with("data:") {
        return None;
    }

    let resolved = base.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https" | "ftp" | "ftps") {
        return None;
    }

    if resolved.host_str() == base.host_str() {
        // Self links and ?sort=... views of the same path
        if resolved.path() == base.path() {
            return None;
        }
        // `..` style backlinks resolve to an ancestor of the listing
        if base.path().starts_with(resolved.path()) {
            return None;
        }
    }

    if resolved.path().ends_with('/') {
        Some(Entry::Dir(resolved))
    } else {
        Some(Entry::File(resolved))
    }
}

/// Percent-decoded last path segment.
pub fn file_display_name(url: &Url) -> String {
    let raw = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .unwrap_or("");
    percent_decode_str(raw)
        .decode_utf8()
        .map(|cow| cow.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

/// Parse a listing size cell: plain byte counts, `-` for directories, and
/// suffixed values like `1.5K`, `23M`, `4.2 GB`.
fn parse_size_token(token: &str) -> Option<u64> {
    let token = token.trim();
    if token.is_empty() || token == "-" {
        return None;
    }
    if let Ok(bytes) = token.parse::<u64>() {
        return Some(bytes);
    }

    let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    let split = compact.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, suffix) = compact.split_at(split);
    let number: f64 = number.parse().ok()?;
    let multiplier = match suffix.chars().next()?.to_ascii_lowercase() {
        'b' => 1.0,
        'k' => 1024.0,
        'm' => 1024.0 * 1024.0,
        'g' => 1024.0 * 1024.0 * 1024.0,
        't' => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((number * multiplier) as u64)
}

/// Timestamp formats seen across autoindex implementations.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%d-%b-%Y %H:%M",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%d-%b-%Y %H:%M:%S",
    "%m/%d/%Y %I:%M %p",
];

fn parse_listing_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Find a timestamp anywhere in a raw listing line by scanning token pairs.
fn parse_listing_timestamp_in(line: &str) -> Option<DateTime<Utc>> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    for window in tokens.windows(2) {
        let candidate = format!("{} {}", window[0], window[1]);
        if let Some(ts) = parse_listing_timestamp(&candidate) {
            return Some(ts);
        }
    }
    None
}

/// Heuristic for one-page tree dumps: several files resolve to paths
/// nested more than one level below the listing.
fn is_flat_tree_dump(base: &Url, files: &[FileEntry]) -> bool {
    let deep = files
        .iter()
        .filter(|file| {
            file.url
                .path()
                .strip_prefix(base.path())
                .map(|rest| rest.contains('/'))
                .unwrap_or(false)
        })
        .count();
    deep >= 3 && deep * 2 > files.len()
}
