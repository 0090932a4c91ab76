//! Listing parsers and their dispatch registry.
//!
//! Parsers are `(detector, parser)` pairs consulted in declared order; the
//! first detector that matches wins. Adding a new server flavor means
//! appending to the registry, not editing the worker. FTP never reaches
//! the registry: the scheme is dispatched before any HTTP fetch happens.
//!
//! Declared order (first match wins):
//! 1. GdIndex, once the session knows the root id (or spots the marker)
//! 2. Google Drive, by host
//! 3. Calibre, by `Server` header or the version marker in the body
//! 4. Generic HTML listings (always matches)

pub mod calibre;
pub mod ftp;
pub mod gdindex;
pub mod gdrive;
pub mod html;

use async_trait::async_trait;
use url::Url;

use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;
use crate::session::Session;
use crate::types::FileEntry;

/// What a parser extracted from one listing.
#[derive(Debug, Default)]
pub struct ParsedListing {
    /// Label of the parser that produced this listing
    pub parser: String,
    pub subdirectories: Vec<Url>,
    pub files: Vec<FileEntry>,
    /// The parser enumerated the full tree in one response; subdirectory
    /// enqueueing is disabled for flat listings.
    pub flat: bool,
    /// The listing was produced despite a partial failure
    pub error: bool,
}

/// The already-fetched response a parser works from.
pub struct ResponseContext<'a> {
    pub url: &'a Url,
    /// `Server` response header, when present
    pub server: Option<&'a str>,
    pub body: &'a str,
}

#[async_trait]
pub trait ListingParser: Send + Sync {
    fn label(&self) -> &'static str;

    /// Cheap check against the response; must not perform I/O.
    fn detect(&self, session: &Session, ctx: &ResponseContext<'_>) -> bool;

    /// Extract subdirectories and files. Parsers may issue follow-up
    /// requests through the fetcher (Calibre pages its catalog, Google
    /// Drive loads the folder view).
    async fn parse(
        &self,
        session: &Session,
        fetcher: &Fetcher,
        ctx: &ResponseContext<'_>,
    ) -> Result<ParsedListing, CrawlError>;
}

pub struct ParserRegistry {
    parsers: Vec<Box<dyn ListingParser>>,
}

impl ParserRegistry {
    /// The standard registry in spec order. The generic HTML parser is the
    /// always-matching tail.
    pub fn standard() -> Self {
        Self {
            parsers: vec![
                Box::new(gdindex::GdIndexParser),
                Box::new(gdrive::GoogleDriveParser),
                Box::new(calibre::CalibreParser),
                Box::new(html::HtmlListingParser),
            ],
        }
    }

    /// First parser whose detector matches. The registry always ends with
    /// the generic HTML parser, so this cannot fail to find one.
    pub fn dispatch(&self, session: &Session, ctx: &ResponseContext<'_>) -> &dyn ListingParser {
        self.parsers
            .iter()
            .find(|parser| parser.detect(session, ctx))
            .map(|parser| parser.as_ref())
            .expect("registry ends with an always-matching parser")
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::session::PARAM_GDINDEX_ROOT_ID;

    fn test_session() -> Session {
        let root = Url::parse("https://example.com/books/").unwrap();
        Session::new(root, CrawlConfig::default())
    }

    #[test]
    fn test_generic_html_is_the_fallback() {
        let registry = ParserRegistry::standard();
        let session = test_session();
        let url = Url::parse("https://example.com/books/").unwrap();
        let ctx = ResponseContext {
            url: &url,
            server: Some("nginx/1.24"),
            body: "<html><a href=\"a.txt\">a.txt</a></html>",
        };
        assert_eq!(registry.dispatch(&session, &ctx).label(), "html_listing");
    }

    #[test]
    fn test_calibre_detected_by_server_header() {
        let registry = ParserRegistry::standard();
        let session = test_session();
        let url = Url::parse("https://example.com/books/").unwrap();
        let ctx = ResponseContext {
            url: &url,
            server: Some("calibre/5.0"),
            body: "<html></html>",
        };
        // Exactly the Calibre parser is selected; the generic parser never
        // sees this response.
        assert_eq!(registry.dispatch(&session, &ctx).label(), "calibre");
    }

    #[test]
    fn test_calibre_detected_by_body_marker() {
        let registry = ParserRegistry::standard();
        let session = test_session();
        let url = Url::parse("https://example.com/books/").unwrap();
        let ctx = ResponseContext {
            url: &url,
            server: None,
            body: "var CALIBRE_VERSION = \"6.11.0\";",
        };
        assert_eq!(registry.dispatch(&session, &ctx).label(), "calibre");
    }

    #[test]
    fn test_google_drive_detected_by_host() {
        let registry = ParserRegistry::standard();
        let session = test_session();
        let url = Url::parse("https://drive.google.com/drive/folders/abc123").unwrap();
        let ctx = ResponseContext {
            url: &url,
            server: None,
            body: "",
        };
        assert_eq!(registry.dispatch(&session, &ctx).label(), "google_drive");
    }

    #[test]
    fn test_gdindex_takes_priority_once_parameter_is_set() {
        let registry = ParserRegistry::standard();
        let session = test_session();
        session
            .parameters
            .insert(PARAM_GDINDEX_ROOT_ID.to_string(), "root".to_string());
        let url = Url::parse("https://example.com/books/").unwrap();
        // Even a Calibre-looking response goes to GdIndex once the root id
        // parameter is present: detection order is declared, not scored.
        let ctx = ResponseContext {
            url: &url,
            server: Some("calibre/5.0"),
            body: "",
        };
        assert_eq!(registry.dispatch(&session, &ctx).label(), "gdindex");
    }
}
