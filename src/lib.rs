//! odindex: recursive indexer for open directory listings
//!
//! Given a single seed URL, odindex enumerates the transitive set of
//! subdirectories and files reachable under that prefix across HTTP(S)
//! directory indexes, FTP(S) listings, and a few service-specific
//! endpoints (Calibre content servers, Google Drive folders, GoIndex
//! workers), collecting per-file metadata and emitting a session summary.
//!
//! The core is the concurrent indexing engine in [`crawl`]: a directory
//! worker pool with classified retries and scope enforcement, a trailing
//! file-size resolution pool, and shared session state safe across
//! workers.

pub mod config;
pub mod crawl;
pub mod parsers;
pub mod report;
pub mod session;
pub mod speedtest;
pub mod types;
pub mod upload;

pub use config::CrawlConfig;
pub use crawl::engine::IndexEngine;
pub use session::{Session, SessionSnapshot};
pub use types::{DirEntry, FileEntry};
