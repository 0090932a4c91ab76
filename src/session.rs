//! Process-wide session state shared by both worker pools.
//!
//! The session owns the directory tree and the bookkeeping that must
//! survive across workers: the processed-URL set used for dedup, the
//! error set, the HTTP status histogram, traffic counters, server-specific
//! parameters, and the per-worker FTP connection registry. Counters are
//! atomic; sets use contains-then-insert maps; the tree is mutated only by
//! the worker currently holding a directory.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::CrawlConfig;
use crate::crawl::canonical_key;
use crate::parsers::ftp::FtpConnection;
use crate::types::{Counter, DirEntry, FileEntry};

/// Session parameter key holding the GdIndex root folder id once a GoIndex
/// site has been recognized.
pub const PARAM_GDINDEX_ROOT_ID: &str = "gdindex_root_id";

/// Session parameter key holding the scrubbed FTP server banner.
pub const PARAM_FTP_SERVER_INFO: &str = "ftp_server_info";

pub struct Session {
    pub config: CrawlConfig,
    /// Canonical URL of the root directory
    pub root_key: String,
    pub root_url: Url,
    /// Directory tree keyed by canonical URL
    pub tree: DashMap<String, DirEntry>,
    /// URLs that have been dequeued for crawling (dedup membership)
    processed_urls: DashSet<String>,
    /// URLs whose directory ended in an error
    pub urls_with_errors: DashSet<String>,
    /// Distinct file URLs in encounter order
    file_order: Mutex<Vec<String>>,
    seen_files: DashSet<String>,
    /// HTTP status code histogram
    status_codes: Mutex<BTreeMap<u16, u64>>,
    pub total_http_requests: Counter,
    pub total_http_traffic: Counter,
    pub errors: Counter,
    pub skipped: Counter,
    pub max_threads: usize,
    pub started_at: Mutex<Option<DateTime<Utc>>>,
    pub finished_at: Mutex<Option<DateTime<Utc>>>,
    /// Server-specific state (GdIndex root id, FTP banner, ...)
    pub parameters: DashMap<String, String>,
    /// FTP connections cached per worker name
    pub ftp_clients: Mutex<HashMap<String, FtpConnection>>,
    /// Worker name -> URL of the directory it is currently processing
    pub active_workers: DashMap<String, String>,
}

impl Session {
    pub fn new(root_url: Url, config: CrawlConfig) -> Self {
        let root_key = canonical_key(&root_url);
        let tree = DashMap::new();
        tree.insert(root_key.clone(), DirEntry::new(root_url.clone(), None));

        Self {
            max_threads: config.threads,
            config,
            root_key,
            root_url,
            tree,
            processed_urls: DashSet::new(),
            urls_with_errors: DashSet::new(),
            file_order: Mutex::new(Vec::new()),
            seen_files: DashSet::new(),
            status_codes: Mutex::new(BTreeMap::new()),
            total_http_requests: Counter::default(),
            total_http_traffic: Counter::default(),
            errors: Counter::default(),
            skipped: Counter::default(),
            started_at: Mutex::new(None),
            finished_at: Mutex::new(None),
            parameters: DashMap::new(),
            ftp_clients: Mutex::new(HashMap::new()),
            active_workers: DashMap::new(),
        }
    }

    /// Atomically claim a URL for crawling. Returns false when some worker
    /// already claimed it.
    pub fn mark_processed(&self, key: &str) -> bool {
        self.processed_urls.insert(key.to_string())
    }

    pub fn is_processed(&self, key: &str) -> bool {
        self.processed_urls.contains(key)
    }

    /// Release a claim so the URL can be requeued (FTP connection-limit path).
    pub fn unmark_processed(&self, key: &str) {
        self.processed_urls.remove(key);
    }

    pub fn processed_count(&self) -> usize {
        self.processed_urls.len()
    }

    /// Record one HTTP request and its response for the histogram/traffic totals.
    pub fn record_response(&self, status: u16, body_bytes: u64) {
        self.total_http_requests.inc();
        self.total_http_traffic.add(body_bytes);
        *self.status_codes.lock().entry(status).or_insert(0) += 1;
    }

    /// Record a request that never produced a status (transport failure).
    pub fn record_request(&self) {
        self.total_http_requests.inc();
    }

    pub fn status_histogram(&self) -> BTreeMap<u16, u64> {
        self.status_codes.lock().clone()
    }

    /// Register a file URL, preserving encounter order. Returns false for
    /// a duplicate.
    pub fn record_file(&self, url: &Url) -> bool {
        let key = url.to_string();
        if self.seen_files.insert(key.clone()) {
            self.file_order.lock().push(key);
            true
        } else {
            false
        }
    }

    /// Distinct file URLs in the order they were first encountered.
    pub fn file_urls(&self) -> Vec<String> {
        self.file_order.lock().clone()
    }

    pub fn total_files(&self) -> usize {
        self.seen_files.len()
    }

    /// Count of distinct file URLs actually present in the tree. Compared
    /// against `total_files` at the end of the crawl; a mismatch is logged
    /// as a warning, never an abort.
    pub fn files_in_tree(&self) -> usize {
        let distinct: DashSet<String> = DashSet::new();
        for entry in self.tree.iter() {
            for file in &entry.files {
                distinct.insert(file.url.to_string());
            }
        }
        distinct.len()
    }

    /// Sum of all known file sizes in the tree.
    pub fn total_size(&self) -> u64 {
        self.tree
            .iter()
            .map(|e| e.files.iter().filter_map(|f| f.size).sum::<u64>())
            .sum()
    }

    pub fn directory_count(&self) -> usize {
        self.tree.len()
    }

    /// Build a serializable snapshot of the whole session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            root_url: self.root_url.to_string(),
            started_at: *self.started_at.lock(),
            finished_at: *self.finished_at.lock(),
            total_http_requests: self.total_http_requests.get(),
            total_http_traffic: self.total_http_traffic.get(),
            errors: self.errors.get(),
            skipped: self.skipped.get(),
            max_threads: self.max_threads,
            status_codes: self.status_histogram(),
            urls_with_errors: {
                let mut urls: Vec<String> = self
                    .urls_with_errors
                    .iter()
                    .map(|u| u.key().clone())
                    .collect();
                urls.sort();
                urls
            },
            parameters: self
                .parameters
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            root: self.snapshot_dir(&self.root_key),
        }
    }

    fn snapshot_dir(&self, key: &str) -> DirSnapshot {
        let Some(entry) = self.tree.get(key).map(|e| e.value().clone()) else {
            return DirSnapshot::default();
        };
        DirSnapshot {
            url: entry.url.to_string(),
            name: entry.name,
            parser: entry.parser,
            started: entry.started,
            finished: entry.finished,
            error: entry.error,
            cancellation_reason: entry.cancellation_reason.map(|r| r.to_string()),
            started_at: entry.started_at,
            finished_at: entry.finished_at,
            files: entry.files,
            subdirectories: entry
                .subdirectories
                .iter()
                .map(|child| self.snapshot_dir(child))
                .collect(),
        }
    }
}

/// Serializable view of one directory and its subtree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirSnapshot {
    pub url: String,
    pub name: String,
    pub parser: Option<String>,
    pub started: bool,
    pub finished: bool,
    pub error: bool,
    pub cancellation_reason: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub subdirectories: Vec<DirSnapshot>,
}

impl DirSnapshot {
    /// Count of distinct file URLs in this subtree.
    pub fn file_count(&self) -> usize {
        let mut seen = std::collections::HashSet::new();
        self.collect_files(&mut seen);
        seen.len()
    }

    fn collect_files(&self, seen: &mut std::collections::HashSet<String>) {
        for file in &self.files {
            seen.insert(file.url.to_string());
        }
        for sub in &self.subdirectories {
            sub.collect_files(seen);
        }
    }
}

/// Serializable view of a full session, round-trippable through the loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub root_url: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_http_requests: u64,
    pub total_http_traffic: u64,
    pub errors: u64,
    pub skipped: u64,
    pub max_threads: usize,
    pub status_codes: BTreeMap<u16, u64>,
    pub urls_with_errors: Vec<String>,
    pub parameters: BTreeMap<String, String>,
    pub root: DirSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Session {
        let root = Url::parse("https://example.com/pub/").unwrap();
        Session::new(root, CrawlConfig::default())
    }

    #[test]
    fn test_mark_processed_is_once_only() {
        let session = test_session();
        assert!(session.mark_processed("https://example.com/pub/"));
        assert!(!session.mark_processed("https://example.com/pub/"));
        session.unmark_processed("https://example.com/pub/");
        assert!(session.mark_processed("https://example.com/pub/"));
    }

    #[test]
    fn test_record_file_dedups_but_keeps_order() {
        let session = test_session();
        let a = Url::parse("https://example.com/pub/b.txt").unwrap();
        let b = Url::parse("https://example.com/pub/a.txt").unwrap();
        assert!(session.record_file(&a));
        assert!(session.record_file(&b));
        assert!(!session.record_file(&a));
        assert_eq!(
            session.file_urls(),
            vec![a.to_string(), b.to_string()],
            "encounter order, not sorted"
        );
    }

    #[test]
    fn test_status_histogram() {
        let session = test_session();
        session.record_response(200, 100);
        session.record_response(200, 50);
        session.record_response(503, 0);
        let histogram = session.status_histogram();
        assert_eq!(histogram.get(&200), Some(&2));
        assert_eq!(histogram.get(&503), Some(&1));
        assert_eq!(session.total_http_requests.get(), 3);
        assert_eq!(session.total_http_traffic.get(), 150);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let session = test_session();
        session.record_response(200, 10);
        let file_url = Url::parse("https://example.com/pub/a.txt").unwrap();
        session
            .tree
            .get_mut(&session.root_key)
            .unwrap()
            .files
            .push(FileEntry::new(file_url, "a.txt").with_size(10));

        let snapshot = session.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();
        let loaded: SessionSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.root_url, "https://example.com/pub/");
        assert_eq!(loaded.root.files.len(), 1);
        assert_eq!(loaded.root.file_count(), 1);
        assert_eq!(loaded.status_codes.get(&200), Some(&1));
    }
}
