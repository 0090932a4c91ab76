//! Core data model: directory tree entries, files, lifecycle state,
//! and the atomic counters shared across workers.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Why a directory stopped being crawled before it finished normally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancellationReason {
    /// Classified as not worth retrying (404, DNS failure, cgi-bin, ...)
    NotRetryable(String),
    /// Retry attempts exhausted
    AttemptsExhausted,
    /// The 5-minute per-directory ceiling fired
    Timeout,
    /// FTP server reported its connection limit; the directory was requeued
    FtpConnectionLimit,
    /// Process-wide shutdown
    Shutdown,
}

impl std::fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancellationReason::NotRetryable(why) => write!(f, "not retryable: {}", why),
            CancellationReason::AttemptsExhausted => write!(f, "retry attempts exhausted"),
            CancellationReason::Timeout => write!(f, "directory timeout"),
            CancellationReason::FtpConnectionLimit => write!(f, "ftp connection limit"),
            CancellationReason::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// A file discovered in a listing. Identity is the URL; the size stays
/// `None` until a listing or the size-resolution pool fills it in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub url: Url,
    pub name: String,
    /// `None` means "size not yet determined"
    pub size: Option<u64>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl FileEntry {
    pub fn new(url: Url, name: impl Into<String>) -> Self {
        Self {
            url,
            name: name.into(),
            size: None,
            timestamp: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}

/// A directory in the crawl tree. Created once per unique canonical URL,
/// filled in exactly once by the worker that parsed it, and treated as
/// read-only afterwards. Parent/child links are canonical-URL keys into
/// the session tree rather than owned references, so the tree can live in
/// a concurrent map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    /// Current URL; rewritten if the server redirected the fetch
    pub url: Url,
    pub name: String,
    /// Canonical URL of the parent, `None` for the root
    pub parent: Option<String>,
    /// Canonical URLs of child directories, in parse order
    pub subdirectories: Vec<String>,
    /// Files directly under this directory, in parse order
    pub files: Vec<FileEntry>,
    pub started: bool,
    pub finished: bool,
    pub error: bool,
    pub cancellation_reason: Option<CancellationReason>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Label of the parser that produced this listing
    pub parser: Option<String>,
}

impl DirEntry {
    pub fn new(url: Url, parent: Option<String>) -> Self {
        let name = dir_display_name(&url);
        Self {
            url,
            name,
            parent,
            subdirectories: Vec::new(),
            files: Vec::new(),
            started: false,
            finished: false,
            error: false,
            cancellation_reason: None,
            started_at: None,
            finished_at: None,
            parser: None,
        }
    }
}

/// Display name for a directory URL: the last non-empty path segment,
/// or the host for the root of a site.
pub fn dir_display_name(url: &Url) -> String {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(str::to_string)
        .unwrap_or_else(|| url.host_str().unwrap_or("/").to_string())
}

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}
