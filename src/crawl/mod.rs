//! Indexing engine for open directory listings.
//!
//! The pipeline: the directory worker pool (`engine`) dequeues directories,
//! fetches them through the retry policy (`retry`) and the shared fetch
//! engine (`fetcher`), dispatches the payload to a listing parser
//! (`crate::parsers`), enforces the crawl boundary (`scope`), and fans
//! discovered files out to the size-resolution pool (`sizer`). Both pools
//! share the session state; a periodic observer (`stats`) reports progress.

pub mod engine;
pub mod fetcher;
pub mod retry;
pub mod scope;
pub mod sizer;
pub mod stats;

use std::collections::VecDeque;

use parking_lot::Mutex;
use url::Url;

pub use engine::IndexEngine;
pub use fetcher::{FetchResponse, Fetcher};
pub use retry::{CrawlError, TransportKind};

/// Canonical form of a URL used for dedup and as the tree key.
///
/// The `url` crate already resolves `.`/`..` path segments at parse time,
/// so `/x/sub/../sub/` and `/x/sub/` collapse to the same key. Fragments
/// never reach the server and are stripped.
pub fn canonical_key(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    canonical.to_string()
}

/// Plain FIFO work queue. There is deliberately no blocking wait: workers
/// poll with `try_pop` and sleep between attempts, which keeps the
/// quiescence check (empty queue + zero running workers) race-free.
pub struct WorkQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A directory waiting to be crawled.
#[derive(Debug, Clone)]
pub struct QueuedDir {
    pub url: Url,
    /// Canonical key of the parent directory, `None` for the root
    pub parent: Option<String>,
}

/// A file waiting for size resolution.
#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub url: Url,
    /// Tree key of the directory owning the file
    pub dir_key: String,
    /// Index into that directory's file list
    pub file_index: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let queue = WorkQueue::new();
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.try_pop(), Some(1));
        assert_eq!(queue.try_pop(), Some(2));
        assert_eq!(queue.try_pop(), Some(3));
        assert_eq!(queue.try_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_canonical_key_resolves_dot_segments() {
        let a = Url::parse("https://example.com/x/sub/../sub/").unwrap();
        let b = Url::parse("https://example.com/x/sub/").unwrap();
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }

    #[test]
    fn test_canonical_key_strips_fragment() {
        let a = Url::parse("https://example.com/x/#top").unwrap();
        let b = Url::parse("https://example.com/x/").unwrap();
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }
}
