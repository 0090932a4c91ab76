//! Directory worker pool and crawl orchestration.
//!
//! N workers share one FIFO queue of directories. Each worker claims a
//! URL (dedup happens at dequeue time), fetches it under the retry
//! policy, hands the payload to the parser registry, and feeds accepted
//! subdirectories back into the queue and size-less files into the
//! size-resolution queue. The engine is quiescent when both queues are
//! empty and no worker is mid-iteration; the size pool deliberately
//! outlives the directory pool because files keep arriving until the last
//! directory worker exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::{self, CrawlError, RetryDecision};
use crate::crawl::scope;
use crate::crawl::sizer;
use crate::crawl::stats;
use crate::crawl::{canonical_key, QueuedDir, QueuedFile, WorkQueue};
use crate::parsers::{ftp, ParsedListing, ParserRegistry, ResponseContext};
use crate::session::Session;
use crate::types::{CancellationReason, DirEntry, Gauge};

/// Live worker counts plus the directory-pool drain flag the size pool's
/// termination predicate hangs off.
#[derive(Default)]
pub struct EngineGauges {
    pub running_dir_workers: Gauge,
    pub running_size_workers: Gauge,
    pub dir_workers_done: AtomicBool,
}

#[derive(Clone)]
pub struct IndexEngine {
    pub session: Arc<Session>,
    pub fetcher: Arc<Fetcher>,
    parsers: Arc<ParserRegistry>,
    pub dir_queue: Arc<WorkQueue<QueuedDir>>,
    pub file_queue: Arc<WorkQueue<QueuedFile>>,
    pub gauges: Arc<EngineGauges>,
    /// Process-wide indexing cancellation; honored at every suspension point
    pub cancel: CancellationToken,
}

impl IndexEngine {
    pub fn new(session: Arc<Session>) -> Result<Self, CrawlError> {
        let fetcher = Arc::new(Fetcher::new(&session.config, Arc::clone(&session))?);
        Ok(Self {
            session,
            fetcher,
            parsers: Arc::new(ParserRegistry::standard()),
            dir_queue: Arc::new(WorkQueue::new()),
            file_queue: Arc::new(WorkQueue::new()),
            gauges: Arc::new(EngineGauges::default()),
            cancel: CancellationToken::new(),
        })
    }

    /// Run the crawl to quiescence: seed the root, run both pools, await
    /// the directory pool, then await the trailing size pool.
    pub async fn run(&self) -> Result<(), CrawlError> {
        *self.session.started_at.lock() = Some(Utc::now());
        self.dir_queue.push(QueuedDir {
            url: self.session.root_url.clone(),
            parent: None,
        });

        let observer = stats::spawn_observer(self.clone());

        let mut dir_tasks = JoinSet::new();
        let mut size_tasks = JoinSet::new();
        for i in 0..self.session.config.threads {
            let engine = self.clone();
            dir_tasks.spawn(async move { engine.dir_worker(format!("dir-worker-{}", i)).await });

            let engine = self.clone();
            size_tasks.spawn(async move { sizer::size_worker(engine, i).await });
        }

        while let Some(result) = dir_tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "directory worker panicked");
            }
        }
        self.gauges.dir_workers_done.store(true, Ordering::SeqCst);
        tracing::debug!("directory pool drained, awaiting size resolution");

        while let Some(result) = size_tasks.join_next().await {
            if let Err(error) = result {
                tracing::error!(%error, "size worker panicked");
            }
        }

        *self.session.finished_at.lock() = Some(Utc::now());
        observer.abort();

        let in_tree = self.session.files_in_tree();
        let recorded = self.session.total_files();
        if in_tree != recorded {
            tracing::warn!(
                in_tree,
                recorded,
                "file accounting mismatch between tree and URL list"
            );
        }
        Ok(())
    }

    /// Request a graceful shutdown; both pools notice at their next
    /// suspension point.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    async fn dir_worker(&self, name: String) {
        let mut max_connections = false;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.gauges.running_dir_workers.inc();

            if let Some(item) = self.dir_queue.try_pop() {
                let key = canonical_key(&item.url);
                self.session
                    .active_workers
                    .insert(name.clone(), item.url.to_string());

                if self.session.mark_processed(&key) {
                    if let Some(mut entry) = self.session.tree.get_mut(&key) {
                        entry.started = true;
                        entry.started_at = Some(Utc::now());
                    }

                    match self.process_directory(&name, &item, &key).await {
                        Ok(()) => {
                            if let Some(mut entry) = self.session.tree.get_mut(&key) {
                                if entry.cancellation_reason.is_none() {
                                    entry.finished = true;
                                }
                                entry.finished_at = Some(Utc::now());
                            }
                        }
                        Err(CrawlError::FtpConnectionLimit) => {
                            // Not an error: release the claim, requeue the
                            // directory, retire this worker's connection and
                            // let the worker exit after this iteration.
                            self.session.unmark_processed(&key);
                            if let Some(mut entry) = self.session.tree.get_mut(&key) {
                                entry.started = false;
                                entry.started_at = None;
                                entry.cancellation_reason = None;
                            }
                            self.dir_queue.push(item.clone());
                            ftp::close_worker_connection(&name, &self.session).await;
                            max_connections = true;
                            tracing::info!(
                                worker = %name,
                                url = %item.url,
                                "ftp connection limit, directory requeued"
                            );
                        }
                        Err(error) => {
                            self.session.errors.inc();
                            self.session.urls_with_errors.insert(key.clone());
                            if let Some(mut entry) = self.session.tree.get_mut(&key) {
                                entry.error = true;
                                entry.finished_at = Some(Utc::now());
                                if entry.cancellation_reason.is_none() {
                                    entry.cancellation_reason = Some(
                                        CancellationReason::NotRetryable(error.to_string()),
                                    );
                                }
                            }
                            tracing::warn!(url = %item.url, %error, "directory failed");
                        }
                    }
                } else {
                    tracing::debug!(url = %item.url, "already processed, skipping");
                }

                self.session.active_workers.remove(&name);
            }

            self.gauges.running_dir_workers.dec();

            if max_connections {
                break;
            }

            let poll = if self.dir_queue.is_empty() {
                Duration::from_millis(self.session.config.idle_poll_ms)
            } else {
                Duration::from_millis(self.session.config.busy_poll_ms)
            };
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(poll) => {}
            }

            let keep_going = !self.cancel.is_cancelled()
                && (!self.dir_queue.is_empty() || self.gauges.running_dir_workers.get() > 0);
            if !keep_going {
                break;
            }
        }
    }

    /// Dispatch one directory by scheme. The retry policy wraps HTTP
    /// fetches only; FTP failures surface directly.
    async fn process_directory(
        &self,
        worker: &str,
        item: &QueuedDir,
        key: &str,
    ) -> Result<(), CrawlError> {
        match item.url.scheme() {
            "ftp" | "ftps" => {
                let listing = ftp::fetch_ftp_listing(worker, &item.url, &self.session).await?;
                self.add_processed(key, listing);
                Ok(())
            }
            _ => self.process_http_directory(key, item).await,
        }
    }

    async fn process_http_directory(&self, key: &str, item: &QueuedDir) -> Result<(), CrawlError> {
        if retry::is_cgi_bin(&item.url) {
            return Err(self.cancel_directory(
                key,
                CancellationReason::NotRetryable("cgi-bin".to_string()),
            ));
        }

        let token = self.cancel.child_token();
        let work = async {
            let mut attempt: u32 = 1;
            loop {
                match self.attempt_directory(key, item).await {
                    Ok(()) => return Ok(()),
                    Err(error) => match retry::classify(&error, attempt) {
                        RetryDecision::Retry { rate_limited } => {
                            if rate_limited {
                                tracing::warn!(url = %item.url, attempt, "rate limited, backing off");
                            } else {
                                tracing::debug!(url = %item.url, attempt, %error, "retrying");
                            }
                            if attempt >= retry::MAX_ATTEMPTS {
                                return Err(self
                                    .cancel_directory(key, CancellationReason::AttemptsExhausted));
                            }
                            tokio::select! {
                                _ = token.cancelled() => {
                                    return Err(self.cancel_directory(key, CancellationReason::Shutdown));
                                }
                                _ = tokio::time::sleep(retry::backoff_delay(attempt)) => {}
                            }
                            attempt += 1;
                        }
                        RetryDecision::Cancel(reason) => {
                            token.cancel();
                            return Err(self.cancel_directory(key, reason));
                        }
                    },
                }
            }
        };

        match tokio::time::timeout(self.session.config.directory_timeout(), work).await {
            Ok(result) => result,
            Err(_) => Err(self.cancel_directory(key, CancellationReason::Timeout)),
        }
    }

    async fn attempt_directory(&self, key: &str, item: &QueuedDir) -> Result<(), CrawlError> {
        let response = self.fetcher.fetch_directory(&item.url).await?;

        // Redirect rewrite: the tree key stays stable, the URL follows
        if response.final_url != item.url {
            tracing::debug!(from = %item.url, to = %response.final_url, "redirect rewrote directory URL");
            if let Some(mut entry) = self.session.tree.get_mut(key) {
                entry.url = response.final_url.clone();
            }
        }

        let ctx = ResponseContext {
            url: &response.final_url,
            server: response.server.as_deref(),
            body: &response.body,
        };
        let parser = self.parsers.dispatch(&self.session, &ctx);
        let listing = parser.parse(&self.session, &self.fetcher, &ctx).await?;
        self.add_processed(key, listing);
        Ok(())
    }

    /// Record a cancellation reason on the directory and return the error
    /// the worker loop maps to the errored state.
    fn cancel_directory(&self, key: &str, reason: CancellationReason) -> CrawlError {
        if let Some(mut entry) = self.session.tree.get_mut(key) {
            entry.cancellation_reason = Some(reason.clone());
        }
        match reason {
            CancellationReason::Shutdown => CrawlError::Cancelled,
            other => CrawlError::Parse(other.to_string()),
        }
    }

    /// Fold a parsed listing into the owning directory: attach in-scope
    /// subdirectories as stub children and enqueue them, keep accepted
    /// files, and fan size-less files out to the size queue.
    fn add_processed(&self, key: &str, listing: ParsedListing) {
        // Scope follows the root entry's current URL, which a redirect may
        // have rewritten away from the seed
        let root = self
            .session
            .tree
            .get(&self.session.root_key)
            .map(|entry| entry.url.clone())
            .unwrap_or_else(|| self.session.root_url.clone());
        let root = &root;
        let mut accepted_subdirs: Vec<(String, Url)> = Vec::new();

        if !listing.flat {
            for sub in &listing.subdirectories {
                let sub_key = canonical_key(sub);
                if self.session.is_processed(&sub_key) {
                    continue;
                }
                if !scope::in_scope(root, sub) && !scope::is_exempt_host(sub) {
                    tracing::debug!(url = %sub, "outside crawl scope, dropped");
                    self.session.skipped.inc();
                    continue;
                }
                // Atomic contains-then-insert: the child attaches under
                // exactly one parent even when two workers discover it at
                // the same time
                match self.session.tree.entry(sub_key.clone()) {
                    dashmap::mapref::entry::Entry::Occupied(_) => continue,
                    dashmap::mapref::entry::Entry::Vacant(slot) => {
                        slot.insert(DirEntry::new(sub.clone(), Some(key.to_string())));
                    }
                }
                accepted_subdirs.push((sub_key, sub.clone()));
            }
        }

        let mut accepted_files = Vec::new();
        for file in listing.files {
            if !matches!(file.url.scheme(), "http" | "https" | "ftp" | "ftps") {
                continue;
            }
            if !scope::is_exempt_host(&file.url) {
                if file.url.host_str() != root.host_str() {
                    self.session.skipped.inc();
                    continue;
                }
                if !scope::in_scope(root, &file.url) {
                    self.session.skipped.inc();
                    continue;
                }
            }
            if !self.session.record_file(&file.url) {
                continue;
            }
            accepted_files.push(file);
        }

        let listing_errored = listing.error;
        if let Some(mut entry) = self.session.tree.get_mut(key) {
            entry.parser = Some(listing.parser);
            entry
                .subdirectories
                .extend(accepted_subdirs.iter().map(|(sub_key, _)| sub_key.clone()));
            entry.files = accepted_files.clone();
        }

        for (_, sub_url) in accepted_subdirs {
            self.dir_queue.push(QueuedDir {
                url: sub_url,
                parent: Some(key.to_string()),
            });
        }

        for (index, file) in accepted_files.iter().enumerate() {
            let needs_size = file.size.is_none() || self.session.config.exact_file_sizes;
            let sizeable = matches!(file.url.scheme(), "http" | "https");
            if needs_size && sizeable {
                self.file_queue.push(QueuedFile {
                    url: file.url.clone(),
                    dir_key: key.to_string(),
                    file_index: index,
                });
            }
        }

        if listing_errored {
            self.session.urls_with_errors.insert(key.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::types::FileEntry;

    fn test_engine(root: &str) -> IndexEngine {
        let root = Url::parse(root).unwrap();
        let session = Arc::new(Session::new(root, CrawlConfig::default()));
        IndexEngine::new(session).unwrap()
    }

    fn listing_with(subdirs: &[&str], files: &[&str]) -> ParsedListing {
        ParsedListing {
            parser: "html_listing".to_string(),
            subdirectories: subdirs.iter().map(|s| Url::parse(s).unwrap()).collect(),
            files: files
                .iter()
                .map(|f| {
                    let url = Url::parse(f).unwrap();
                    let name = url.path_segments().unwrap().last().unwrap().to_string();
                    FileEntry::new(url, name)
                })
                .collect(),
            flat: false,
            error: false,
        }
    }

    #[tokio::test]
    async fn test_add_processed_enqueues_in_scope_subdirs() {
        let engine = test_engine("https://host/a/");
        let listing = listing_with(
            &["https://host/a/b/", "https://other/x/"],
            &["https://host/a/f.txt"],
        );
        engine.add_processed(&engine.session.root_key, listing);

        assert_eq!(engine.dir_queue.len(), 1, "off-host subdir dropped");
        assert_eq!(engine.session.skipped.get(), 1);
        let root = engine.session.tree.get(&engine.session.root_key).unwrap();
        assert_eq!(root.subdirectories.len(), 1);
        assert_eq!(root.files.len(), 1);
    }

    #[tokio::test]
    async fn test_add_processed_drops_already_processed_subdirs() {
        let engine = test_engine("https://host/a/");
        engine.session.mark_processed("https://host/a/b/");
        let listing = listing_with(&["https://host/a/b/"], &[]);
        engine.add_processed(&engine.session.root_key, listing);
        assert_eq!(engine.dir_queue.len(), 0);
    }

    #[tokio::test]
    async fn test_add_processed_flat_listing_does_not_recurse() {
        let engine = test_engine("https://host/a/");
        let mut listing = listing_with(&["https://host/a/b/"], &["https://host/a/b/f.txt"]);
        listing.flat = true;
        engine.add_processed(&engine.session.root_key, listing);
        assert_eq!(engine.dir_queue.len(), 0);
        assert_eq!(engine.session.total_files(), 1);
    }

    #[tokio::test]
    async fn test_add_processed_queues_unknown_sizes() {
        let engine = test_engine("https://host/a/");
        let mut listing = listing_with(&[], &["https://host/a/known.txt", "https://host/a/unknown.txt"]);
        listing.files[0].size = Some(10);
        engine.add_processed(&engine.session.root_key, listing);
        assert_eq!(engine.file_queue.len(), 1);
        let queued = engine.file_queue.try_pop().unwrap();
        assert!(queued.url.as_str().ends_with("unknown.txt"));
        assert_eq!(queued.file_index, 1);
    }

    #[tokio::test]
    async fn test_add_processed_dedups_files_across_directories() {
        let engine = test_engine("https://host/a/");
        let listing = listing_with(&[], &["https://host/a/f.txt"]);
        engine.add_processed(&engine.session.root_key, listing);
        let listing = listing_with(&[], &["https://host/a/f.txt"]);
        engine.add_processed(&engine.session.root_key, listing);
        assert_eq!(engine.session.total_files(), 1);
    }

    #[tokio::test]
    async fn test_cancel_directory_records_reason() {
        let engine = test_engine("https://host/a/");
        let error = engine.cancel_directory(
            &engine.session.root_key,
            CancellationReason::NotRetryable("404 not found".to_string()),
        );
        assert!(!matches!(error, CrawlError::Cancelled));
        let entry = engine.session.tree.get(&engine.session.root_key).unwrap();
        assert!(matches!(
            entry.cancellation_reason,
            Some(CancellationReason::NotRetryable(_))
        ));
    }
}
