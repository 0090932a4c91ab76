//! File-size resolution pool.
//!
//! Files whose listing did not carry a size (or all files, when exact
//! sizes are requested) are resolved here: a HEAD request reading
//! `Content-Length`, or a counted GET stream when the server lies to HEAD.
//! The pool trails the directory pool — new files can arrive until the
//! last directory worker exits, so the termination predicate references
//! the directory pool's state as well as its own.

use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use url::Url;

use crate::crawl::engine::IndexEngine;
use crate::crawl::fetcher::Fetcher;
use crate::crawl::retry::CrawlError;

pub async fn size_worker(engine: IndexEngine, index: usize) {
    let name = format!("size-worker-{}", index);
    loop {
        if engine.cancel.is_cancelled() {
            break;
        }
        engine.gauges.running_size_workers.inc();

        if let Some(item) = engine.file_queue.try_pop() {
            let by_download = engine.session.config.determine_size_by_download;
            match resolve_size(&engine.fetcher, &item.url, by_download).await {
                Ok(Some(size)) => {
                    if let Some(mut entry) = engine.session.tree.get_mut(&item.dir_key) {
                        if let Some(file) = entry.files.get_mut(item.file_index) {
                            file.size = Some(size);
                        }
                    }
                    tracing::trace!(worker = %name, url = %item.url, size, "file size resolved");
                }
                Ok(None) => {
                    tracing::debug!(url = %item.url, "no content length reported");
                }
                Err(error) => {
                    // Leave the size at its unknown sentinel
                    tracing::error!(url = %item.url, %error, "failed to resolve file size");
                }
            }
        }

        engine.gauges.running_size_workers.dec();

        let poll = if engine.file_queue.is_empty() {
            Duration::from_millis(engine.session.config.idle_poll_ms)
        } else {
            Duration::from_millis(engine.session.config.busy_poll_ms)
        };
        tokio::select! {
            _ = engine.cancel.cancelled() => break,
            _ = tokio::time::sleep(poll) => {}
        }

        let keep_going = !engine.cancel.is_cancelled()
            && (!engine.file_queue.is_empty()
                || engine.gauges.running_size_workers.get() > 0
                || engine.gauges.running_dir_workers.get() > 0
                || !engine.gauges.dir_workers_done.load(Ordering::SeqCst));
        if !keep_going {
            break;
        }
    }
}

/// HEAD for `Content-Length`, or stream a GET and count bytes. The
/// streamed variant stops early when the response itself reports a length.
async fn resolve_size(
    fetcher: &Fetcher,
    url: &Url,
    by_download: bool,
) -> Result<Option<u64>, CrawlError> {
    if !by_download {
        return fetcher.head_content_length(url).await;
    }

    let response = fetcher.get_streaming(url).await?;
    if let Some(length) = response.content_length() {
        return Ok(Some(length));
    }

    let mut stream = response.bytes_stream();
    let mut total = 0u64;
    while let Some(chunk) = stream.next().await {
        total += chunk.map_err(CrawlError::from_reqwest)?.len() as u64;
    }
    Ok(Some(total))
}
