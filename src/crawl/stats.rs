//! Periodic crawl progress observer.
//!
//! Purely observational: reads queue depths, worker gauges, and session
//! counters on a timer and logs them. Reports every 30 seconds while
//! directories are still being processed, then every 5 seconds while the
//! size-resolution backlog drains.

use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::crawl::engine::IndexEngine;

pub fn spawn_observer(engine: IndexEngine) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let drained = engine.gauges.dir_workers_done.load(Ordering::SeqCst);
            let interval = if drained {
                Duration::from_secs(engine.session.config.stats_drain_interval_secs)
            } else {
                Duration::from_secs(engine.session.config.stats_interval_secs)
            };

            tokio::select! {
                _ = engine.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            tracing::info!(
                directories = engine.session.directory_count(),
                files = engine.session.total_files(),
                http_requests = engine.session.total_http_requests.get(),
                errors = engine.session.errors.get(),
                directory_queue = engine.dir_queue.len(),
                size_queue = engine.file_queue.len(),
                directory_workers = engine.gauges.running_dir_workers.get(),
                size_workers = engine.gauges.running_size_workers.get(),
                "indexing progress"
            );

            for worker in engine.session.active_workers.iter() {
                tracing::debug!(worker = %worker.key(), url = %worker.value(), "active");
            }
        }
    })
}
