//! Throughput probe: stream the largest known file for a bounded window
//! and report the observed rate.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use url::Url;

use crate::session::Session;

/// How long the probe is allowed to stream.
const PROBE_WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SpeedtestResult {
    pub url: Url,
    pub bytes: u64,
    pub elapsed: Duration,
}

impl SpeedtestResult {
    pub fn megabytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

/// Download the largest file with a known size for up to ten seconds.
/// Returns `None` when the session found no sized HTTP file to probe.
pub async fn run_speedtest(
    client: &reqwest::Client,
    session: &Session,
) -> Result<Option<SpeedtestResult>> {
    let Some(target) = largest_http_file(session) else {
        return Ok(None);
    };

    tracing::info!(url = %target, "running speed test");
    let response = client
        .get(target.as_str())
        .send()
        .await
        .context("speed test request failed")?
        .error_for_status()
        .context("speed test target rejected the request")?;

    let started = Instant::now();
    let mut stream = response.bytes_stream();
    let mut bytes = 0u64;

    while started.elapsed() < PROBE_WINDOW {
        match tokio::time::timeout(PROBE_WINDOW, stream.next()).await {
            Ok(Some(chunk)) => bytes += chunk?.len() as u64,
            Ok(None) => break,
            Err(_) => break,
        }
    }

    Ok(Some(SpeedtestResult {
        url: target,
        bytes,
        elapsed: started.elapsed(),
    }))
}

fn largest_http_file(session: &Session) -> Option<Url> {
    let mut best: Option<(u64, Url)> = None;
    for entry in session.tree.iter() {
        for file in &entry.files {
            if !matches!(file.url.scheme(), "http" | "https") {
                continue;
            }
            if let Some(size) = file.size {
                if best.as_ref().map(|(b, _)| size > *b).unwrap_or(true) {
                    best = Some((size, file.url.clone()));
                }
            }
        }
    }
    best.map(|(_, url)| url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::types::FileEntry;

    #[test]
    fn test_largest_http_file() {
        let root = Url::parse("https://example.com/pub/").unwrap();
        let session = Session::new(root, CrawlConfig::default());
        {
            let mut entry = session.tree.get_mut(&session.root_key).unwrap();
            entry.files.push(
                FileEntry::new(
                    Url::parse("https://example.com/pub/small.bin").unwrap(),
                    "small.bin",
                )
                .with_size(10),
            );
            entry.files.push(
                FileEntry::new(
                    Url::parse("https://example.com/pub/big.bin").unwrap(),
                    "big.bin",
                )
                .with_size(1000),
            );
            entry.files.push(FileEntry::new(
                Url::parse("https://example.com/pub/unsized.bin").unwrap(),
                "unsized.bin",
            ));
        }
        let target = largest_http_file(&session).unwrap();
        assert!(target.as_str().ends_with("big.bin"));
    }

    #[test]
    fn test_speedtest_rate() {
        let result = SpeedtestResult {
            url: Url::parse("https://example.com/f.bin").unwrap(),
            bytes: 10 * 1024 * 1024,
            elapsed: Duration::from_secs(2),
        };
        assert!((result.megabytes_per_second() - 5.0).abs() < 0.01);
    }
}
