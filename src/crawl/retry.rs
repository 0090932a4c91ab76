//! Classified retry policy for directory fetches.
//!
//! Failures are explicit values rather than control flow: the fetch path
//! returns a [`CrawlError`], the classifier maps it to retry-or-cancel,
//! and the worker loop sleeps the backoff schedule between attempts.

use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use url::Url;

use crate::types::CancellationReason;

/// Hard ceiling on retry attempts for one directory.
pub const MAX_ATTEMPTS: u32 = 100;

/// Attempt count after which "other" errors stop being retried.
const OTHER_ERROR_RETRY_LIMIT: u32 = 4;

/// Attempt count at which auth failures (401/403) give up.
const AUTH_RETRY_LIMIT: u32 = 3;

/// Transport-level failure flavors the classifier distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    ConnectionRefused,
    DnsFailure,
    Tls,
    Other,
}

/// Everything that can go wrong fetching or parsing one directory.
#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("transport failure: {message}")]
    Transport {
        kind: TransportKind,
        message: String,
    },
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("listing parse produced no entries")]
    EmptyListing,
    #[error("parse failure: {0}")]
    Parse(String),
    #[error("ftp connection limit reached")]
    FtpConnectionLimit,
    #[error("cancelled")]
    Cancelled,
}

impl CrawlError {
    /// Classify a reqwest error into the transport/timeout buckets. The
    /// reqwest error chain does not expose the io error kind directly, so
    /// the message text is inspected the same way its Display output is
    /// shown to users.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return CrawlError::Timeout;
        }
        let message = format!("{:?}", error);
        let lowered = message.to_lowercase();
        let kind = if lowered.contains("connection refused") {
            TransportKind::ConnectionRefused
        } else if lowered.contains("dns error")
            || lowered.contains("failed to lookup")
            || lowered.contains("no such host")
        {
            TransportKind::DnsFailure
        } else if lowered.contains("certificate") || lowered.contains("tls") {
            TransportKind::Tls
        } else {
            TransportKind::Other
        };
        CrawlError::Transport {
            kind,
            message: error.to_string(),
        }
    }
}

/// What the worker should do with a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { rate_limited: bool },
    Cancel(CancellationReason),
}

/// Map an error plus the attempt number (1-based) to a decision.
pub fn classify(error: &CrawlError, attempt: u32) -> RetryDecision {
    match error {
        CrawlError::Status(503) | CrawlError::Status(429) => {
            RetryDecision::Retry { rate_limited: true }
        }
        CrawlError::Transport {
            kind: TransportKind::ConnectionRefused,
            ..
        } => RetryDecision::Retry { rate_limited: true },
        CrawlError::Status(404) => RetryDecision::Cancel(CancellationReason::NotRetryable(
            "404 not found".to_string(),
        )),
        CrawlError::Transport {
            kind: TransportKind::DnsFailure,
            ..
        } => RetryDecision::Cancel(CancellationReason::NotRetryable(
            "host not found".to_string(),
        )),
        CrawlError::Status(code @ (401 | 403)) => {
            if attempt >= AUTH_RETRY_LIMIT {
                RetryDecision::Cancel(CancellationReason::NotRetryable(format!(
                    "auth failure ({})",
                    code
                )))
            } else {
                RetryDecision::Retry {
                    rate_limited: false,
                }
            }
        }
        CrawlError::Cancelled => RetryDecision::Cancel(CancellationReason::Shutdown),
        CrawlError::FtpConnectionLimit => {
            RetryDecision::Cancel(CancellationReason::FtpConnectionLimit)
        }
        _ => {
            if attempt <= OTHER_ERROR_RETRY_LIMIT {
                RetryDecision::Retry {
                    rate_limited: false,
                }
            } else {
                RetryDecision::Cancel(CancellationReason::AttemptsExhausted)
            }
        }
    }
}

/// Directories under a trailing `cgi-bin/` segment are never crawled.
pub fn is_cgi_bin(url: &Url) -> bool {
    url.path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(|last| last.eq_ignore_ascii_case("cgi-bin"))
        .unwrap_or(false)
}

/// Backoff before the given (1-based) retry attempt:
/// `min(16, 2^attempt)` seconds plus uniform jitter in [0, 200) ms.
pub fn backoff_delay(attempt: u32) -> Duration {
    let base_secs = 2u64.saturating_pow(attempt.min(32)).min(16);
    let jitter_ms = rand::thread_rng().gen_range(0..200);
    Duration::from_secs(base_secs) + Duration::from_millis(jitter_ms)
}
