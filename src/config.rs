//! Crawl configuration

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Default user agent for all HTTP requests
pub const DEFAULT_USER_AGENT: &str = "odindex/0.1 (+https://github.com/odindex)";

/// User agent impersonating curl, first fallback rung
pub const CURL_USER_AGENT: &str = "curl/8.5.0";

/// User agent impersonating a desktop Chrome, second fallback rung
pub const CHROME_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Configuration for one indexing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Worker count for both the directory and the file-size pool
    pub threads: usize,
    /// Per-request timeout
    pub timeout_secs: u64,
    /// Ceiling on the total time spent on a single directory (all retries)
    pub directory_timeout_secs: u64,
    /// HEAD every file even when the listing supplied a size
    pub exact_file_sizes: bool,
    /// Resolve sizes by streaming a GET and counting bytes instead of HEAD
    pub determine_size_by_download: bool,
    /// Override the default user agent
    pub user_agent: Option<String>,
    /// HTTP Basic / FTP credentials
    pub username: Option<String>,
    pub password: Option<String>,
    /// Worker idle poll when its queue is empty
    pub idle_poll_ms: u64,
    /// Worker poll between items when the queue is non-empty
    pub busy_poll_ms: u64,
    /// Stats observer cadence before / after the directory pool drains
    pub stats_interval_secs: u64,
    pub stats_drain_interval_secs: u64,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            threads: 5,
            timeout_secs: 100,
            directory_timeout_secs: 300,
            exact_file_sizes: false,
            determine_size_by_download: false,
            user_agent: None,
            username: None,
            password: None,
            idle_poll_ms: 1000,
            busy_poll_ms: 10,
            stats_interval_secs: 30,
            stats_drain_interval_secs: 5,
        }
    }
}

impl CrawlConfig {
    /// Validate all fields, collecting every error so the user can fix
    /// everything in one pass.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.threads == 0 {
            errors.push("threads must be positive".to_string());
        }
        if self.threads > 100 {
            errors.push("threads must be <= 100".to_string());
        }
        if self.timeout_secs == 0 {
            errors.push("timeout must be positive".to_string());
        }
        if self.directory_timeout_secs < self.timeout_secs {
            errors.push("directory timeout must be >= request timeout".to_string());
        }
        if self.username.is_none() && self.password.is_some() {
            errors.push("password supplied without a username".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    /// Credentials as a pair, when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// The user agent the first request of the session starts with
    pub fn initial_user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT)
    }
}
