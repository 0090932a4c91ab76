//! FTP and FTPS directory listings.
//!
//! The FTP client is blocking, so every command runs on the blocking
//! thread pool. Each worker caches one connection in the session registry
//! under its own name and is the only user of that entry. A server
//! reporting its connection limit is not an error: the caller requeues the
//! directory and retires the worker's connection.

use std::sync::Arc;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use percent_encoding::percent_decode_str;
use regex::Regex;
use suppaftp::native_tls::TlsConnector;
use suppaftp::{list, NativeTlsConnector, NativeTlsFtpStream};
use url::Url;

use super::ParsedListing;
use crate::crawl::retry::{CrawlError, TransportKind};
use crate::session::{Session, PARAM_FTP_SERVER_INFO};
use crate::types::FileEntry;

pub const FTP_DEFAULT_PORT: u16 = 21;
/// Implicit FTPS port, substituted when an ftps URL has none.
pub const FTPS_DEFAULT_PORT: u16 = 990;

const ANONYMOUS_USER: &str = "anonymous";
const ANONYMOUS_PASS: &str = "anonymous@example.com";

/// One cached FTP control connection.
pub struct FtpConnection {
    stream: NativeTlsFtpStream,
}

/// List one FTP directory using (or establishing) the worker's cached
/// connection. On success the connection goes back into the registry; on
/// any failure it is dropped so the next attempt reconnects cleanly.
pub async fn fetch_ftp_listing(
    worker: &str,
    url: &Url,
    session: &Arc<Session>,
) -> Result<ParsedListing, CrawlError> {
    let cached = session.ftp_clients.lock().remove(worker);
    let target = url.clone();
    let credentials = session
        .config
        .credentials()
        .map(|(user, pass)| (user.to_string(), pass.to_string()));

    let outcome = tokio::task::spawn_blocking(move || blocking_list(cached, &target, credentials))
        .await
        .map_err(|e| CrawlError::Parse(format!("ftp task failed: {}", e)))?;

    let (connection, banner, entries) = outcome?;

    if let Some(banner) = banner {
        session
            .parameters
            .entry(PARAM_FTP_SERVER_INFO.to_string())
            .or_insert_with(|| scrub_ip_addresses(&banner));
    }
    session
        .ftp_clients
        .lock()
        .insert(worker.to_string(), connection);

    Ok(listing_from_entries(url, &entries))
}

/// Quit and drop a worker's cached connection (connection-limit requeue).
pub async fn close_worker_connection(worker: &str, session: &Arc<Session>) {
    let connection = session.ftp_clients.lock().remove(worker);
    if let Some(mut connection) = connection {
        let _ = tokio::task::spawn_blocking(move || connection.stream.quit()).await;
    }
}

fn blocking_list(
    cached: Option<FtpConnection>,
    url: &Url,
    credentials: Option<(String, String)>,
) -> Result<(FtpConnection, Option<String>, Vec<list::File>), CrawlError> {
    let (mut connection, banner) = match cached {
        Some(connection) => (connection, None),
        None => {
            let (connection, banner) = connect(url, credentials)?;
            (connection, banner)
        }
    };

    let path = percent_decode_str(url.path()).decode_utf8_lossy().into_owned();
    let lines = connection
        .stream
        .list(Some(&path))
        .map_err(map_ftp_error)?;

    let entries = lines
        .iter()
        .filter_map(|line| list::File::try_from(line.as_str()).ok())
        .collect();

    Ok((connection, banner, entries))
}

fn connect(
    url: &Url,
    credentials: Option<(String, String)>,
) -> Result<(FtpConnection, Option<String>), CrawlError> {
    let host = url
        .host_str()
        .ok_or_else(|| CrawlError::Parse("ftp URL has no host".to_string()))?;
    let secure = url.scheme() == "ftps";
    let port = url
        .port()
        .unwrap_or(if secure { FTPS_DEFAULT_PORT } else { FTP_DEFAULT_PORT });

    let stream =
        NativeTlsFtpStream::connect(format!("{}:{}", host, port)).map_err(map_ftp_error)?;

    let mut stream = if secure {
        let tls = TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CrawlError::Transport {
                kind: TransportKind::Tls,
                message: e.to_string(),
            })?;
        stream
            .into_secure(NativeTlsConnector::from(tls), host)
            .map_err(map_ftp_error)?
    } else {
        stream
    };

    let banner = stream.get_welcome_msg().map(str::to_string);

    let (user, pass) = credentials
        .unwrap_or_else(|| (ANONYMOUS_USER.to_string(), ANONYMOUS_PASS.to_string()));
    stream.login(&user, &pass).map_err(map_ftp_error)?;

    Ok((FtpConnection { stream }, banner))
}

fn listing_from_entries(url: &Url, entries: &[list::File]) -> ParsedListing {
    let mut listing = ParsedListing {
        parser: "ftp".to_string(),
        ..Default::default()
    };

    for entry in entries {
        let name = entry.name();
        if name == "." || name == ".." {
            continue;
        }
        if entry.is_directory() {
            if let Ok(sub) = url.join(&format!("{}/", name)) {
                listing.subdirectories.push(sub);
            }
        } else if entry.is_file() {
            if let Ok(file_url) = url.join(name) {
                let mut file = FileEntry::new(file_url, name);
                file.size = Some(entry.size() as u64);
                file.timestamp = Some(DateTime::<Utc>::from(entry.modified()));
                listing.files.push(file);
            }
        }
    }
    listing
}

/// Map FTP failures into the crawl error space. The connection-limit case
/// is distinguished so the engine can requeue instead of erroring.
fn map_ftp_error(error: suppaftp::FtpError) -> CrawlError {
    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("too many connections")
        || lowered.contains("maximum number of connections")
        || lowered.contains("421")
    {
        return CrawlError::FtpConnectionLimit;
    }
    let kind = if lowered.contains("connection refused") {
        TransportKind::ConnectionRefused
    } else if lowered.contains("failed to lookup") || lowered.contains("no such host") {
        TransportKind::DnsFailure
    } else {
        TransportKind::Other
    };
    CrawlError::Transport { kind, message }
}

/// Replace IPv4 addresses in a server banner before it is stored.
pub fn scrub_ip_addresses(text: &str) -> String {
    static IP_PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = IP_PATTERN
        .get_or_init(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}\b").expect("static pattern"));
    pattern.replace_all(text, "[redacted]").into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrub_ip_addresses() {
        let banner = "220 ProFTPD Server (ftp.example.com) [203.0.113.7]";
        let scrubbed = scrub_ip_addresses(banner);
        assert!(!scrubbed.contains("203.0.113.7"));
        assert!(scrubbed.contains("[redacted]"));
        assert!(scrubbed.contains("ProFTPD"));
    }

    #[test]
    fn test_scrub_leaves_versions_alone() {
        assert_eq!(scrub_ip_addresses("vsFTPd 3.0.5"), "vsFTPd 3.0.5");
    }

    #[test]
    fn test_listing_from_entries() {
        let lines = [
            "drwxr-xr-x 2 ftp ftp 4096 Mar 17 08:15 pub",
            "-rw-r--r-- 1 ftp ftp 1024 Mar 17 08:16 readme.txt",
        ];
        let entries: Vec<list::File> = lines
            .iter()
            .filter_map(|line| list::File::try_from(*line).ok())
            .collect();
        assert_eq!(entries.len(), 2);

        let url = Url::parse("ftp://ftp.example.com/mirror/").unwrap();
        let listing = listing_from_entries(&url, &entries);
        assert_eq!(listing.subdirectories.len(), 1);
        assert_eq!(
            listing.subdirectories[0].as_str(),
            "ftp://ftp.example.com/mirror/pub/"
        );
        assert_eq!(listing.files.len(), 1);
        assert_eq!(listing.files[0].size, Some(1024));
    }

    #[test]
    fn test_connection_limit_mapping() {
        // FtpError's Display for unexpected responses includes the raw text
        let error = suppaftp::FtpError::BadResponse;
        assert!(!matches!(
            map_ftp_error(error),
            CrawlError::FtpConnectionLimit
        ));
    }

    #[test]
    fn test_ftps_default_port() {
        let url = Url::parse("ftps://ftp.example.com/pub/").unwrap();
        let secure = url.scheme() == "ftps";
        let port = url
            .port()
            .unwrap_or(if secure { FTPS_DEFAULT_PORT } else { FTP_DEFAULT_PORT });
        assert_eq!(port, 990);
    }
}
