//! Session rendering and persisted artifacts: the URL list file, the
//! markdown stats block, and the JSON snapshot.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::session::{DirSnapshot, Session, SessionSnapshot};

/// Turn the root URL into a filesystem-safe artifact stem:
/// `https://host/pub/` -> `host_pub`.
pub fn sanitize_url_to_filename(url: &str) -> String {
    let trimmed = url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("ftps://")
        .trim_start_matches("ftp://")
        .trim_end_matches('/');

    let mut name: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    while name.contains("__") {
        name = name.replace("__", "_");
    }
    if name.is_empty() {
        "index".to_string()
    } else {
        name
    }
}

/// Write one distinct file URL per line, in encounter order. Returns the
/// path written.
pub fn write_url_file(session: &Session, output_file: Option<PathBuf>) -> Result<PathBuf> {
    let path = output_file.unwrap_or_else(|| {
        PathBuf::from(format!(
            "{}.txt",
            sanitize_url_to_filename(session.root_url.as_str())
        ))
    });
    let mut contents = session.file_urls().join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    fs::write(&path, contents)
        .with_context(|| format!("failed to write URL list to {}", path.display()))?;
    Ok(path)
}

/// Serialize the session snapshot next to the URL list. Returns the path.
pub fn save_snapshot(session: &Session, output_file: Option<PathBuf>) -> Result<PathBuf> {
    let path = output_file.unwrap_or_else(|| {
        PathBuf::from(format!(
            "{}.json",
            sanitize_url_to_filename(session.root_url.as_str())
        ))
    });
    let snapshot = session.snapshot();
    let json = serde_json::to_string_pretty(&snapshot)?;
    fs::write(&path, json)
        .with_context(|| format!("failed to write snapshot to {}", path.display()))?;
    Ok(path)
}

/// Load a snapshot previously written by [`save_snapshot`].
pub fn load_snapshot(path: &Path) -> Result<SessionSnapshot> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read snapshot {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse snapshot {}", path.display()))
}

/// The human-postable markdown stats block.
pub fn render_markdown_stats(snapshot: &SessionSnapshot) -> String {
    let (dir_count, total_size) = tree_totals(&snapshot.root);
    let file_count = snapshot.root.file_count();

    let mut out = String::new();
    out.push_str("## Open directory index\n\n");
    out.push_str("| | |\n|---|---|\n");
    out.push_str(&format!("| URL | {} |\n", snapshot.root_url));
    out.push_str(&format!("| Directories | {} |\n", dir_count));
    out.push_str(&format!("| Files | {} |\n", file_count));
    out.push_str(&format!("| Total size | {} |\n", human_bytes(total_size)));
    out.push_str(&format!(
        "| HTTP requests | {} |\n",
        snapshot.total_http_requests
    ));
    out.push_str(&format!(
        "| HTTP traffic | {} |\n",
        human_bytes(snapshot.total_http_traffic)
    ));
    out.push_str(&format!("| Errors | {} |\n", snapshot.errors));
    out.push_str(&format!("| Skipped | {} |\n", snapshot.skipped));
    out.push_str(&format!("| Threads | {} |\n", snapshot.max_threads));

    if let (Some(started), Some(finished)) = (snapshot.started_at, snapshot.finished_at) {
        let elapsed = (finished - started).num_seconds().max(0);
        out.push_str(&format!("| Duration | {}s |\n", elapsed));
    }

    if !snapshot.status_codes.is_empty() {
        let histogram = snapshot
            .status_codes
            .iter()
            .map(|(code, count)| format!("{}: {}", code, count))
            .collect::<Vec<_>>()
            .join(", ");
        out.push_str(&format!("\nStatus codes: `{}`\n", histogram));
    }

    if !snapshot.urls_with_errors.is_empty() {
        out.push_str("\nURLs with errors:\n");
        for url in &snapshot.urls_with_errors {
            out.push_str(&format!("- {}\n", url));
        }
    }
    out
}

/// (directory count, total known size) across the subtree.
fn tree_totals(dir: &DirSnapshot) -> (usize, u64) {
    let mut dirs = 1usize;
    let mut size: u64 = dir.files.iter().filter_map(|f| f.size).sum();
    for sub in &dir.subdirectories {
        let (d, s) = tree_totals(sub);
        dirs += d;
        size += s;
    }
    (dirs, size)
}

/// 1536 -> "1.5 KiB"
pub fn human_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0usize;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::types::FileEntry;
    use url::Url;

    #[test]
    fn test_sanitize_url_to_filename() {
        assert_eq!(
            sanitize_url_to_filename("https://files.example.com/pub/linux/"),
            "files.example.com_pub_linux"
        );
        assert_eq!(
            sanitize_url_to_filename("ftp://mirror.example.org:21/"),
            "mirror.example.org_21"
        );
        assert_eq!(sanitize_url_to_filename("https://"), "index");
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.0 MiB");
    }

    #[test]
    fn test_url_file_and_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = Url::parse("https://example.com/pub/").unwrap();
        let session = Session::new(root, CrawlConfig::default());

        let file_url = Url::parse("https://example.com/pub/a.txt").unwrap();
        session.record_file(&file_url);
        session
            .tree
            .get_mut(&session.root_key)
            .unwrap()
            .files
            .push(FileEntry::new(file_url, "a.txt").with_size(10));

        let url_path = write_url_file(&session, Some(dir.path().join("urls.txt"))).unwrap();
        let contents = std::fs::read_to_string(&url_path).unwrap();
        assert_eq!(contents, "https://example.com/pub/a.txt\n");

        let json_path = save_snapshot(&session, Some(dir.path().join("session.json"))).unwrap();
        let loaded = load_snapshot(&json_path).unwrap();
        assert_eq!(loaded.root_url, "https://example.com/pub/");

        let stats = render_markdown_stats(&loaded);
        assert!(stats.contains("| Files | 1 |"));
        assert!(stats.contains("| Total size | 10 B |"));
    }
}
