//! Crawl boundary: decide whether a URL belongs under the seed prefix.

use url::Url;

/// Hosts whose file URLs live on different storage hosts than their
/// listing endpoints; these bypass the scope predicate entirely.
const EXEMPT_HOSTS: &[&str] = &[
    "drive.google.com",
    "docs.google.com",
    "googleusercontent.com",
    "blitzfiles.com",
];

/// True when the host is one of the recognized special services.
pub fn is_exempt_host(url: &Url) -> bool {
    let Some(host) = url.host_str() else {
        return false;
    };
    EXEMPT_HOSTS
        .iter()
        .any(|exempt| host == *exempt || host.ends_with(&format!(".{}", exempt)))
}

/// Scope predicate: `candidate` is inside the crawl boundary rooted at
/// `base` iff the URLs are byte-equal, or they share a host and one path
/// is a prefix of the other after stripping a trailing filename from
/// either side. Listings often link to sibling files whose URL lacks the
/// trailing slash; those must be accepted while cross-site links are not.
pub fn in_scope(base: &Url, candidate: &Url) -> bool {
    if base.as_str() == candidate.as_str() {
        return true;
    }
    if base.host_str() != candidate.host_str() {
        return false;
    }

    let base_path = base.path();
    let candidate_path = candidate.path();
    let base_dir = strip_trailing_filename(base_path);
    let candidate_dir = strip_trailing_filename(candidate_path);

    candidate_path.starts_with(base_path)
        || candidate_path.starts_with(base_dir)
        || candidate_dir.starts_with(base_path)
        || base_path.starts_with(candidate_path)
        || base_path.starts_with(candidate_dir)
}

/// Remove the last path segment when it looks like a filename. Any
/// non-empty final segment without a trailing '/' is treated as one.
fn strip_trailing_filename(path: &str) -> &str {
    if path.ends_with('/') {
        return path;
    }
    match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_identical_urls_are_in_scope() {
        let u = url("https://host/a/");
        assert!(in_scope(&u, &u));
    }

    #[test]
    fn test_subdirectory_is_in_scope() {
        assert!(in_scope(&url("https://host/a/"), &url("https://host/a/b/")));
        assert!(in_scope(&url("https://host/a/"), &url("https://host/a/b/c/")));
    }

    #[test]
    fn test_sibling_file_without_slash_is_in_scope() {
        // Listing at /a/ links to /a/file.txt (no trailing slash)
        assert!(in_scope(
            &url("https://host/a/"),
            &url("https://host/a/file.txt")
        ));
    }

    #[test]
    fn test_base_with_trailing_filename() {
        // Seed given as /a/index.html still covers /a/b/
        assert!(in_scope(
            &url("https://host/a/index.html"),
            &url("https://host/a/b/")
        ));
    }

    #[test]
    fn test_cross_host_is_out_of_scope() {
        assert!(!in_scope(&url("https://host/a/"), &url("https://other/")));
        assert!(!in_scope(&url("https://host/a/"), &url("https://other/a/")));
    }

    #[test]
    fn test_unrelated_path_is_out_of_scope() {
        assert!(!in_scope(&url("https://host/a/"), &url("https://host/b/")));
    }

    #[test]
    fn test_parent_of_base_is_in_scope() {
        // The predicate is symmetric on prefixes ("or vice versa")
        assert!(in_scope(&url("https://host/a/b/"), &url("https://host/a/")));
    }

    #[test]
    fn test_exempt_hosts() {
        assert!(is_exempt_host(&url("https://drive.google.com/drive/folders/abc")));
        assert!(is_exempt_host(&url("https://doc-00-bs.googleusercontent.com/x")));
        assert!(!is_exempt_host(&url("https://example.com/a/")));
    }
}
