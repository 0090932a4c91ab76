//! End-to-end crawls against an in-process stub server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use url::Url;

use odindex::{config::CrawlConfig, crawl::engine::IndexEngine, session::Session};

/// Fast polling so quiescence is reached quickly in tests.
fn test_config() -> CrawlConfig {
    CrawlConfig {
        threads: 3,
        idle_poll_ms: 20,
        busy_poll_ms: 5,
        ..CrawlConfig::default()
    }
}

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn run_crawl(root: Url, config: CrawlConfig) -> Arc<Session> {
    let session = Arc::new(Session::new(root, config));
    let engine = IndexEngine::new(Arc::clone(&session)).unwrap();
    tokio::time::timeout(Duration::from_secs(60), engine.run())
        .await
        .expect("crawl must reach quiescence")
        .expect("crawl must not fail fatally");
    session
}

/// One directory with two files; the size-less one is resolved via HEAD.
#[tokio::test]
async fn single_directory_with_two_files() {
    let listing = r#"<html><body><pre><a href="../">../</a>
<a href="a.txt">a.txt</a>                 17-Mar-2024 08:15        10
<a href="b.txt">b.txt</a>                 17-Mar-2024 08:15         -
</pre></body></html>"#;

    let app = Router::new()
        .route("/data/", get(move || async move { Html(listing) }))
        .route("/data/a.txt", get(|| async { "0123456789" }))
        .route("/data/b.txt", get(|| async { "01234567890123456789" }));
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/data/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    let entry = session.tree.get(&session.root_key).unwrap().clone();
    assert!(entry.finished);
    assert!(!entry.error);
    assert_eq!(entry.files.len(), 2);
    assert_eq!(entry.subdirectories.len(), 0);

    let a = entry.files.iter().find(|f| f.name == "a.txt").unwrap();
    assert_eq!(a.size, Some(10), "listing-provided size kept");
    let b = entry.files.iter().find(|f| f.name == "b.txt").unwrap();
    assert_eq!(b.size, Some(20), "unknown size resolved via HEAD");

    let urls = session.file_urls();
    assert_eq!(urls.len(), 2, "URL list has one line per file");

    // File accounting matches between the tree and the URL list
    assert_eq!(session.files_in_tree(), session.total_files());
}

/// `sub/` and `sub/../sub/` collapse to one canonical URL and the
/// directory is processed exactly once.
#[tokio::test]
async fn nested_directory_deduplication() {
    let sub_hits = Arc::new(AtomicUsize::new(0));

    let listing = r#"<a href="sub/">sub</a> <a href="sub/../sub/">sub again</a>"#;
    let sub_listing = r#"<a href="file.bin">file.bin</a>"#;

    let hits = Arc::clone(&sub_hits);
    let app = Router::new()
        .route("/x/", get(move || async move { Html(listing) }))
        .route(
            "/x/sub/",
            get(move || {
                let hits = Arc::clone(&hits);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    Html(sub_listing)
                }
            }),
        )
        .route("/x/sub/file.bin", get(|| async { "abc" }));
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/x/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    assert_eq!(sub_hits.load(Ordering::SeqCst), 1, "sub fetched exactly once");
    assert_eq!(session.processed_count(), 2, "root + sub");

    let sub_key = format!("http://{}/x/sub/", addr);
    let sub = session.tree.get(&sub_key).unwrap();
    assert!(sub.finished);
    assert_eq!(sub.files.len(), 1);
}

/// Two 503s then success: backoff is respected, the directory finishes
/// normally and is not recorded as an error.
#[tokio::test]
async fn rate_limit_then_success() {
    let attempts = Arc::new(AtomicUsize::new(0));

    #[derive(Clone)]
    struct AppState {
        attempts: Arc<AtomicUsize>,
    }

    async fn flaky(State(state): State<AppState>) -> axum::response::Response {
        let attempt = state.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
        } else {
            Html(r#"<a href="f.txt">f.txt</a>"#).into_response()
        }
    }

    let app = Router::new()
        .route("/d/", get(flaky))
        .route("/d/f.txt", get(|| async { "hello" }))
        .with_state(AppState {
            attempts: Arc::clone(&attempts),
        });
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/d/", addr)).unwrap();
    let started = Instant::now();
    let session = run_crawl(root, test_config()).await;
    let elapsed = started.elapsed();

    assert_eq!(attempts.load(Ordering::SeqCst), 3, "three listing requests");
    let histogram = session.status_histogram();
    assert_eq!(histogram.get(&503), Some(&2));

    // Backoff before retries 1 and 2: at least 2s + 4s
    assert!(
        elapsed >= Duration::from_secs(6),
        "backoff waits respected, got {:?}",
        elapsed
    );

    let entry = session.tree.get(&session.root_key).unwrap();
    assert!(entry.finished);
    assert!(!entry.error);
    assert!(session.urls_with_errors.is_empty());
    assert_eq!(session.errors.get(), 0);
}

/// Persistent 403: the directory is cancelled after the third attempt and
/// the crawl still reaches quiescence.
#[tokio::test]
async fn forbidden_after_three_attempts() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let hits = Arc::clone(&attempts);

    let app = Router::new().route(
        "/locked/",
        get(move || {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                (StatusCode::FORBIDDEN, "forbidden")
            }
        }),
    );
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/locked/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let entry = session.tree.get(&session.root_key).unwrap();
    assert!(entry.error);
    assert!(!entry.finished);
    assert!(entry.cancellation_reason.is_some());
    assert_eq!(session.errors.get(), 1);
    assert!(session
        .urls_with_errors
        .contains(&format!("http://{}/locked/", addr)));
}

/// Cross-host links are dropped; same-host links under the root are
/// followed.
#[tokio::test]
async fn off_scope_links_are_dropped() {
    let listing = r#"<a href="https://other.invalid/">offsite</a> <a href="/b/">b</a>"#;

    let app = Router::new()
        .route("/", get(move || async move { Html(listing) }))
        .route("/b/", get(|| async { Html(r#"<a href="f.txt">f</a>"#) }))
        .route("/b/f.txt", get(|| async { "x" }));
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    let b_key = format!("http://{}/b/", addr);
    let b = session.tree.get(&b_key).expect("in-scope directory crawled");
    assert!(b.finished);

    assert!(
        !session
            .tree
            .iter()
            .any(|e| e.url.host_str() == Some("other.invalid")),
        "off-scope host never entered the tree"
    );
    assert!(session.skipped.get() >= 1);
}

/// The final URI of a redirected fetch is written back onto the directory.
#[tokio::test]
async fn redirect_rewrites_directory_url() {
    let app = Router::new()
        .route(
            "/moved/",
            get(|| async {
                (
                    StatusCode::MOVED_PERMANENTLY,
                    [("location", "/real/")],
                    "moved",
                )
            }),
        )
        .route("/real/", get(|| async { Html(r#"<a href="f.txt">f</a>"#) }))
        .route("/real/f.txt", get(|| async { "x" }));
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/moved/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    let entry = session.tree.get(&session.root_key).unwrap();
    assert!(entry.finished);
    assert_eq!(entry.url.as_str(), format!("http://{}/real/", addr));
    assert_eq!(entry.files.len(), 1, "files resolve against the final URL");
}

/// Quiescence on a deeper tree: every directory ends finished or errored.
#[tokio::test]
async fn deep_tree_reaches_quiescence() {
    let app = Router::new()
        .route("/r/", get(|| async { Html(r#"<a href="a/">a</a><a href="b/">b</a>"#) }))
        .route("/r/a/", get(|| async { Html(r#"<a href="c/">c</a><a href="1.txt">1</a>"#) }))
        .route("/r/a/c/", get(|| async { Html(r#"<a href="2.txt">2</a>"#) }))
        .route("/r/b/", get(|| async { Html(r#"<a href="3.txt">3</a>"#) }))
        .route("/r/a/1.txt", get(|| async { "1" }))
        .route("/r/a/c/2.txt", get(|| async { "22" }))
        .route("/r/b/3.txt", get(|| async { "333" }));
    let addr = serve(app).await;

    let root = Url::parse(&format!("http://{}/r/", addr)).unwrap();
    let session = run_crawl(root, test_config()).await;

    assert_eq!(session.directory_count(), 4);
    assert_eq!(session.total_files(), 3);
    for entry in session.tree.iter() {
        assert!(
            entry.finished || entry.error,
            "directory {} neither finished nor errored",
            entry.url
        );
        assert!(entry.finished, "no directory should error here: {}", entry.url);
    }

    // Sizes came from HEAD since the listings carried none
    let sizes: u64 = session
        .tree
        .iter()
        .flat_map(|e| e.files.iter().filter_map(|f| f.size).collect::<Vec<_>>())
        .sum();
    assert_eq!(sizes, 1 + 2 + 3);

    assert_eq!(session.files_in_tree(), session.total_files());
}
