//! odindex: recursive indexer for open directory listings.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use odindex::{
    config::CrawlConfig,
    crawl::engine::IndexEngine,
    report, speedtest, upload,
    session::Session,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

#[derive(Parser)]
#[command(name = "odindex")]
#[command(about = "Recursive indexer for open directory listings")]
#[command(version)]
struct Cli {
    /// Seed URL of the open directory
    #[arg(short, long)]
    url: Option<String>,

    /// Worker count for both the directory and file-size pools
    #[arg(short, long, default_value = "5")]
    threads: usize,

    /// Per-request timeout in seconds
    #[arg(short = 'o', long, default_value = "100")]
    timeout: u64,

    /// Exit immediately on finish instead of waiting for ESC/C
    #[arg(short, long)]
    quit: bool,

    /// Write a JSON snapshot of the session
    #[arg(short, long)]
    json: bool,

    /// Suppress the URL list file
    #[arg(short = 'f', long)]
    no_urls: bool,

    /// Suppress the markdown stats block on stdout
    #[arg(short = 'r', long)]
    no_reddit: bool,

    /// HEAD every file regardless of listing-provided size
    #[arg(short, long)]
    exact_file_sizes: bool,

    /// Upload the URL list to a paste host (primary + fallback)
    #[arg(short = 'l', long)]
    upload_urls: bool,

    /// Download the largest file briefly to measure throughput
    #[arg(short, long)]
    speedtest: bool,

    /// Override the default user agent
    #[arg(short = 'a', long)]
    user_agent: Option<String>,

    /// HTTP Basic or FTP username
    #[arg(long)]
    username: Option<String>,

    /// HTTP Basic or FTP password
    #[arg(long)]
    password: Option<String>,

    /// Override the URL-list filename
    #[arg(long = "output-file", alias = "of")]
    output_file: Option<PathBuf>,

    /// Load a saved session snapshot and print its stats
    #[arg(long)]
    file: Option<PathBuf>,

    /// Verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Display-only resume: load a snapshot and print its stats block
    if let Some(path) = &cli.file {
        let snapshot = report::load_snapshot(path)?;
        println!("{}", report::render_markdown_stats(&snapshot));
        return Ok(());
    }

    let url = cli
        .url
        .clone()
        .context("--url is required (or --file to display a saved session)")?;
    let root = Url::parse(&url)
        .or_else(|_| Url::parse(&format!("https://{}", url)))
        .with_context(|| format!("invalid seed URL: {}", url))?;

    let config = CrawlConfig {
        threads: cli.threads,
        timeout_secs: cli.timeout,
        exact_file_sizes: cli.exact_file_sizes,
        user_agent: cli.user_agent.clone(),
        username: cli.username.clone(),
        password: cli.password.clone(),
        ..CrawlConfig::default()
    };
    config.validate()?;

    info!(url = %root, threads = config.threads, "starting index");

    let session = Arc::new(Session::new(root, config));
    let engine = IndexEngine::new(Arc::clone(&session))?;

    // Graceful shutdown on Ctrl-C; both pools notice on their next poll
    let signal_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, shutting down");
            signal_engine.shutdown();
        }
    });

    engine.run().await.context("indexing failed")?;

    let snapshot = session.snapshot();
    if !cli.no_reddit {
        println!("{}", report::render_markdown_stats(&snapshot));
    }

    if !cli.no_urls {
        let path = report::write_url_file(&session, cli.output_file.clone())?;
        info!(path = %path.display(), urls = session.total_files(), "URL list written");

        if cli.upload_urls {
            match upload::upload_url_list(engine.fetcher.client(), &path).await {
                Ok(link) => println!("URL list uploaded: {}", link),
                Err(error) => warn!(%error, "URL list upload failed"),
            }
        }
    }

    if cli.json {
        let path = report::save_snapshot(&session, None)?;
        info!(path = %path.display(), "session snapshot written");
    }

    if cli.speedtest {
        match speedtest::run_speedtest(engine.fetcher.client(), &session).await {
            Ok(Some(result)) => println!(
                "Speed test: {:.1} MB/s ({} in {:.1}s)",
                result.megabytes_per_second(),
                report::human_bytes(result.bytes),
                result.elapsed.as_secs_f64()
            ),
            Ok(None) => info!("no sized file available for a speed test"),
            Err(error) => warn!(%error, "speed test failed"),
        }
    }

    if !cli.quit {
        println!("Press ESC or C to exit...");
        wait_for_exit_key();
    }

    Ok(())
}

/// Foreground wait for ESC or C. Raw mode failures (no tty) fall through
/// so batch invocations never hang on a terminal that is not there.
fn wait_for_exit_key() {
    use crossterm::event::{poll, read, Event, KeyCode};
    use crossterm::terminal::{disable_raw_mode, enable_raw_mode};

    if enable_raw_mode().is_err() {
        return;
    }
    loop {
        match poll(Duration::from_millis(500)) {
            Ok(true) => {
                if let Ok(Event::Key(key)) = read() {
                    match key.code {
                        KeyCode::Esc | KeyCode::Char('c') | KeyCode::Char('C') => break,
                        _ => {}
                    }
                }
            }
            Ok(false) => {}
            Err(_) => break,
        }
    }
    let _ = disable_raw_mode();
}
