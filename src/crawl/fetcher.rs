//! HTTP fetch engine shared by all workers.
//!
//! One `reqwest::Client` serves the whole session. Certificate validation
//! is disabled on purpose: servers in this domain frequently ship broken
//! or self-signed certs, and indexing them is the whole point. Compression
//! (gzip, deflate, brotli) is negotiated by the client.
//!
//! Until the first listing parses successfully, requests walk a user-agent
//! fallback ladder (configured/default -> curl -> Chrome); a failed
//! attempt, an empty body, or the `HTTP_USER_AGENT` sentinel in the body
//! advances the ladder. After the first success the winning agent is kept
//! and a `Referer` equal to that directory's URL is pinned on every
//! subsequent request.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, REFERER, SERVER, USER_AGENT};
use tokio::sync::Mutex;
use url::Url;

use crate::config::{CrawlConfig, CHROME_USER_AGENT, CURL_USER_AGENT};
use crate::crawl::retry::CrawlError;
use crate::session::Session;

/// Body marker some servers echo back when they dislike the user agent.
const USER_AGENT_SENTINEL: &str = "HTTP_USER_AGENT";

/// Result of a successful directory fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    /// URL the request was issued for
    pub requested: Url,
    /// Final URL after redirects; the directory is rewritten to this
    pub final_url: Url,
    pub status: u16,
    /// `Server` response header, used for parser detection
    pub server: Option<String>,
    pub body: String,
}

#[derive(Debug)]
struct ClientState {
    /// Index into the user-agent ladder while bootstrapping
    rung: usize,
    /// Ladder finished: `ladder[rung]` is the session's agent from now on
    bootstrapped: bool,
    referer: Option<String>,
}

pub struct Fetcher {
    client: reqwest::Client,
    session: Arc<Session>,
    ladder: [String; 3],
    state: Mutex<ClientState>,
    credentials: Option<(String, String)>,
}

impl Fetcher {
    pub fn new(config: &CrawlConfig, session: Arc<Session>) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(Duration::from_secs(30))
            .redirect(reqwest::redirect::Policy::limited(10))
            .danger_accept_invalid_certs(true)
            .gzip(true)
            .deflate(true)
            .brotli(true)
            .build()
            .map_err(CrawlError::from_reqwest)?;

        Ok(Self {
            client,
            session,
            ladder: [
                config.initial_user_agent().to_string(),
                CURL_USER_AGENT.to_string(),
                CHROME_USER_AGENT.to_string(),
            ],
            state: Mutex::new(ClientState {
                rung: 0,
                bootstrapped: false,
                referer: None,
            }),
            credentials: config
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string())),
        })
    }

    /// The shared client, for callers that stream (size probes, speed test).
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Fetch one directory listing body.
    pub async fn fetch_directory(&self, url: &Url) -> Result<FetchResponse, CrawlError> {
        let (user_agent, referer, bootstrapped) = {
            let state = self.state.lock().await;
            (
                self.ladder[state.rung].clone(),
                state.referer.clone(),
                state.bootstrapped,
            )
        };

        let result = self.send_get(url, &user_agent, referer.as_deref()).await;

        if bootstrapped {
            return result;
        }

        // Ladder bookkeeping: pin the agent on the first clean body,
        // advance the rung on anything that smells like agent sniffing.
        match result {
            Ok(response) if !response.body.is_empty() && !response.body.contains(USER_AGENT_SENTINEL) => {
                let mut state = self.state.lock().await;
                if !state.bootstrapped {
                    state.bootstrapped = true;
                    state.referer = Some(response.final_url.to_string());
                    tracing::debug!(
                        agent = %self.ladder[state.rung],
                        "user agent pinned for the session"
                    );
                }
                Ok(response)
            }
            Ok(response) => {
                self.advance_ladder().await;
                if response.body.is_empty() {
                    Err(CrawlError::EmptyListing)
                } else {
                    Err(CrawlError::Parse("server rejected the user agent".to_string()))
                }
            }
            Err(error) => {
                self.advance_ladder().await;
                Err(error)
            }
        }
    }

    async fn advance_ladder(&self) {
        let mut state = self.state.lock().await;
        if !state.bootstrapped && state.rung + 1 < self.ladder.len() {
            state.rung += 1;
            tracing::debug!(agent = %self.ladder[state.rung], "falling back to next user agent");
        }
    }

    async fn send_get(
        &self,
        url: &Url,
        user_agent: &str,
        referer: Option<&str>,
    ) -> Result<FetchResponse, CrawlError> {
        let mut request = self.client.get(url.as_str()).header(USER_AGENT, user_agent);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                self.session.record_request();
                return Err(CrawlError::from_reqwest(error));
            }
        };

        let status = response.status();
        let final_url = response.url().clone();
        let server = header_string(&response, SERVER.as_str());
        let content_type = header_string(&response, CONTENT_TYPE.as_str());

        let bytes = response.bytes().await.map_err(|error| {
            self.session.record_request();
            CrawlError::from_reqwest(error)
        })?;

        self.session.record_response(status.as_u16(), bytes.len() as u64);

        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }

        let body = decode_body(&bytes, content_type.as_deref());

        Ok(FetchResponse {
            requested: url.clone(),
            final_url,
            status: status.as_u16(),
            server,
            body,
        })
    }

    /// Issue a HEAD request and read `Content-Length`, if the server sends one.
    pub async fn head_content_length(&self, url: &Url) -> Result<Option<u64>, CrawlError> {
        let (user_agent, referer) = {
            let state = self.state.lock().await;
            (self.ladder[state.rung].clone(), state.referer.clone())
        };

        let mut request = self.client.head(url.as_str()).header(USER_AGENT, user_agent);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                self.session.record_request();
                return Err(CrawlError::from_reqwest(error));
            }
        };

        let status = response.status();
        self.session.record_response(status.as_u16(), 0);
        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }

        let length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());
        Ok(length)
    }

    /// POST a JSON payload and return the response body (GoIndex listings).
    pub async fn post_json(
        &self,
        url: &Url,
        payload: &serde_json::Value,
    ) -> Result<String, CrawlError> {
        let (user_agent, referer) = {
            let state = self.state.lock().await;
            (self.ladder[state.rung].clone(), state.referer.clone())
        };

        let mut request = self
            .client
            .post(url.as_str())
            .header(USER_AGENT, user_agent)
            .json(payload);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                self.session.record_request();
                return Err(CrawlError::from_reqwest(error));
            }
        };

        let status = response.status();
        let bytes = response.bytes().await.map_err(|error| {
            self.session.record_request();
            CrawlError::from_reqwest(error)
        })?;
        self.session.record_response(status.as_u16(), bytes.len() as u64);
        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Start a GET whose body the caller will stream (size-by-download,
    /// speed test). Headers and auth match regular fetches.
    pub async fn get_streaming(&self, url: &Url) -> Result<reqwest::Response, CrawlError> {
        let (user_agent, referer) = {
            let state = self.state.lock().await;
            (self.ladder[state.rung].clone(), state.referer.clone())
        };

        let mut request = self.client.get(url.as_str()).header(USER_AGENT, user_agent);
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }
        if let Some((user, pass)) = &self.credentials {
            request = request.basic_auth(user, Some(pass));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(error) => {
                self.session.record_request();
                return Err(CrawlError::from_reqwest(error));
            }
        };

        let status = response.status();
        self.session.record_response(status.as_u16(), 0);
        if !status.is_success() {
            return Err(CrawlError::Status(status.as_u16()));
        }
        Ok(response)
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Decode a response body honoring the declared charset, repairing the
/// `utf8` and `GB1212` labels some servers emit (both are treated as
/// UTF-8, matching how browsers recover from them).
fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let label = content_type
        .and_then(extract_charset)
        .map(|charset| {
            if charset.eq_ignore_ascii_case("utf8") || charset.eq_ignore_ascii_case("gb1212") {
                "utf-8".to_string()
            } else {
                charset
            }
        })
        .unwrap_or_else(|| "utf-8".to_string());

    let encoding =
        encoding_rs::Encoding::for_label(label.as_bytes()).unwrap_or(encoding_rs::UTF_8);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

fn extract_charset(content_type: &str) -> Option<String> {
    content_type
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("charset="))
        .map(|charset| charset.trim_matches('"').to_string())
}
