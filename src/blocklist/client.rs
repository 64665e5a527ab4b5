//! Remote blocklist client
//!
//! Fetches `<base>/blocklist.json`, echoing the last `X-Content-Hash` as a
//! `?hash=` parameter so the server can answer `304 Not Modified`. The parsed
//! snapshot is published behind a single `RwLock` swap; parsing happens on a
//! blocking thread before the write lock is taken.

use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use super::parser::parse_document;
use super::snapshot::BlocklistSnapshot;
use super::BlocklistError;
use crate::types::BlocklistEntry;

const USER_AGENT: &str = concat!("picketline-dns/", env!("CARGO_PKG_VERSION"));
const CONTENT_HASH_HEADER: &str = "X-Content-Hash";
const API_KEY_HEADER: &str = "X-API-Key";

/// Backoff step between initial fetch attempts
const INITIAL_BACKOFF_STEP: Duration = Duration::from_secs(3);
const INITIAL_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Result of a successful fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// A new snapshot was parsed and published
    Updated(Arc<BlocklistSnapshot>),
    /// The server reported no change; carries whatever is cached
    NotModified(Option<Arc<BlocklistSnapshot>>),
}

impl FetchOutcome {
    pub fn snapshot(&self) -> Option<&Arc<BlocklistSnapshot>> {
        match self {
            Self::Updated(snapshot) => Some(snapshot),
            Self::NotModified(snapshot) => snapshot.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    snapshot: Option<Arc<BlocklistSnapshot>>,
    content_hash: Option<String>,
    last_fetch: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Blocklist cache backed by the remote API
pub struct BlocklistClient {
    endpoint: String,
    api_key: String,
    http: Client,
    state: RwLock<CacheState>,
    fetch_failures: AtomicU64,
}

impl BlocklistClient {
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self, BlocklistError> {
        let http = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(BlocklistError::ClientBuild)?;

        Ok(Self {
            endpoint: format!("{}/blocklist.json", base_url.trim_end_matches('/')),
            api_key: api_key.to_string(),
            http,
            state: RwLock::new(CacheState::default()),
            fetch_failures: AtomicU64::new(0),
        })
    }

    /// Conditionally fetch the blocklist and publish it
    ///
    /// Errors leave the cached snapshot in place and bump the failure counter.
    pub async fn fetch(&self) -> Result<FetchOutcome, BlocklistError> {
        match self.fetch_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                self.state.write().await.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch_inner(&self) -> Result<FetchOutcome, BlocklistError> {
        let hash = self.state.read().await.content_hash.clone();

        let mut request = self
            .http
            .get(&self.endpoint)
            .header(ACCEPT, "application/json");
        if !self.api_key.is_empty() {
            request = request.header(API_KEY_HEADER, &self.api_key);
        }
        if let Some(hash) = &hash {
            request = request.query(&[("hash", hash)]);
        }

        let response = request.send().await.map_err(|source| BlocklistError::Request {
            url: self.endpoint.clone(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            debug!("Blocklist not modified");
            return Ok(FetchOutcome::NotModified(self.cached_snapshot().await));
        }

        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(BlocklistError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let new_hash = response
            .headers()
            .get(CONTENT_HASH_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let body = response.bytes().await.map_err(|source| BlocklistError::Request {
            url: self.endpoint.clone(),
            source,
        })?;

        let parsed = tokio::task::spawn_blocking(move || parse_document(&body)).await??;
        let snapshot = Arc::new(BlocklistSnapshot::from(parsed));

        {
            let mut state = self.state.write().await;
            state.snapshot = Some(Arc::clone(&snapshot));
            state.last_fetch = Some(Utc::now());
            state.last_error = None;
            if new_hash.is_some() {
                state.content_hash = new_hash;
            }
        }

        Ok(FetchOutcome::Updated(snapshot))
    }

    /// Entry covering `domain` or one of its parents; `None` until a snapshot loads
    pub async fn lookup(&self, domain: &str) -> Option<Arc<BlocklistEntry>> {
        let snapshot = self.state.read().await.snapshot.clone()?;
        snapshot.lookup(domain)
    }

    pub async fn cached_snapshot(&self) -> Option<Arc<BlocklistSnapshot>> {
        self.state.read().await.snapshot.clone()
    }

    pub async fn last_fetch_time(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_fetch
    }

    pub async fn last_error(&self) -> Option<String> {
        self.state.read().await.last_error.clone()
    }

    pub async fn content_hash(&self) -> Option<String> {
        self.state.read().await.content_hash.clone()
    }

    pub async fn is_loaded(&self) -> bool {
        self.state.read().await.snapshot.is_some()
    }

    pub fn fetch_failures(&self) -> u64 {
        self.fetch_failures.load(Ordering::Relaxed)
    }

    /// Publish a snapshot without contacting the API
    pub async fn install_snapshot(&self, snapshot: BlocklistSnapshot) -> Arc<BlocklistSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut state = self.state.write().await;
        state.snapshot = Some(Arc::clone(&snapshot));
        state.last_fetch = Some(Utc::now());
        snapshot
    }

    /// Fetch at startup with linear backoff
    ///
    /// Returns `true` once a snapshot is loaded. Giving up is not fatal: the
    /// responder serves everything unblocked until a refresh succeeds.
    pub async fn fetch_initial(&self, attempts: u32, shutdown: &mut watch::Receiver<bool>) -> bool {
        for attempt in 1..=attempts.max(1) {
            match self.fetch().await {
                Ok(outcome) => {
                    log_outcome(&outcome);
                    return true;
                }
                Err(e) => {
                    warn!(
                        "⚠️  Initial blocklist fetch failed (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                }
            }

            if attempt >= attempts {
                break;
            }

            let delay = initial_backoff(attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => return false,
            }
        }

        error!("❌ Could not load blocklist, serving unblocked until a refresh succeeds");
        false
    }
}

/// Delay after the given failed attempt
fn initial_backoff(attempt: u32) -> Duration {
    (INITIAL_BACKOFF_STEP * attempt).min(INITIAL_BACKOFF_MAX)
}

fn log_outcome(outcome: &FetchOutcome) {
    match outcome {
        FetchOutcome::Updated(snapshot) => info!(
            "📋 Blocklist loaded: {} domains from {} employers",
            snapshot.domain_count(),
            snapshot.employers.len()
        ),
        FetchOutcome::NotModified(_) => debug!("📋 Blocklist unchanged"),
    }
}

/// Initial fetch, then refresh every `interval` until shutdown
pub async fn run_periodic_refresh(
    client: Arc<BlocklistClient>,
    interval: Duration,
    initial_attempts: u32,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    client.fetch_initial(initial_attempts, &mut shutdown).await;
    if *shutdown.borrow() {
        return Ok(());
    }

    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match client.fetch().await {
                    Ok(outcome) => log_outcome(&outcome),
                    Err(e) => error!("Blocklist refresh failed, keeping cached copy: {}", e),
                }
            }
            _ = shutdown.changed() => {
                debug!("Blocklist refresh stopped");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BODY: &str = r#"{
        "Test Corp": {
            "moreInfoUrl": "https://union.example.org",
            "matchingUrlRegexes": ["example.com"],
            "actionDetails": {"id": "a1", "actionType": "strike"}
        }
    }"#;

    fn client_for(server: &MockServer, api_key: &str) -> BlocklistClient {
        BlocklistClient::new(&format!("{}/", server.uri()), api_key, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_publishes_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocklist.json"))
            .and(header("X-API-Key", "secret-key"))
            .and(header("Accept", "application/json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Content-Hash", "hash123")
                    .set_body_string(BODY),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "secret-key");
        assert!(client.lookup("www.example.com").await.is_none());

        let outcome = client.fetch().await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Updated(_)));

        let entry = client.lookup("www.example.com").await.unwrap();
        assert_eq!(entry.employer, "Test Corp");
        assert_eq!(client.content_hash().await.as_deref(), Some("hash123"));
        assert!(client.last_fetch_time().await.is_some());
        assert_eq!(client.fetch_failures(), 0);
    }

    #[tokio::test]
    async fn test_not_modified_keeps_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocklist.json"))
            .and(query_param("hash", "hash123"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/blocklist.json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-Content-Hash", "hash123")
                    .set_body_string(BODY),
            )
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        let first = client.fetch().await.unwrap();
        let first = first.snapshot().cloned().unwrap();
        let fetched_at = client.last_fetch_time().await;

        let second = client.fetch().await.unwrap();
        match second {
            FetchOutcome::NotModified(Some(snapshot)) => assert!(Arc::ptr_eq(&snapshot, &first)),
            other => panic!("expected NotModified with cached snapshot, got {:?}", other),
        }

        assert_eq!(client.fetch_failures(), 0);
        assert_eq!(client.last_fetch_time().await, fetched_at);
    }

    #[tokio::test]
    async fn test_error_status_keeps_stale_snapshot() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/blocklist.json"))
            .respond_with(ResponseTemplate::new(500).set_body_string("Internal Server Error"))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        client
            .install_snapshot(BlocklistSnapshot::from_entries(vec![BlocklistEntry {
                domain: "example.com".to_string(),
                employer: "Seeded Corp".to_string(),
                ..Default::default()
            }]))
            .await;

        match client.fetch().await {
            Err(BlocklistError::Status { status, body }) => {
                assert_eq!(status, 500);
                assert_eq!(body, "Internal Server Error");
            }
            other => panic!("expected status error, got {:?}", other),
        }

        assert_eq!(client.fetch_failures(), 1);
        assert!(client.last_error().await.is_some());
        assert_eq!(client.lookup("example.com").await.unwrap().employer, "Seeded Corp");
    }

    #[tokio::test]
    async fn test_invalid_body_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        assert!(matches!(client.fetch().await, Err(BlocklistError::Parse(_))));
        assert!(!client.is_loaded().await);
    }

    #[tokio::test]
    async fn test_fetch_initial_gives_up_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client_for(&server, "");
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();

        assert!(!client.fetch_initial(5, &mut rx).await);
        assert_eq!(client.fetch_failures(), 1);
    }

    #[test]
    fn test_initial_backoff_capped() {
        assert_eq!(initial_backoff(1), Duration::from_secs(3));
        assert_eq!(initial_backoff(4), Duration::from_secs(12));
        assert_eq!(initial_backoff(20), Duration::from_secs(30));
    }
}
