//! Periodic stats reporting
//!
//! Best effort: a failed POST is logged and the report dropped. The next
//! report's deltas do not include the dropped interval.

use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::StatsCollector;
use crate::blocklist::BlocklistClient;
use crate::session::SessionStore;
use crate::types::StatsReport;

const USER_AGENT: &str = concat!("picketline-dns/", env!("CARGO_PKG_VERSION"));
const REPORT_TIMEOUT: Duration = Duration::from_secs(10);
const TOP_DOMAINS: usize = 10;

pub struct StatsReporter {
    collector: Arc<StatsCollector>,
    blocklist: Arc<BlocklistClient>,
    sessions: Option<Arc<SessionStore>>,
    http: Client,
    report_url: String,
    api_key: String,
    instance_id: String,
}

impl StatsReporter {
    pub fn new(
        collector: Arc<StatsCollector>,
        blocklist: Arc<BlocklistClient>,
        sessions: Option<Arc<SessionStore>>,
        report_url: String,
        api_key: String,
        instance_id: String,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REPORT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            collector,
            blocklist,
            sessions,
            http,
            report_url,
            api_key,
            instance_id,
        })
    }

    /// Assemble a report; moves the delta baseline
    pub async fn build_report(&self) -> StatsReport {
        let (totals, deltas) = self.collector.snapshot_with_deltas();

        let active_sessions = match &self.sessions {
            Some(sessions) => sessions.active_count().await,
            None => 0,
        };

        let (blocklist_size, blocklist_employers) = match self.blocklist.cached_snapshot().await {
            Some(snapshot) => (snapshot.domain_count(), snapshot.employers.len()),
            None => (0, 0),
        };

        StatsReport {
            instance_id: self.instance_id.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime: self.collector.uptime().as_secs(),
            total_queries: totals.total_queries,
            queries_blocked: totals.queries_blocked,
            queries_forwarded: totals.queries_forwarded,
            bypasses_issued: totals.bypasses_issued,
            active_sessions,
            blocklist_size,
            blocklist_employers,
            last_blocklist_refresh: self
                .blocklist
                .last_fetch_time()
                .await
                .map(|t| t.to_rfc3339()),
            top_blocked_domains: self.collector.top_blocked_domains(TOP_DOMAINS),
            queries_since_last_report: deltas.total_queries,
            blocked_since_last_report: deltas.queries_blocked,
            forwarded_since_last_report: deltas.queries_forwarded,
            bypasses_since_last_report: deltas.bypasses_issued,
        }
    }

    /// Build and POST one report; returns whether the sink accepted it
    pub async fn send_report(&self) -> bool {
        let report = self.build_report().await;

        let result = self
            .http
            .post(&self.report_url)
            .header(CONTENT_TYPE, "application/json")
            .header("X-API-Key", &self.api_key)
            .json(&report)
            .send()
            .await;

        match result {
            Ok(response) if response.status().as_u16() >= 400 => {
                warn!(
                    "Stats report rejected by {}: status {}",
                    self.report_url,
                    response.status()
                );
                false
            }
            Ok(_) => {
                debug!(
                    "Stats report sent: {} queries, {} blocked, +{} since last",
                    report.total_queries, report.queries_blocked, report.queries_since_last_report
                );
                true
            }
            Err(e) => {
                warn!("Failed to send stats report: {}", e);
                false
            }
        }
    }

    /// Report every `interval`; sends a final report on shutdown
    pub async fn run(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(
            "📊 Stats reporter started ({}s interval, instance {})",
            interval.as_secs(),
            self.instance_id
        );

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_report().await;
                }
                _ = shutdown.changed() => {
                    self.send_report().await;
                    debug!("Stats reporter stopped");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::BlocklistSnapshot;
    use crate::types::BlocklistEntry;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn reporter(url: String) -> (StatsReporter, Arc<StatsCollector>) {
        let collector = Arc::new(StatsCollector::new());
        let blocklist = Arc::new(
            BlocklistClient::new("http://127.0.0.1:9", "", Duration::from_secs(1)).unwrap(),
        );
        blocklist
            .install_snapshot(BlocklistSnapshot::from_entries(vec![
                BlocklistEntry {
                    domain: "example.com".to_string(),
                    employer: "Test Corp".to_string(),
                    ..Default::default()
                },
                BlocklistEntry {
                    domain: "example.net".to_string(),
                    employer: "Other Corp".to_string(),
                    ..Default::default()
                },
            ]))
            .await;
        let sessions = Arc::new(SessionStore::new(b"secret", Duration::from_secs(60)).unwrap());
        sessions.create_token("10.0.0.1", "example.com").await.unwrap();

        let reporter = StatsReporter::new(
            Arc::clone(&collector),
            blocklist,
            Some(sessions),
            url,
            "report-key".to_string(),
            "dns-test".to_string(),
        )
        .unwrap();

        (reporter, collector)
    }

    #[tokio::test]
    async fn test_build_report() {
        let (reporter, collector) = reporter("http://127.0.0.1:9/report".to_string()).await;
        collector.record_query();
        collector.record_block("example.com");
        collector.record_bypass();

        let report = reporter.build_report().await;
        assert_eq!(report.instance_id, "dns-test");
        assert_eq!(report.total_queries, 2);
        assert_eq!(report.queries_blocked, 1);
        assert_eq!(report.bypasses_issued, 1);
        assert_eq!(report.active_sessions, 1);
        assert_eq!(report.blocklist_size, 2);
        assert_eq!(report.blocklist_employers, 2);
        assert!(report.last_blocklist_refresh.is_some());
        assert_eq!(report.top_blocked_domains[0].domain, "example.com");
        assert_eq!(report.queries_since_last_report, 2);

        let again = reporter.build_report().await;
        assert_eq!(again.total_queries, 2);
        assert_eq!(again.queries_since_last_report, 0);
    }

    #[tokio::test]
    async fn test_send_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/dns-stats/report"))
            .and(header("X-API-Key", "report-key"))
            .and(header("Content-Type", "application/json"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (reporter, collector) =
            reporter(format!("{}/dns-stats/report", server.uri())).await;
        collector.record_block("example.com");

        assert!(reporter.send_report().await);

        let received = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["instanceId"], "dns-test");
        assert_eq!(body["queriesBlocked"], 1);
        assert_eq!(body["topBlockedDomains"][0]["count"], 1);
    }

    #[tokio::test]
    async fn test_rejected_report() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (reporter, _) = reporter(format!("{}/report", server.uri())).await;
        assert!(!reporter.send_report().await);
    }

    #[tokio::test]
    async fn test_final_report_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let (reporter, _) = reporter(format!("{}/report", server.uri())).await;
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(reporter.run(Duration::from_secs(3600), rx));

        tx.send(true).unwrap();
        assert!(handle.await.unwrap().is_ok());
    }
}
