//! Query statistics
//!
//! Lock-free counters on the query path; the per-domain tally sits behind a
//! short `Mutex` taken only when a query is blocked.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::types::DomainCount;

/// Counter values at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub total_queries: u64,
    pub queries_blocked: u64,
    pub queries_forwarded: u64,
    pub bypasses_issued: u64,
}

/// Collects query, block and bypass counts
pub struct StatsCollector {
    /// Start time for uptime calculation
    start_time: Instant,

    total_queries: AtomicU64,
    queries_blocked: AtomicU64,
    queries_forwarded: AtomicU64,
    bypasses_issued: AtomicU64,

    /// Blocks per domain
    blocked_domains: Mutex<HashMap<String, u64>>,

    // Baseline of the previous report
    last_queries: AtomicU64,
    last_blocked: AtomicU64,
    last_forwarded: AtomicU64,
    last_bypasses: AtomicU64,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_queries: AtomicU64::new(0),
            queries_blocked: AtomicU64::new(0),
            queries_forwarded: AtomicU64::new(0),
            bypasses_issued: AtomicU64::new(0),
            blocked_domains: Mutex::new(HashMap::new()),
            last_queries: AtomicU64::new(0),
            last_blocked: AtomicU64::new(0),
            last_forwarded: AtomicU64::new(0),
            last_bypasses: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Record a query forwarded upstream
    pub fn record_query(&self) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.queries_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a sinkholed query
    pub fn record_block(&self, domain: &str) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.queries_blocked.fetch_add(1, Ordering::Relaxed);

        let mut tally = self
            .blocked_domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *tally.entry(domain.to_string()).or_insert(0) += 1;
    }

    /// Record a bypass token being issued
    pub fn record_bypass(&self) {
        self.bypasses_issued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            total_queries: self.total_queries.load(Ordering::Relaxed),
            queries_blocked: self.queries_blocked.load(Ordering::Relaxed),
            queries_forwarded: self.queries_forwarded.load(Ordering::Relaxed),
            bypasses_issued: self.bypasses_issued.load(Ordering::Relaxed),
        }
    }

    /// Most blocked domains, highest count first, ties by name
    pub fn top_blocked_domains(&self, n: usize) -> Vec<DomainCount> {
        let tally = self
            .blocked_domains
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut domains: Vec<DomainCount> = tally
            .iter()
            .map(|(domain, count)| DomainCount {
                domain: domain.clone(),
                count: *count,
            })
            .collect();
        drop(tally);

        domains.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.domain.cmp(&b.domain)));
        domains.truncate(n);
        domains
    }

    /// Counts since the previous call; moves the baseline forward
    pub fn compute_deltas(&self) -> CounterSnapshot {
        self.snapshot_with_deltas().1
    }

    /// Totals and the deltas derived from that same read of the counters
    pub fn snapshot_with_deltas(&self) -> (CounterSnapshot, CounterSnapshot) {
        let now = self.snapshot();
        let deltas = CounterSnapshot {
            total_queries: delta(&self.last_queries, now.total_queries),
            queries_blocked: delta(&self.last_blocked, now.queries_blocked),
            queries_forwarded: delta(&self.last_forwarded, now.queries_forwarded),
            bypasses_issued: delta(&self.last_bypasses, now.bypasses_issued),
        };
        (now, deltas)
    }

    /// Export counters in Prometheus format
    pub fn to_prometheus(&self) -> String {
        let counters = self.snapshot();
        let mut output = String::new();

        output.push_str(&prometheus_metric(
            "picketline_uptime_seconds",
            "Responder uptime in seconds",
            "gauge",
            self.uptime().as_secs(),
        ));
        output.push_str(&prometheus_metric(
            "picketline_dns_queries_total",
            "DNS queries handled",
            "counter",
            counters.total_queries,
        ));
        output.push_str(&prometheus_metric(
            "picketline_dns_queries_blocked_total",
            "DNS queries answered with the sinkhole",
            "counter",
            counters.queries_blocked,
        ));
        output.push_str(&prometheus_metric(
            "picketline_dns_queries_forwarded_total",
            "DNS queries forwarded upstream",
            "counter",
            counters.queries_forwarded,
        ));
        output.push_str(&prometheus_metric(
            "picketline_bypasses_issued_total",
            "Bypass tokens issued",
            "counter",
            counters.bypasses_issued,
        ));

        output
    }

    /// Export counters as JSON
    pub fn to_json(&self) -> serde_json::Value {
        let counters = self.snapshot();
        serde_json::json!({
            "uptime_secs": self.uptime().as_secs(),
            "queries": {
                "total": counters.total_queries,
                "blocked": counters.queries_blocked,
                "forwarded": counters.queries_forwarded,
            },
            "bypasses_issued": counters.bypasses_issued,
            "top_blocked_domains": self.top_blocked_domains(10),
        })
    }
}

fn delta(baseline: &AtomicU64, current: u64) -> u64 {
    current.saturating_sub(baseline.swap(current, Ordering::Relaxed))
}

/// One metric in Prometheus text format
pub fn prometheus_metric(name: &str, help: &str, kind: &str, value: u64) -> String {
    format!("# HELP {name} {help}\n# TYPE {name} {kind}\n{name} {value}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters() {
        let stats = StatsCollector::new();

        stats.record_query();
        stats.record_query();
        stats.record_block("example.com");
        stats.record_bypass();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total_queries, 3);
        assert_eq!(snapshot.queries_forwarded, 2);
        assert_eq!(snapshot.queries_blocked, 1);
        assert_eq!(snapshot.bypasses_issued, 1);
    }

    #[test]
    fn test_top_blocked_domains() {
        let stats = StatsCollector::new();
        for _ in 0..3 {
            stats.record_block("a.example");
        }
        stats.record_block("c.example");
        stats.record_block("b.example");

        let top = stats.top_blocked_domains(2);
        assert_eq!(top.len(), 2);
        assert_eq!(top[0], DomainCount { domain: "a.example".to_string(), count: 3 });
        assert_eq!(top[1].domain, "b.example");

        assert!(stats.top_blocked_domains(0).is_empty());
    }

    #[test]
    fn test_deltas_move_baseline() {
        let stats = StatsCollector::new();
        stats.record_query();
        stats.record_block("example.com");

        let first = stats.compute_deltas();
        assert_eq!(first.total_queries, 2);
        assert_eq!(first.queries_blocked, 1);

        stats.record_query();
        let second = stats.compute_deltas();
        assert_eq!(second.total_queries, 1);
        assert_eq!(second.queries_blocked, 0);
        assert_eq!(second.queries_forwarded, 1);

        assert_eq!(stats.compute_deltas(), CounterSnapshot::default());
        assert_eq!(stats.snapshot().total_queries, 3);
    }

    #[test]
    fn test_totals_and_deltas_share_one_read() {
        let stats = StatsCollector::new();
        stats.record_query();
        stats.compute_deltas();

        stats.record_block("example.com");
        stats.record_query();

        let (totals, deltas) = stats.snapshot_with_deltas();
        assert_eq!(totals.total_queries, 3);
        assert_eq!(deltas.total_queries, 2);
        assert_eq!(totals.total_queries - deltas.total_queries, 1);
        assert_eq!(stats.compute_deltas(), CounterSnapshot::default());
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = Arc::new(StatsCollector::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let stats = Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.record_query();
                        stats.record_block("example.com");
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(stats.snapshot().total_queries, 16_000);
        assert_eq!(stats.top_blocked_domains(1)[0].count, 8_000);
    }

    #[test]
    fn test_prometheus_format() {
        let stats = StatsCollector::new();
        stats.record_block("example.com");

        let output = stats.to_prometheus();
        assert!(output.contains("# TYPE picketline_dns_queries_blocked_total counter"));
        assert!(output.contains("picketline_dns_queries_blocked_total 1"));
        assert!(output.contains("picketline_dns_queries_total 1"));
    }

    #[test]
    fn test_json_format() {
        let stats = StatsCollector::new();
        stats.record_query();
        stats.record_block("example.com");

        let json = stats.to_json();
        assert_eq!(json["queries"]["forwarded"], 1);
        assert_eq!(json["top_blocked_domains"][0]["domain"], "example.com");
    }
}
