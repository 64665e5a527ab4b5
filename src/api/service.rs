//! Bypass service facade
//!
//! Everything the HTTP layer needs, expressed without HTTP types.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::blocklist::BlocklistClient;
use crate::session::{SessionError, SessionStore};
use crate::stats::{prometheus_metric, StatsCollector};
use crate::types::{normalize_domain, BlockedDomainInfo};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("domain is required")]
    MissingDomain,

    #[error("domain is not a valid hostname")]
    InvalidDomain,

    #[error("domain is not blocked")]
    NotBlocked,

    #[error("bypass is disabled")]
    BypassDisabled,

    #[error("session error: {0}")]
    Session(#[from] SessionError),
}

impl ServiceError {
    /// Message safe to hand back to the requesting browser
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::MissingDomain => "Domain is required",
            Self::InvalidDomain => "Domain is not a valid hostname",
            Self::NotBlocked => "Domain is not blocked",
            Self::BypassDisabled => "Bypass is disabled on this resolver",
            Self::Session(_) => "Failed to create bypass token",
        }
    }
}

/// Answer for `/api/check`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub blocked: bool,
    pub has_bypass: bool,
    pub domain: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub more_info_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
}

/// A freshly issued bypass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BypassGrant {
    pub domain: String,
    pub token: String,
    pub redirect_url: String,
    pub expires_in: u64,
}

/// Body of `/api/bypass` replies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BypassResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl BypassResponse {
    pub fn granted(grant: BypassGrant) -> Self {
        Self {
            success: true,
            token: Some(grant.token),
            redirect_url: Some(grant.redirect_url),
            expires_in: Some(grant.expires_in),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub blocklist_loaded: bool,
    pub active_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_blocklist_fetch: Option<String>,
}

pub struct PicketService {
    blocklist: Arc<BlocklistClient>,
    sessions: Arc<SessionStore>,
    stats: Arc<StatsCollector>,
    bypass_enabled: bool,
}

impl PicketService {
    pub fn new(
        blocklist: Arc<BlocklistClient>,
        sessions: Arc<SessionStore>,
        stats: Arc<StatsCollector>,
        bypass_enabled: bool,
    ) -> Self {
        Self {
            blocklist,
            sessions,
            stats,
            bypass_enabled,
        }
    }

    /// Is `domain` blocked, and does `client_ip` already hold a bypass for it
    pub async fn check(&self, client_ip: &str, domain: &str) -> Result<CheckResponse, ServiceError> {
        let domain = required_domain(domain)?;

        let Some(entry) = self.blocklist.lookup(&domain).await else {
            return Ok(CheckResponse {
                blocked: false,
                has_bypass: false,
                domain,
                employer: None,
                action_type: None,
                description: None,
                more_info_url: None,
                organization: None,
            });
        };

        let has_bypass = self.has_bypass(client_ip, &domain).await;
        let details = &entry.action_details;

        Ok(CheckResponse {
            blocked: true,
            has_bypass,
            employer: non_empty(&entry.employer),
            action_type: non_empty(&details.action_type),
            description: non_empty(&details.description),
            more_info_url: non_empty(&entry.more_info_url),
            organization: non_empty(&details.organization),
            domain,
        })
    }

    /// Issue a bypass for a blocked domain and count it
    pub async fn create_bypass(&self, client_ip: &str, domain: &str) -> Result<BypassGrant, ServiceError> {
        let domain = required_domain(domain)?;

        if !self.bypass_enabled {
            return Err(ServiceError::BypassDisabled);
        }
        if self.blocklist.lookup(&domain).await.is_none() {
            return Err(ServiceError::NotBlocked);
        }

        let token = self.sessions.create_token(client_ip, &domain).await.map_err(|e| {
            error!("Failed to create bypass token for {}: {}", domain, e);
            e
        })?;

        self.stats.record_bypass();
        info!("🔓 Bypass issued for {} -> {}", client_ip, domain);

        Ok(BypassGrant {
            redirect_url: format!("https://{}", domain),
            expires_in: self.sessions.ttl().as_secs(),
            domain,
            token,
        })
    }

    pub async fn has_bypass(&self, client_ip: &str, domain: &str) -> bool {
        self.bypass_enabled && self.sessions.has_bypass(client_ip, domain).await
    }

    /// Full dispute record, `None` when the domain is not blocked
    pub async fn info(&self, domain: &str) -> Result<Option<BlockedDomainInfo>, ServiceError> {
        let domain = required_domain(domain)?;
        Ok(self
            .blocklist
            .lookup(&domain)
            .await
            .map(|entry| BlockedDomainInfo::from_entry(&domain, &entry)))
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse {
            status: "ok".to_string(),
            blocklist_loaded: self.blocklist.is_loaded().await,
            active_sessions: self.sessions.active_count().await,
            last_blocklist_fetch: self
                .blocklist
                .last_fetch_time()
                .await
                .map(|t| t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)),
        }
    }

    /// Prometheus text for the counters plus live gauges
    pub async fn prometheus_metrics(&self) -> String {
        let mut output = self.stats.to_prometheus();

        output.push_str(&prometheus_metric(
            "picketline_active_sessions",
            "Bypass sessions currently held",
            "gauge",
            self.sessions.active_count().await as u64,
        ));
        output.push_str(&prometheus_metric(
            "picketline_blocklist_domains",
            "Domains in the loaded blocklist",
            "gauge",
            self.blocklist_domains().await as u64,
        ));
        output.push_str(&prometheus_metric(
            "picketline_blocklist_fetch_failures_total",
            "Failed blocklist fetches",
            "counter",
            self.blocklist.fetch_failures(),
        ));

        output
    }

    pub async fn json_metrics(&self) -> serde_json::Value {
        let mut metrics = self.stats.to_json();
        metrics["active_sessions"] = self.sessions.active_count().await.into();
        metrics["blocklist"] = serde_json::json!({
            "loaded": self.blocklist.is_loaded().await,
            "domains": self.blocklist_domains().await,
            "fetch_failures": self.blocklist.fetch_failures(),
            "last_error": self.blocklist.last_error().await,
        });
        metrics
    }

    async fn blocklist_domains(&self) -> usize {
        self.blocklist
            .cached_snapshot()
            .await
            .map_or(0, |snapshot| snapshot.domain_count())
    }
}

/// Normalized hostname, refused before it reaches a lookup, a session or a header
fn required_domain(domain: &str) -> Result<String, ServiceError> {
    let domain = normalize_domain(domain);
    if domain.is_empty() {
        return Err(ServiceError::MissingDomain);
    }
    if !is_hostname(&domain) {
        return Err(ServiceError::InvalidDomain);
    }
    Ok(domain)
}

/// Lowercase LDH labels (underscore allowed), none empty, at most 253 bytes
fn is_hostname(domain: &str) -> bool {
    domain.len() <= 253
        && domain.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
        })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
