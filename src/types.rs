//! Core types shared by the DNS responder, the bypass session store and the API
//!
//! The blocklist types mirror the documents published by the remote dispute
//! authority. Everything here is plain data: built once per fetch, never
//! mutated afterwards.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Helper module for the `demands` field, which older documents publish as a
/// list of strings and newer ones as free text
mod demands_serde {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Demands {
        Text(String),
        List(Vec<String>),
        Missing(Option<()>),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<String, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match Demands::deserialize(deserializer)? {
            Demands::Text(text) => text,
            Demands::List(items) => items.join("\n"),
            Demands::Missing(_) => String::new(),
        })
    }
}

// =============================================================================
// BLOCKLIST DATA
// =============================================================================

/// Details of the labor action behind a blocklist entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionDetails {
    pub id: String,
    pub organization: String,
    pub action_type: String,
    pub status: String,
    pub start_date: String,
    pub description: String,

    #[serde(deserialize_with = "demands_serde::deserialize")]
    pub demands: String,

    pub location: String,
    pub contact_info: String,
    pub union_logo_url: String,
    pub learn_more_url: String,
}

/// One disputed URL pattern and the metadata of the action behind it
///
/// Identity is `domain`, the lowercased hostname extracted from `url`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlocklistEntry {
    /// URL pattern as published
    pub url: String,

    /// Normalized hostname extracted from `url`
    pub domain: String,

    /// Employer name
    pub employer: String,

    /// Employer identifier (the action id in the employer-keyed format)
    pub employer_id: String,

    pub label: String,
    pub category: String,

    /// Short reason, usually the action type
    pub reason: String,

    pub start_date: String,
    pub more_info_url: String,

    /// Free-text location of the action
    pub location: String,

    pub action_details: ActionDetails,
}

/// Employer summary derived from a fetched document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Employer {
    pub id: String,
    pub name: String,
    pub url_count: usize,
}

/// Human-readable dispute record for a blocked domain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedDomainInfo {
    pub domain: String,
    pub employer: String,
    pub action_type: String,
    pub description: String,
    pub demands: String,
    pub more_info_url: String,
    pub organization: String,
    pub start_date: String,
    pub location: String,
}

impl BlockedDomainInfo {
    /// Project a blocklist entry onto the record shown to users
    pub fn from_entry(domain: &str, entry: &BlocklistEntry) -> Self {
        Self {
            domain: domain.to_string(),
            employer: entry.employer.clone(),
            action_type: entry.action_details.action_type.clone(),
            description: entry.action_details.description.clone(),
            demands: entry.action_details.demands.clone(),
            more_info_url: entry.more_info_url.clone(),
            organization: entry.action_details.organization.clone(),
            start_date: entry.action_details.start_date.clone(),
            location: entry.location.clone(),
        }
    }
}

// =============================================================================
// STATS REPORTING
// =============================================================================

/// A domain and how many times it was blocked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: u64,
}

/// Payload posted to the stats sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub instance_id: String,
    pub version: String,

    /// Seconds since start
    pub uptime: u64,

    pub total_queries: u64,
    pub queries_blocked: u64,
    pub queries_forwarded: u64,
    pub bypasses_issued: u64,
    pub active_sessions: usize,
    pub blocklist_size: usize,
    pub blocklist_employers: usize,

    /// RFC 3339 time of the last successful blocklist fetch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_blocklist_refresh: Option<String>,

    pub top_blocked_domains: Vec<DomainCount>,

    // Deltas since the previous report
    pub queries_since_last_report: u64,
    pub blocked_since_last_report: u64,
    pub forwarded_since_last_report: u64,
    pub bypasses_since_last_report: u64,
}

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Lowercase a domain and strip one trailing dot
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim().to_lowercase();
    match domain.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => domain,
    }
}

/// Strip a port from a client address (`1.2.3.4:5678`, `[::1]:53`)
///
/// Parseable addresses come back in canonical text form with IPv4-mapped
/// IPv6 folded to IPv4; anything else is returned trimmed.
pub fn normalize_ip(ip: &str) -> String {
    let ip = ip.trim();
    if let Ok(addr) = ip.parse::<SocketAddr>() {
        return canonical_ip(addr.ip()).to_string();
    }
    let ip = ip.trim_start_matches('[').trim_end_matches(']');
    match ip.parse::<IpAddr>() {
        Ok(addr) => canonical_ip(addr).to_string(),
        Err(_) => ip.to_string(),
    }
}

/// Fold IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to plain IPv4
pub fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}
