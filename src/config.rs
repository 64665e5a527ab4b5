//! Picketline DNS Configuration
//!
//! Loaded from a TOML file, then overridden by environment variables and
//! finally by CLI flags. Every section has defaults so partial files work.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Main configuration for the service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub dns: DnsConfig,
    pub api: ApiConfig,
    pub bypass: BypassConfig,
    pub stats: StatsConfig,
    pub logging: LoggingConfig,
}

/// DNS listener and forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    /// Address for both the UDP and TCP listeners
    pub listen_addr: String,

    /// Upstream resolvers, tried in order
    pub upstreams: Vec<String>,

    /// Per-upstream exchange timeout (milliseconds)
    pub query_timeout_ms: u64,

    /// Address returned in A answers for blocked domains
    pub sinkhole_ipv4: String,

    /// Address returned in AAAA answers for blocked domains
    pub sinkhole_ipv6: String,

    /// TTL of sinkhole answers (seconds)
    pub sinkhole_ttl: u32,

    /// Consult bypass sessions before sinkholing
    pub bypass_enabled: bool,
}

/// Remote blocklist API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,

    /// Sent as `X-API-Key` when non-empty
    pub api_key: String,

    /// Interval between conditional refreshes (seconds)
    pub refresh_interval_secs: u64,

    /// HTTP request timeout (seconds)
    pub timeout_secs: u64,

    /// Attempts for the first fetch after startup
    pub initial_fetch_attempts: u32,
}

/// Bypass tokens and the JSON API that issues them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BypassConfig {
    /// HTTP API listen address
    pub listen_addr: String,

    /// HMAC key for bypass tokens. Empty means a random key per process.
    pub secret: String,

    /// Lifetime of a bypass session (seconds)
    pub token_ttl_secs: u64,

    /// Interval of the expired-session sweep (seconds)
    pub cleanup_interval_secs: u64,
}

/// Optional stats reporting to the blocklist authority
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub enabled: bool,

    /// Interval between reports (seconds)
    pub report_interval_secs: u64,

    /// Identifier of this instance. Empty means hostname.
    pub instance_id: String,

    /// Report endpoint. Empty means `{api.base_url}/dns-stats/report`.
    pub report_url: String,
}

/// Log output
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error
    pub level: String,

    /// text or json
    pub format: String,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:53".to_string(),
            upstreams: vec!["8.8.8.8:53".to_string(), "8.8.4.4:53".to_string()],
            query_timeout_ms: 5_000,
            sinkhole_ipv4: Ipv4Addr::UNSPECIFIED.to_string(),
            sinkhole_ipv6: Ipv6Addr::UNSPECIFIED.to_string(),
            sinkhole_ttl: 60,
            bypass_enabled: true,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://onlinepicketline.com/api".to_string(),
            api_key: String::new(),
            refresh_interval_secs: 900, // 15 minutes
            timeout_secs: 10,
            initial_fetch_attempts: 10,
        }
    }
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            secret: String::new(),
            token_ttl_secs: 86_400, // 24 hours
            cleanup_interval_secs: 300,
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            report_interval_secs: 300,
            instance_id: String::new(),
            report_url: String::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise, then apply env overrides
    ///
    /// Runs before logging is up, so a missing file is the caller's to report.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };

        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply deployment overrides. `lookup` resolves a variable name to its value.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("DNS_LISTEN_ADDR") {
            self.dns.listen_addr = v;
        }
        if let Some(v) = var("OPL_API_BASE_URL") {
            self.api.base_url = v;
        }
        if let Some(v) = var("OPL_API_KEY") {
            self.api.api_key = v;
        }
        if let Some(v) = var("BYPASS_SECRET") {
            self.bypass.secret = v;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = var("LOG_FORMAT") {
            self.logging.format = v;
        }
        if let Some(v) = var("STATS_ENABLED") {
            if v == "true" || v == "1" {
                self.stats.enabled = true;
            }
        }
        if let Some(v) = var("STATS_INSTANCE_ID") {
            self.stats.instance_id = v;
        }
        if let Some(v) = var("STATS_REPORT_URL") {
            self.stats.report_url = v;
        }

        self
    }

    // Builder-style methods for CLI overrides

    pub fn with_dns_listen(mut self, addr: Option<String>) -> Self {
        if let Some(addr) = addr {
            self.dns.listen_addr = addr;
        }
        self
    }

    pub fn with_api_listen(mut self, addr: Option<String>) -> Self {
        if let Some(addr) = addr {
            self.bypass.listen_addr = addr;
        }
        self
    }

    pub fn with_log_level(mut self, level: Option<String>) -> Self {
        if let Some(level) = level {
            self.logging.level = level;
        }
        self
    }

    /// Validate configuration values
    pub fn validate(&self) -> anyhow::Result<()> {
        self.dns_listen_addr()?;
        self.api_listen_addr()?;

        if self.dns.upstreams.is_empty() {
            anyhow::bail!("dns.upstreams must list at least one resolver");
        }
        self.upstream_addrs()?;

        if self.dns.query_timeout_ms == 0 {
            anyhow::bail!("dns.query_timeout_ms must be greater than 0");
        }

        let ipv4 = self.dns.sinkhole_ipv4.parse::<IpAddr>().map_err(|e| {
            anyhow::anyhow!("dns.sinkhole_ipv4 ({}) is not an address: {}", self.dns.sinkhole_ipv4, e)
        })?;
        if !ipv4.is_ipv4() {
            anyhow::bail!("dns.sinkhole_ipv4 ({}) must be an IPv4 address", ipv4);
        }

        let ipv6 = self.dns.sinkhole_ipv6.parse::<IpAddr>().map_err(|e| {
            anyhow::anyhow!("dns.sinkhole_ipv6 ({}) is not an address: {}", self.dns.sinkhole_ipv6, e)
        })?;
        if !ipv6.is_ipv6() {
            anyhow::bail!("dns.sinkhole_ipv6 ({}) must be an IPv6 address", ipv6);
        }

        if self.api.base_url.is_empty() {
            anyhow::bail!("api.base_url is required");
        }
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            anyhow::bail!("api.base_url ({}) must start with http:// or https://", self.api.base_url);
        }
        if self.api.refresh_interval_secs == 0 {
            anyhow::bail!("api.refresh_interval_secs must be greater than 0");
        }
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs must be greater than 0");
        }

        if self.bypass.token_ttl_secs == 0 {
            anyhow::bail!("bypass.token_ttl_secs must be greater than 0");
        }
        if self.bypass.cleanup_interval_secs == 0 {
            anyhow::bail!("bypass.cleanup_interval_secs must be greater than 0");
        }

        if self.stats.enabled && self.stats.report_interval_secs == 0 {
            anyhow::bail!("stats.report_interval_secs must be greater than 0");
        }

        Ok(())
    }

    // Typed accessors, valid after `validate`

    pub fn dns_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.dns.listen_addr.parse().map_err(|e| {
            anyhow::anyhow!("dns.listen_addr ({}) is invalid: {}", self.dns.listen_addr, e)
        })
    }

    pub fn api_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bypass.listen_addr.parse().map_err(|e| {
            anyhow::anyhow!("bypass.listen_addr ({}) is invalid: {}", self.bypass.listen_addr, e)
        })
    }

    pub fn upstream_addrs(&self) -> anyhow::Result<Vec<SocketAddr>> {
        self.dns
            .upstreams
            .iter()
            .map(|u| {
                u.parse::<SocketAddr>()
                    .map_err(|e| anyhow::anyhow!("dns.upstreams entry {} is invalid: {}", u, e))
            })
            .collect()
    }

    pub fn sinkhole_ipv4(&self) -> Ipv4Addr {
        self.dns.sinkhole_ipv4.parse().unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    pub fn sinkhole_ipv6(&self) -> Ipv6Addr {
        self.dns.sinkhole_ipv6.parse().unwrap_or(Ipv6Addr::UNSPECIFIED)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.dns.query_timeout_ms)
    }

    /// Report endpoint, derived from the API base when not set
    pub fn stats_report_url(&self) -> String {
        if self.stats.report_url.is_empty() {
            format!("{}/dns-stats/report", self.api.base_url.trim_end_matches('/'))
        } else {
            self.stats.report_url.clone()
        }
    }

    /// Instance identifier, falling back to the hostname
    pub fn stats_instance_id(&self) -> String {
        if !self.stats.instance_id.is_empty() {
            return self.stats.instance_id.clone();
        }
        std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "picketline-dns-unknown".to_string())
    }
}
