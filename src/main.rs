// Token validation, revocation and cache introspection are exercised by tests, not the binary
#![allow(dead_code)]

//! Picketline DNS
//!
//! A DNS responder that honors picket lines: domains of employers involved in
//! an active labor action resolve to a sinkhole, so the browser lands on an
//! explanation instead of the site. Users who still want through can request
//! a bypass for their address and that domain.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      PICKETLINE DNS                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Blocklist Client   ←── Conditional fetch + periodic refresh│
//! │  DNS Server (53)    ←── Sinkhole or forward upstream        │
//! │  Session Store      ←── HMAC-signed bypass tokens           │
//! │  Bypass API (8080)  ←── check / bypass / health / metrics   │
//! │  Stats Reporter     ←── Optional POST of usage counters     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

mod api;
mod blocklist;
mod config;
mod dns;
mod session;
mod stats;
mod types;

use api::PicketService;
use blocklist::BlocklistClient;
use config::{AppConfig, LoggingConfig};
use dns::{Forwarder, QueryHandler, Sinkhole};
use session::SessionStore;
use stats::{StatsCollector, StatsReporter};

/// Picketline DNS - labor-action aware DNS responder
#[derive(Parser, Debug)]
#[command(name = "picketline-dns")]
#[command(version)]
#[command(about = "DNS responder that sinkholes domains on an active picket line", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "picketline-dns.toml")]
    config: PathBuf,

    /// DNS listen address, overrides dns.listen_addr
    #[arg(short, long)]
    listen: Option<String>,

    /// Bypass API listen address, overrides bypass.listen_addr
    #[arg(long)]
    api_listen: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Write a default configuration to this path and exit
    #[arg(long)]
    generate_config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(path) = &args.generate_config {
        return generate_config(path);
    }

    let config_found = args.config.exists();
    let mut config = AppConfig::load_or_default(&args.config)?
        .with_dns_listen(args.listen)
        .with_api_listen(args.api_listen)
        .with_log_level(args.log_level);

    init_logging(&config.logging);

    info!("🌐 Picketline DNS v{}", env!("CARGO_PKG_VERSION"));
    if !config_found {
        warn!("Config file {:?} not found, using defaults", args.config);
    }

    config.validate()?;

    if config.bypass.secret.is_empty() {
        warn!("⚠️  bypass.secret is empty; generated a random secret, tokens will not survive a restart");
        config.bypass.secret = random_secret()?;
    }

    info!("⚙️  Configuration:");
    info!("   DNS listen: {}", config.dns.listen_addr);
    info!("   Upstreams: {}", config.dns.upstreams.join(", "));
    info!("   Blocklist API: {}", config.api.base_url);
    info!("   Bypass API listen: {}", config.bypass.listen_addr);
    info!("   Bypass enabled: {}", config.dns.bypass_enabled);
    info!("   Stats reporting: {}", config.stats.enabled);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Shared state
    let blocklist = Arc::new(BlocklistClient::new(
        &config.api.base_url,
        &config.api.api_key,
        Duration::from_secs(config.api.timeout_secs),
    )?);
    let sessions = Arc::new(SessionStore::new(
        config.bypass.secret.as_bytes(),
        Duration::from_secs(config.bypass.token_ttl_secs),
    )?);
    let stats = Arc::new(StatsCollector::new());

    let handler = Arc::new(QueryHandler::new(
        Arc::clone(&blocklist),
        config.dns.bypass_enabled.then(|| Arc::clone(&sessions)),
        Arc::clone(&stats),
        Forwarder::from_addrs(&config.upstream_addrs()?, config.query_timeout()),
        Sinkhole {
            ipv4: config.sinkhole_ipv4(),
            ipv6: config.sinkhole_ipv6(),
            ttl: config.dns.sinkhole_ttl,
        },
    ));

    let service = Arc::new(PicketService::new(
        Arc::clone(&blocklist),
        Arc::clone(&sessions),
        Arc::clone(&stats),
        config.dns.bypass_enabled,
    ));

    // Start all services concurrently
    let mut dns_handle = tokio::spawn(dns::run_dns_server(
        config.dns_listen_addr()?,
        handler,
        shutdown_rx.clone(),
    ));

    let mut api_handle = tokio::spawn(api::run_api_server(
        config.api_listen_addr()?,
        service,
        shutdown_rx.clone(),
    ));

    let refresh_handle = tokio::spawn(blocklist::run_periodic_refresh(
        Arc::clone(&blocklist),
        Duration::from_secs(config.api.refresh_interval_secs),
        config.api.initial_fetch_attempts,
        shutdown_rx.clone(),
    ));

    let cleanup_handle = tokio::spawn(session::run_periodic_cleanup(
        Arc::clone(&sessions),
        Duration::from_secs(config.bypass.cleanup_interval_secs),
        shutdown_rx.clone(),
    ));

    let reporter_handle = if config.stats.enabled {
        let reporter = StatsReporter::new(
            Arc::clone(&stats),
            Arc::clone(&blocklist),
            Some(Arc::clone(&sessions)),
            config.stats_report_url(),
            config.api.api_key.clone(),
            config.stats_instance_id(),
        )?;
        info!("📊 Reporting stats to {} every {}s", config.stats_report_url(), config.stats.report_interval_secs);
        Some(tokio::spawn(reporter.run(
            Duration::from_secs(config.stats.report_interval_secs),
            shutdown_rx.clone(),
        )))
    } else {
        None
    };

    info!("✅ All services started");
    info!("   Press Ctrl+C to shutdown gracefully");

    // Wait for shutdown signal or a listener dying
    let mut dns_done = false;
    let mut api_done = false;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("🛑 Shutdown signal received");
        }
        result = &mut dns_handle => {
            dns_done = true;
            error!("DNS server exited: {:?}", result);
        }
        result = &mut api_handle => {
            api_done = true;
            error!("Bypass API exited: {:?}", result);
        }
    }

    let _ = shutdown_tx.send(true);

    if !dns_done {
        log_task_exit("DNS server", dns_handle.await);
    }
    if !api_done {
        log_task_exit("Bypass API", api_handle.await);
    }
    log_task_exit("Blocklist refresh", refresh_handle.await);
    log_task_exit("Session cleanup", cleanup_handle.await);
    if let Some(handle) = reporter_handle {
        log_task_exit("Stats reporter", handle.await);
    }

    info!("👋 Picketline DNS shutting down");
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.clone().into());

    if logging.format == "json" {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn log_task_exit(name: &str, result: Result<anyhow::Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{} failed: {:#}", name, e),
        Err(e) => error!("{} panicked: {}", name, e),
    }
}

/// 32 random bytes, hex encoded
fn random_secret() -> anyhow::Result<String> {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| anyhow::anyhow!("failed to generate bypass secret: {}", e))?;
    Ok(hex::encode(bytes))
}

/// Write the default configuration for editing
fn generate_config(path: &Path) -> anyhow::Result<()> {
    AppConfig::default().save(path)?;
    println!("Default configuration written to {}", path.display());
    Ok(())
}
