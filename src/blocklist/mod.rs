//! Blocklist Module
//!
//! Keeps the freshest affordable copy of which domains are disputed and why.
//!
//! - `parser`: turns either published document shape into entries
//! - `snapshot`: immutable entry set with an O(1) domain map and parent-domain lookup
//! - `client`: conditional fetch against the remote API, cache and refresh loop
//!
//! A failed fetch never clears the cache: the last good snapshot stays
//! authoritative until a newer one is published.

pub mod client;
pub mod parser;
pub mod snapshot;

pub use client::{run_periodic_refresh, BlocklistClient, FetchOutcome};
pub use snapshot::BlocklistSnapshot;

/// Errors raised while fetching or parsing the blocklist
#[derive(Debug, thiserror::Error)]
pub enum BlocklistError {
    #[error("failed to create HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("blocklist API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid blocklist JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unsupported blocklist document shape")]
    UnsupportedShape,

    #[error("parse task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
