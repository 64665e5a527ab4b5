//! DNS Server Module
//!
//! Answers address queries for disputed domains with a sinkhole and forwards
//! everything else to the configured upstream resolvers.
//!
//! - `wire`: packet parsing and synthesized replies
//! - `upstream`: ordered upstream exchange (UDP, TCP on truncation)
//! - `handler`: per-query block/forward decision
//! - `server`: UDP and TCP listeners

mod handler;
mod server;
pub mod upstream;
pub mod wire;

pub use handler::{Disposition, HandledQuery, QueryHandler, Sinkhole};
pub use server::run_dns_server;
pub use upstream::Forwarder;
