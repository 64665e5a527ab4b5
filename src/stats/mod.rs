//! Stats Module
//!
//! Counts queries, blocks and bypasses for `/metrics` and for the optional
//! periodic report to the dispute authority.

mod collector;
mod reporter;

pub use collector::{prometheus_metric, CounterSnapshot, StatsCollector};
pub use reporter::StatsReporter;
