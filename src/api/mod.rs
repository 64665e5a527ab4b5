//! HTTP API Module
//!
//! JSON endpoints a block page or browser extension uses to check a domain
//! and obtain a bypass, plus health and metrics for operators.

mod routes;
mod service;

pub use routes::{router, run_api_server};
pub use service::{BypassGrant, BypassResponse, CheckResponse, HealthResponse, PicketService, ServiceError};
