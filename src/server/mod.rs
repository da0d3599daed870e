//! HTTP server
//!
//! - `/resources/...` - deployment updates, status, rollback, object creation
//! - `/healthz`, `/readyz` - Kubernetes probes
//! - `/metrics` - Prometheus scrape endpoint

pub mod credentials;
mod error;
mod health;
pub mod metrics;
mod routes;

pub use error::ApiError;
pub use health::ReadinessState;
pub use metrics::{create_metrics, Metrics, SharedMetrics};
pub use routes::{build_router, most_seen_status, run_server, AppState, CANCELLED_MESSAGE};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "routes_test.rs"]
mod routes_tests;
