//! Prometheus metrics for updates and cluster connections
//!
//! - `kdi_updates_total{strategy,outcome}` - completed update requests
//! - `kdi_update_duration_seconds{strategy}` - time spent in the updater
//! - `kdi_cluster_connections_total{kind,outcome}` - connector results

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

pub type SharedMetrics = Arc<Metrics>;

pub struct Metrics {
    registry: Registry,
    updates_total: IntCounterVec,
    update_duration_seconds: HistogramVec,
    cluster_connections_total: IntCounterVec,
}

/// Create the registry and register every collector
pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    let registry = Registry::new();

    let updates_total = IntCounterVec::new(
        Opts::new("kdi_updates_total", "Deployment update requests by strategy and outcome"),
        &["strategy", "outcome"],
    )?;
    let update_duration_seconds = HistogramVec::new(
        HistogramOpts::new(
            "kdi_update_duration_seconds",
            "Time spent applying a deployment update",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
        &["strategy"],
    )?;
    let cluster_connections_total = IntCounterVec::new(
        Opts::new(
            "kdi_cluster_connections_total",
            "Cluster connection attempts by cluster kind and outcome",
        ),
        &["kind", "outcome"],
    )?;

    registry.register(Box::new(updates_total.clone()))?;
    registry.register(Box::new(update_duration_seconds.clone()))?;
    registry.register(Box::new(cluster_connections_total.clone()))?;

    Ok(Arc::new(Metrics {
        registry,
        updates_total,
        update_duration_seconds,
        cluster_connections_total,
    }))
}

impl Metrics {
    pub fn record_update_success(&self, strategy: &str, duration_secs: f64) {
        self.updates_total.with_label_values(&[strategy, "success"]).inc();
        self.update_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    pub fn record_update_error(&self, strategy: &str, duration_secs: f64) {
        self.updates_total.with_label_values(&[strategy, "error"]).inc();
        self.update_duration_seconds
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    /// `outcome` is one of `success`, `error`, `cancelled`
    pub fn record_connection(&self, kind: &str, outcome: &str) {
        self.cluster_connections_total
            .with_label_values(&[kind, outcome])
            .inc();
    }

    /// Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
