//! # Prometheus Metrics
//!
//! Operational metrics for the node, scraped at `/metrics` on the metrics
//! port. Everything lives in a dedicated [`prometheus::Registry`] with the
//! `tessera` prefix.
//!
//! Storage counters are fed by [`MetricsListener`], a [`DataListener`]
//! registered on the data service, so they count items from peers as well
//! as our own.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

use tessera_network::{BroadcastResult, DataListener, DistributedDataItem};

/// Metric handles for the node. Cheap to clone.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    /// Live items across all kinds.
    pub items_stored: IntGauge,
    pub items_added_total: IntCounter,
    /// Removals, evictions and expiries together.
    pub items_removed_total: IntCounter,
    pub connected_peers: IntGauge,
    pub broadcast_success_total: IntCounter,
    pub broadcast_failure_total: IntCounter,
    /// Time to authorize, store and broadcast one local publish.
    pub publish_latency_seconds: Histogram,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("tessera".into()), None)?;

        let items_stored = IntGauge::new("items_stored", "Live data items held by this node")?;
        registry.register(Box::new(items_stored.clone()))?;

        let items_added_total =
            IntCounter::new("items_added_total", "Data items stored since startup")?;
        registry.register(Box::new(items_added_total.clone()))?;

        let items_removed_total = IntCounter::new(
            "items_removed_total",
            "Data items removed, evicted or expired since startup",
        )?;
        registry.register(Box::new(items_removed_total.clone()))?;

        let connected_peers =
            IntGauge::new("connected_peers", "Connections in the peer group")?;
        registry.register(Box::new(connected_peers.clone()))?;

        let broadcast_success_total = IntCounter::new(
            "broadcast_success_total",
            "Per-peer sends that succeeded in local broadcasts",
        )?;
        registry.register(Box::new(broadcast_success_total.clone()))?;

        let broadcast_failure_total = IntCounter::new(
            "broadcast_failure_total",
            "Per-peer sends that failed in local broadcasts",
        )?;
        registry.register(Box::new(broadcast_failure_total.clone()))?;

        let publish_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "publish_latency_seconds",
                "Latency of publishing one item, proof of work included",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        registry.register(Box::new(publish_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            items_stored,
            items_added_total,
            items_removed_total,
            connected_peers,
            broadcast_success_total,
            broadcast_failure_total,
            publish_latency_seconds,
        })
    }

    pub fn record_broadcast(&self, result: &BroadcastResult) {
        self.broadcast_success_total
            .inc_by(result.num_success() as u64);
        self.broadcast_failure_total
            .inc_by(result.num_failure() as u64);
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<NodeMetrics>;

/// Keeps the storage metrics in step with the data service.
pub struct MetricsListener {
    metrics: SharedMetrics,
}

impl MetricsListener {
    pub fn new(metrics: SharedMetrics) -> Self {
        Self { metrics }
    }
}

impl DataListener for MetricsListener {
    fn on_data_added(&self, _item: &DistributedDataItem) {
        self.metrics.items_added_total.inc();
        self.metrics.items_stored.inc();
    }

    fn on_data_removed(&self, _item: &DistributedDataItem) {
        self.metrics.items_removed_total.inc();
        self.metrics.items_stored.dec();
    }
}

/// Renders `/metrics` in Prometheus text format.
pub async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<SharedMetrics>,
) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
