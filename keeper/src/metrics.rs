//! # Prometheus Metrics
//!
//! Exposes operational metrics for the keeper daemon. Scraped by Prometheus
//! at the `/metrics` endpoint on the read API listener.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] under
//! the `cairn` namespace so they do not collide with any default global
//! registry consumers.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use cairn_gateways::{Engine, EngineStatus, VaultOverview};
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the keeper.
///
/// Clone-friendly (wraps `Arc` internally via prometheus handles) so it can
/// be shared across request handlers and background tasks.
#[derive(Clone)]
pub struct KeeperMetrics {
    /// Prometheus registry that owns all metrics below.
    registry: Registry,
    /// Total number of batches opened by the batch-cycle loop.
    pub batches_opened_total: IntCounter,
    /// Total number of batches closed by the batch-cycle loop.
    pub batches_closed_total: IntCounter,
    /// Total number of batches settled through executed proposals.
    pub batches_settled_total: IntCounter,
    /// Total number of settlement proposals submitted.
    pub proposals_submitted_total: IntCounter,
    /// Total number of settlement proposals executed.
    pub proposals_executed_total: IntCounter,
    /// Total number of settlement proposals cancelled.
    pub proposals_cancelled_total: IntCounter,
    /// Total number of institutional mints driven by this keeper.
    pub mints_total: IntCounter,
    /// Total number of redeem requests driven by this keeper.
    pub redeems_total: IntCounter,
    /// Total number of settled requests claimed by this keeper.
    pub claims_total: IntCounter,
    /// Number of settlement proposals currently awaiting execution.
    pub open_proposals: IntGauge,
    /// Sum of unsettled custody deposits across all vaults (token units).
    pub virtual_deposited: IntGauge,
    /// Sum of unsettled withdrawal requests across all vaults (token units).
    pub virtual_requested: IntGauge,
    /// Histogram of settlement execution latency in seconds.
    pub settlement_duration_seconds: Histogram,
}

impl KeeperMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("cairn".into()), None)
            .expect("failed to create prometheus registry");

        let batches_opened_total = IntCounter::new(
            "batches_opened_total",
            "Total number of batches opened by the batch-cycle loop",
        )
        .expect("metric creation");
        registry
            .register(Box::new(batches_opened_total.clone()))
            .expect("metric registration");

        let batches_closed_total = IntCounter::new(
            "batches_closed_total",
            "Total number of batches closed by the batch-cycle loop",
        )
        .expect("metric creation");
        registry
            .register(Box::new(batches_closed_total.clone()))
            .expect("metric registration");

        let batches_settled_total = IntCounter::new(
            "batches_settled_total",
            "Total number of batches settled through executed proposals",
        )
        .expect("metric creation");
        registry
            .register(Box::new(batches_settled_total.clone()))
            .expect("metric registration");

        let proposals_submitted_total = IntCounter::new(
            "proposals_submitted_total",
            "Total number of settlement proposals submitted",
        )
        .expect("metric creation");
        registry
            .register(Box::new(proposals_submitted_total.clone()))
            .expect("metric registration");

        let proposals_executed_total = IntCounter::new(
            "proposals_executed_total",
            "Total number of settlement proposals executed",
        )
        .expect("metric creation");
        registry
            .register(Box::new(proposals_executed_total.clone()))
            .expect("metric registration");

        let proposals_cancelled_total = IntCounter::new(
            "proposals_cancelled_total",
            "Total number of settlement proposals cancelled",
        )
        .expect("metric creation");
        registry
            .register(Box::new(proposals_cancelled_total.clone()))
            .expect("metric registration");

        let mints_total = IntCounter::new(
            "mints_total",
            "Total number of institutional mints driven by this keeper",
        )
        .expect("metric creation");
        registry
            .register(Box::new(mints_total.clone()))
            .expect("metric registration");

        let redeems_total = IntCounter::new(
            "redeems_total",
            "Total number of redeem requests driven by this keeper",
        )
        .expect("metric creation");
        registry
            .register(Box::new(redeems_total.clone()))
            .expect("metric registration");

        let claims_total = IntCounter::new(
            "claims_total",
            "Total number of settled requests claimed by this keeper",
        )
        .expect("metric creation");
        registry
            .register(Box::new(claims_total.clone()))
            .expect("metric registration");

        let open_proposals = IntGauge::new(
            "open_proposals",
            "Number of settlement proposals currently awaiting execution",
        )
        .expect("metric creation");
        registry
            .register(Box::new(open_proposals.clone()))
            .expect("metric registration");

        let virtual_deposited = IntGauge::new(
            "virtual_deposited",
            "Sum of unsettled custody deposits across all vaults in token units",
        )
        .expect("metric creation");
        registry
            .register(Box::new(virtual_deposited.clone()))
            .expect("metric registration");

        let virtual_requested = IntGauge::new(
            "virtual_requested",
            "Sum of unsettled withdrawal requests across all vaults in token units",
        )
        .expect("metric creation");
        registry
            .register(Box::new(virtual_requested.clone()))
            .expect("metric registration");

        let settlement_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "settlement_duration_seconds",
                "End-to-end settlement execution latency in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(settlement_duration_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            batches_opened_total,
            batches_closed_total,
            batches_settled_total,
            proposals_submitted_total,
            proposals_executed_total,
            proposals_cancelled_total,
            mints_total,
            redeems_total,
            claims_total,
            open_proposals,
            virtual_deposited,
            virtual_requested,
            settlement_duration_seconds,
        }
    }

    /// Refreshes the point-in-time gauges from an engine snapshot.
    ///
    /// Called by the settlement loop after each pass so scrapes between
    /// passes see the book as of the last crank.
    pub fn refresh_book(&self, status: &EngineStatus, overviews: &[VaultOverview]) {
        self.open_proposals.set(status.open_proposals as i64);
        let deposited: u64 = overviews.iter().map(|v| v.deposited).sum();
        let requested: u64 = overviews.iter().map(|v| v.requested).sum();
        self.virtual_deposited.set(deposited as i64);
        self.virtual_requested.set(requested as i64);
    }

    /// Convenience wrapper over [`KeeperMetrics::refresh_book`] that reads
    /// the snapshot from a live engine.
    pub fn refresh_from(&self, engine: &Engine) {
        let status = engine.status();
        let overviews = engine.vault_overviews();
        self.refresh_book(&status, &overviews);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for KeeperMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics state passed to axum handlers via state extraction.
pub type SharedMetrics = Arc<KeeperMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
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
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_carries_the_cairn_namespace() {
        let metrics = KeeperMetrics::new();
        metrics.batches_opened_total.inc();
        metrics.open_proposals.set(3);
        metrics.settlement_duration_seconds.observe(0.02);

        let body = metrics.encode().expect("encode");
        assert!(body.contains("cairn_batches_opened_total 1"));
        assert!(body.contains("cairn_open_proposals 3"));
        assert!(body.contains("cairn_settlement_duration_seconds_bucket"));
    }
}
