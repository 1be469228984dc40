//! Prometheus metrics collector and HTTP handler.

use core::fmt;
use std::sync::{Arc, Mutex};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

use crate::stat::{LiveStat, TxStat};

#[derive(Debug, Clone, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    run: String,
}

/// Collector that exports live run totals to Prometheus.
pub struct MetricsCollector {
    registry: Registry,
    labels: RunLabels,
    txs: Family<RunLabels, Counter>,
    bytes: Family<RunLabels, Counter>,
}

impl MetricsCollector {
    /// Creates a new metrics collector for the given run and registers all
    /// metrics.
    pub fn new(run_id: impl Into<String>) -> Self {
        let mut registry = Registry::default();

        let txs = Family::<RunLabels, Counter>::default();
        registry.register(
            "txstorm_coordinator_txs",
            "Total number of transactions sent by all workers",
            txs.clone(),
        );

        let bytes = Family::<RunLabels, Counter>::default();
        registry.register(
            "txstorm_coordinator_bytes",
            "Total number of transaction bytes sent by all workers",
            bytes.clone(),
        );

        let labels = RunLabels { run: run_id.into() };
        // Expose zeroes before the first report arrives.
        txs.get_or_create(&labels);
        bytes.get_or_create(&labels);

        Self {
            registry,
            labels,
            txs,
            bytes,
        }
    }

    /// Updates TX stats.
    ///
    /// Counters only move forward by the delta from their current value.
    pub fn update_tx<S: TxStat>(&self, stat: &S) {
        let requests = stat.num_requests();
        let bytes_tx = stat.bytes_tx();

        let txs = self.txs.get_or_create(&self.labels);
        let current = txs.get();
        if requests > current {
            txs.inc_by(requests - current);
        }

        let bytes = self.bytes.get_or_create(&self.labels);
        let current = bytes.get();
        if bytes_tx > current {
            bytes.inc_by(bytes_tx - current);
        }
    }

    /// Encodes all metrics to Prometheus text format.
    pub fn encode(&self) -> Result<String, fmt::Error> {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry)?;
        Ok(buffer)
    }
}

/// Trait for stat sources that can be collected.
pub trait StatSource: Send + Sync {
    /// Updates the metrics collector with current stats.
    fn collect(&self, collector: &MetricsCollector);
}

impl StatSource for LiveStat {
    #[inline]
    fn collect(&self, collector: &MetricsCollector) {
        collector.update_tx(self);
    }
}

/// Shared state for the metrics handler.
pub struct MetricsState {
    /// Serializes delta updates of concurrent scrapes.
    collector: Mutex<MetricsCollector>,
    stat_source: Arc<dyn StatSource>,
}

impl MetricsState {
    /// Creates a new metrics state.
    pub fn new(run_id: impl Into<String>, stat_source: Arc<dyn StatSource>) -> Self {
        Self {
            collector: Mutex::new(MetricsCollector::new(run_id)),
            stat_source,
        }
    }

    /// Pulls the source and encodes the current metrics.
    pub fn render(&self) -> Result<String, fmt::Error> {
        let collector = self.collector.lock().unwrap_or_else(|err| err.into_inner());
        self.stat_source.collect(&collector);
        collector.encode()
    }
}

/// Creates a router for metrics endpoints.
pub fn router(state: Arc<MetricsState>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(state)
}

async fn metrics_handler(State(state): State<Arc<MetricsState>>) -> impl IntoResponse {
    match state.render() {
        Ok(body) => (
            StatusCode::OK,
            [(
                axum::http::header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            log::error!("failed to encode metrics: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Fixed(u64, u64);

    impl TxStat for Fixed {
        fn num_requests(&self) -> u64 {
            self.0
        }

        fn bytes_tx(&self) -> u64 {
            self.1
        }
    }

    #[test]
    fn test_encode_zero_before_reports() {
        let collector = MetricsCollector::new("r1");
        let text = collector.encode().unwrap();

        assert!(text.contains("txstorm_coordinator_txs_total{run=\"r1\"} 0"), "{text}");
        assert!(text.contains("txstorm_coordinator_bytes_total{run=\"r1\"} 0"), "{text}");
    }

    #[test]
    fn test_update_is_monotonic() {
        let collector = MetricsCollector::new("r1");
        collector.update_tx(&Fixed(100, 25_000));
        // A stale lower reading never moves the counter back.
        collector.update_tx(&Fixed(90, 20_000));

        let text = collector.encode().unwrap();
        assert!(text.contains("txstorm_coordinator_txs_total{run=\"r1\"} 100"), "{text}");
        assert!(text.contains("txstorm_coordinator_bytes_total{run=\"r1\"} 25000"), "{text}");
    }
}
