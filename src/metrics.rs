//! Metrics and tracing instrumentation.
//!
//! With the `metrics` feature the ledger records OpenTelemetry instruments
//! exported into a Prometheus registry; [`LedgerMetrics::render`] produces the
//! text exposition for a scrape endpoint owned by the embedding service. With
//! the `tracing` feature, [`tracing_helpers`] provides the spans wrapped
//! around adjustments, commits and SQL statements.

#[cfg(feature = "metrics")]
pub use prometheus_metrics::{LedgerMetrics, METRICS};

#[cfg(feature = "metrics")]
mod prometheus_metrics {
    use crate::model::MovementType;
    use once_cell::sync::Lazy;
    use opentelemetry::metrics::{Counter, Histogram, MeterProvider};
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::metrics::SdkMeterProvider;
    use prometheus::{Encoder, Registry, TextEncoder};
    use std::time::Duration;

    pub static METRICS: Lazy<LedgerMetrics> = Lazy::new(LedgerMetrics::init);

    pub struct LedgerMetrics {
        registry: Registry,
        _provider: SdkMeterProvider,
        adjustments_total: Counter<u64>,
        adjustment_failures_total: Counter<u64>,
        conflict_retries_total: Counter<u64>,
        adjust_duration: Histogram<f64>,
        alerts_total: Counter<u64>,
    }

    impl LedgerMetrics {
        pub fn init() -> Self {
            let registry = Registry::new();
            let exporter = opentelemetry_prometheus::exporter()
                .with_registry(registry.clone())
                .build()
                .expect("failed to build prometheus exporter");
            let provider = SdkMeterProvider::builder().with_reader(exporter).build();
            let meter = provider.meter("stockledger");

            let adjustments_total = meter
                .u64_counter("stockledger_adjustments_total")
                .with_description("Committed stock movements")
                .build();

            let adjustment_failures_total = meter
                .u64_counter("stockledger_adjustment_failures_total")
                .with_description("Adjustments rejected or abandoned, by error kind")
                .build();

            let conflict_retries_total = meter
                .u64_counter("stockledger_conflict_retries_total")
                .with_description("Optimistic version conflicts retried by the adjustment service")
                .build();

            let adjust_duration = meter
                .f64_histogram("stockledger_adjust_duration_seconds")
                .with_description("Wall time of adjust calls including retries")
                .build();

            let alerts_total = meter
                .u64_counter("stockledger_alerts_total")
                .with_description("Stock level transitions, by outcome")
                .build();

            Self {
                registry,
                _provider: provider,
                adjustments_total,
                adjustment_failures_total,
                conflict_retries_total,
                adjust_duration,
                alerts_total,
            }
        }

        pub fn record_adjustment(&self, movement_type: MovementType, elapsed: Duration) {
            let attrs = [KeyValue::new("type", movement_type.as_str())];
            self.adjustments_total.add(1, &attrs);
            self.adjust_duration.record(elapsed.as_secs_f64(), &attrs);
        }

        pub fn record_failure(&self, kind: &'static str) {
            self.adjustment_failures_total
                .add(1, &[KeyValue::new("kind", kind)]);
        }

        pub fn record_retry(&self) {
            self.conflict_retries_total.add(1, &[]);
        }

        pub fn record_alert(&self, outcome: &'static str) {
            self.alerts_total.add(1, &[KeyValue::new("outcome", outcome)]);
        }

        /// Prometheus text exposition of every ledger metric
        pub fn render(&self) -> String {
            let mut buffer = Vec::new();
            if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
                log::warn!("failed to encode metrics: {e}");
            }
            String::from_utf8(buffer).unwrap_or_default()
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{info_span, Span};

    pub fn adjust_span(product_id: &str, movement_type: &str) -> Span {
        info_span!("stockledger.adjust", product_id = %product_id, movement_type = %movement_type)
    }

    pub fn commit_span(product_id: &str, expected_version: i64) -> Span {
        info_span!("stockledger.commit", product_id = %product_id, expected_version)
    }

    pub fn reconcile_span(product_id: &str) -> Span {
        info_span!("stockledger.reconcile", product_id = %product_id)
    }

    pub fn execute_query_span(query: &str) -> Span {
        info_span!("stockledger.sql", statement = %first_line(query))
    }

    pub fn begin_transaction_span() -> Span {
        info_span!("stockledger.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        info_span!("stockledger.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        info_span!("stockledger.transaction.rollback")
    }

    pub fn acquire_connection_span() -> Span {
        info_span!("stockledger.connection.acquire")
    }

    fn first_line(query: &str) -> &str {
        query
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
    }
}
