//! OpenTelemetry instruments for the round engine. Without an installed
//! meter provider these record into the global no-op meter.

use once_cell::sync::Lazy;
use opentelemetry::metrics::{Counter, Histogram, Meter, Unit};
use opentelemetry::KeyValue;

static FED_METER: Lazy<Meter> = Lazy::new(|| opentelemetry::global::meter("fedlink_federation"));

pub struct FedMetrics {
    pub updates_total: Counter<u64>,
    pub rounds_completed: Counter<u64>,
    pub rejected_updates: Counter<u64>,
    pub aggregation_latency_ms: Histogram<f64>,
}

impl FedMetrics {
    pub fn new() -> Self {
        Self {
            updates_total: FED_METER.u64_counter("fed_updates_total").with_description("Accepted model updates").init(),
            rounds_completed: FED_METER.u64_counter("fed_rounds_completed_total").with_description("Completed aggregations").init(),
            rejected_updates: FED_METER
                .u64_counter("fed_rejected_updates_total")
                .with_description("Updates rejected as stale, unknown or unaggregatable")
                .init(),
            aggregation_latency_ms: FED_METER
                .f64_histogram("fed_aggregation_latency_ms")
                .with_description("Aggregation latency ms")
                .with_unit(Unit::new("ms"))
                .init(),
        }
    }

    pub fn record_rejection(&self, reason: &'static str) {
        self.rejected_updates.add(1, &[KeyValue::new("reason", reason)]);
    }
}

impl Default for FedMetrics {
    fn default() -> Self { Self::new() }
}
