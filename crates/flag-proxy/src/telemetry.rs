//! OpenTelemetry instruments for inbound requests and flag decisions.
//!
//! Instruments come from the global meter provider, which exports over OTLP
//! when an endpoint is configured and is a no-op otherwise.

use std::time::Duration;

use http::{Method, StatusCode};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::KeyValue;

/// Route label for every flag check.
pub const FEATURE_ROUTE: &str = "/features/{feature}";

/// Decision latency buckets in seconds; lookups are served from memory.
const DECISION_BUCKETS: &[f64] = &[0.005, 0.01, 0.02, 0.03, 0.04, 0.05, 0.075, 0.1, 0.125, 0.15, 0.2];

#[derive(Clone)]
pub struct ProxyMetrics {
    request_count: Counter<u64>,
    request_duration: Histogram<f64>,
    feature_requests: Counter<u64>,
    feature_duration: Histogram<f64>,
    feature_errors: Counter<u64>,
}

impl ProxyMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_count: meter
                .u64_counter("http.server.request_count")
                .with_description("Total number of HTTP requests")
                .with_unit("{request}")
                .build(),
            request_duration: meter
                .f64_histogram("http.server.duration")
                .with_description("HTTP request duration in seconds")
                .with_unit("s")
                .build(),
            feature_requests: meter
                .u64_counter("feature_requests_total")
                .with_description("Total number of feature check requests, with state")
                .build(),
            feature_duration: meter
                .f64_histogram("feature_request_duration_seconds")
                .with_description("Duration of feature check requests in seconds")
                .with_unit("s")
                .with_boundaries(DECISION_BUCKETS.to_vec())
                .build(),
            feature_errors: meter
                .u64_counter("feature_request_errors_total")
                .with_description("Total number of errors during feature check requests")
                .build(),
        }
    }

    /// Instruments on the process-wide meter provider.
    pub fn global() -> Self {
        Self::new(&opentelemetry::global::meter("flag-proxy"))
    }

    pub fn record_request(&self, method: &Method, status: StatusCode, elapsed: Duration) {
        let attributes = [
            KeyValue::new("http.request.method", method.as_str().to_string()),
            KeyValue::new("http.route", FEATURE_ROUTE),
            KeyValue::new("http.response.status_code", i64::from(status.as_u16())),
        ];
        self.request_count.add(1, &attributes);
        self.request_duration.record(elapsed.as_secs_f64(), &attributes);
    }

    pub fn record_decision(&self, feature: &str, app_name: &str, enabled: bool, elapsed: Duration) {
        self.feature_requests.add(
            1,
            &[
                KeyValue::new("feature", feature.to_string()),
                KeyValue::new("app_name", app_name.to_string()),
                KeyValue::new("enabled", enabled.to_string()),
            ],
        );
        self.feature_duration.record(
            elapsed.as_secs_f64(),
            &[
                KeyValue::new("feature", feature.to_string()),
                KeyValue::new("app_name", app_name.to_string()),
            ],
        );
    }

    pub fn record_error(&self, error_type: &'static str) {
        self.feature_errors
            .add(1, &[KeyValue::new("error_type", error_type)]);
    }
}
