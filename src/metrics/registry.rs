use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` macros can be used anywhere; the
/// `PrometheusHandle` is kept only to render the admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and describe every metric.
    /// Fails if a recorder is already installed.
    pub fn install() -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        // request path
        describe_counter!(
            "sidecar_http_requests_total",
            Unit::Count,
            "Total HTTP requests served, by direction"
        );
        describe_histogram!(
            "sidecar_http_request_duration_seconds",
            Unit::Seconds,
            "Request duration as seen by the caller"
        );

        // admission
        describe_counter!(
            "sidecar_admission_rejected_total",
            Unit::Count,
            "Inbound requests rejected at capacity"
        );
        describe_gauge!(
            "sidecar_admission_capacity",
            Unit::Count,
            "Current admission capacity (0 = unknown)"
        );
        describe_gauge!(
            "sidecar_inbound_in_flight",
            Unit::Count,
            "Inbound requests currently admitted"
        );

        // outbound
        describe_counter!(
            "sidecar_outbound_retries_total",
            Unit::Count,
            "Outbound attempts answered with too many requests"
        );
        describe_counter!(
            "sidecar_feedback_parse_errors_total",
            Unit::Count,
            "Responses with missing or malformed feedback headers"
        );

        // health
        describe_counter!(
            "sidecar_backend_transitions_total",
            Unit::Count,
            "Backend promotions and demotions"
        );
        describe_counter!(
            "sidecar_rtt_samples_total",
            Unit::Count,
            "RTT samples reported by the sampler"
        );

        // discovery
        describe_counter!(
            "sidecar_discovery_poll_total",
            Unit::Count,
            "Endpoint watcher resolve attempts"
        );
        describe_gauge!(
            "sidecar_discovered_backends",
            Unit::Count,
            "Backends known per service"
        );

        // connections
        describe_gauge!(
            "sidecar_connections_active",
            Unit::Count,
            "Open downstream connections, by listener"
        );
        describe_counter!(
            "sidecar_connections_total",
            Unit::Count,
            "Accepted downstream connections, by listener"
        );

        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
