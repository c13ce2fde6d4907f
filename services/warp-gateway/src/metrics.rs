//! Prometheus metrics exposition
//!
//! The pool records its own counters (`dispatch_requests_total`,
//! `dispatch_attempts_total`, `health_probes_total`, …); this module
//! installs the process-wide recorder and shapes the duration histogram.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering.
///
/// `dispatch_duration_seconds` gets explicit buckets so it renders as a
/// histogram; the range covers sub-10ms cache-warm dispatches through the
/// 60-second read-idle ceiling.
pub fn install_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            metrics_exporter_prometheus::Matcher::Full("dispatch_duration_seconds".to_string()),
            &[
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
            ],
        )
        .expect("failed to set histogram buckets")
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}
