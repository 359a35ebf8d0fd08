use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize Prometheus metrics exporter
pub fn init_metrics() -> PrometheusHandle {
    let builder = PrometheusBuilder::new();

    let handle = builder
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    init_metric_descriptions();

    handle
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!(
        "apm_requests_total",
        "Total number of instrumented requests"
    );
    describe_histogram!(
        "apm_request_duration_seconds",
        "Instrumented request duration in seconds"
    );
    describe_counter!("apm_traces_total", "Total number of error traces recorded");
    describe_counter!(
        "apm_notifications_total",
        "Notification delivery attempts by platform and result"
    );
    describe_counter!(
        "apm_dispatch_abandoned_total",
        "Notification dispatches abandoned before delivery"
    );
    describe_gauge!("apm_info", "Instrumentation version information");

    gauge!("apm_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record one instrumented request and its duration
pub fn record_request(handler: &str, outcome: &str, elapsed_ms: u64) {
    counter!(
        "apm_requests_total",
        "handler" => handler.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);

    histogram!(
        "apm_request_duration_seconds",
        "handler" => handler.to_string(),
    )
    .record(elapsed_ms as f64 / 1000.0);
}

/// Record one persisted error trace
pub fn record_trace(exception_class: &str) {
    counter!(
        "apm_traces_total",
        "exception_class" => exception_class.to_string(),
    )
    .increment(1);
}

/// Record one notification delivery attempt
pub fn record_notification(platform: &str, result: &str) {
    counter!(
        "apm_notifications_total",
        "platform" => platform.to_string(),
        "result" => result.to_string(),
    )
    .increment(1);
}

/// Record a dispatch that ended before any delivery was attempted
pub fn record_dispatch_abandoned(reason: &str) {
    counter!(
        "apm_dispatch_abandoned_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
}
