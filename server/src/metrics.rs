use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        metrics::describe_counter!(
            "gateway_requests_total",
            "Total chat requests by endpoint type"
        );
        metrics::describe_counter!(
            "gateway_denials_total",
            "Requests refused before reaching upstream, by code"
        );
        metrics::describe_counter!(
            "gateway_upstream_attempts_total",
            "Upstream generation attempts, including retries"
        );
        metrics::describe_counter!(
            "writeback_dropped_total",
            "Write-pipeline enqueues dropped because a queue was full"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let metrics = handle.render();
    (StatusCode::OK, metrics)
}
