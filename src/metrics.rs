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

        metrics::describe_counter!("http_requests_total", "Total number of HTTP requests");
        metrics::describe_histogram!(
            "http_request_duration_seconds",
            "HTTP request duration in seconds"
        );
        metrics::describe_gauge!(
            "hub_connected_sessions",
            "Number of currently connected sessions"
        );
        metrics::describe_gauge!(
            "hub_subscribed_chats",
            "Number of chats with at least one live subscriber"
        );
        metrics::describe_counter!(
            "hub_messages_sent_total",
            "Total number of chat messages persisted and broadcast"
        );
        metrics::describe_counter!(
            "hub_sessions_evicted_total",
            "Total number of sessions evicted due to duplicate login or backpressure"
        );
        metrics::describe_counter!(
            "hub_broadcasts_total",
            "Total number of fan-out broadcasts performed by the hub loop"
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

pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let rendered = handle.render();
    (StatusCode::OK, rendered)
}

pub async fn track_request_metrics(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> impl IntoResponse {
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed();

    metrics::counter!("http_requests_total").increment(1);
    metrics::histogram!("http_request_duration_seconds").record(duration.as_secs_f64());

    response
}

pub fn record_message_sent() {
    metrics::counter!("hub_messages_sent_total").increment(1);
}

pub fn record_session_evicted() {
    metrics::counter!("hub_sessions_evicted_total").increment(1);
}

pub fn record_broadcast() {
    metrics::counter!("hub_broadcasts_total").increment(1);
}

pub fn set_connected_sessions(count: usize) {
    metrics::gauge!("hub_connected_sessions").set(count as f64);
}

pub fn set_subscribed_chats(count: usize) {
    metrics::gauge!("hub_subscribed_chats").set(count as f64);
}
