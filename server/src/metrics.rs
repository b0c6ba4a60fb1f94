use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

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
            "ws_sessions_connected",
            "Number of currently connected duplex sessions"
        );
        metrics::describe_counter!(
            "ws_frames_sent_total",
            "Total number of frames sent to clients"
        );
        metrics::describe_counter!(
            "ws_frames_received_total",
            "Total number of frames received from clients"
        );
        metrics::describe_histogram!(
            "ws_append_latency_seconds",
            "Latency of event log append operations"
        );
        metrics::describe_histogram!(
            "ws_ack_latency_seconds",
            "Latency of ack/trim operations"
        );
        metrics::describe_histogram!(
            "llm_chat_stream_duration_seconds",
            "Duration of a chat stream from first token request to CHAT_DONE"
        );
        metrics::describe_counter!(
            "llm_chat_stream_total",
            "Total number of chat streams, labeled by provider/api/outcome"
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

/// Middleware to track HTTP request metrics
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

/// `delta` is +1 on connect, -1 on disconnect; the gauge tracks the
/// currently-connected count rather than a point-in-time sample.
pub fn record_session_connected(delta: i64) {
    let gauge = metrics::gauge!("ws_sessions_connected");
    if delta >= 0 {
        gauge.increment(delta as f64);
    } else {
        gauge.decrement((-delta) as f64);
    }
}

pub fn record_frame_sent() {
    metrics::counter!("ws_frames_sent_total").increment(1);
}

pub fn record_frame_received() {
    metrics::counter!("ws_frames_received_total").increment(1);
}

pub fn record_append_latency(duration: Duration) {
    metrics::histogram!("ws_append_latency_seconds").record(duration.as_secs_f64());
}

pub fn record_ack_latency(duration: Duration) {
    metrics::histogram!("ws_ack_latency_seconds").record(duration.as_secs_f64());
}

/// Labels describing one completed chat stream, for the
/// `llm_chat_stream_total` counter and the duration histogram.
pub struct LlmChatMetricLabels {
    pub provider: String,
    pub api: String,
    pub interrupted: bool,
    pub errored: bool,
}

pub fn record_llm_chat_stream(labels: &LlmChatMetricLabels, duration: Duration) {
    let outcome = if labels.errored {
        "error"
    } else if labels.interrupted {
        "interrupted"
    } else {
        "completed"
    };
    metrics::counter!(
        "llm_chat_stream_total",
        "provider" => labels.provider.clone(),
        "api" => labels.api.clone(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!(
        "llm_chat_stream_duration_seconds",
        "provider" => labels.provider.clone(),
        "api" => labels.api.clone()
    )
    .record(duration.as_secs_f64());
}
